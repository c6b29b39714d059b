// src/lib.rs
pub mod aggregate;
pub mod config;
pub mod error;
pub mod fastx;
pub mod labels;
pub mod output;
pub mod profile;
pub mod record;
pub mod tokenizer;
pub mod types;
pub mod vocab;

use rand::Rng;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use crate::aggregate::{Aggregator, MatrixBatches};
use crate::config::Stage;
use crate::error::{PipelineError, Result};
use crate::fastx::{open_sequences, write_labeled_fasta, write_trimmed_fasta};
use crate::labels::{LabelIndex, NameTable};
use crate::output::{
    with_suffix, write_atomic, write_class_calls, write_matrix, write_predictions, write_top_n,
};
use crate::profile::{count_reads, write_read_counts, ProfileThresholds, TaxonAccumulator};
use crate::record::RecordWriter;
use crate::tokenizer::{Encoding, HeaderConvention};
use crate::types::{DNASequence, Record};
use crate::vocab::reverse_complement;

pub use crate::aggregate::PredictMode;
pub use crate::config::PipelineConfig;

/// Reads encoded in parallel per chunk before the chunk is written out.
const CHUNK_SIZE: usize = 10_000;

/// How an encode run labels its records.
#[derive(Debug, Clone, Copy)]
pub enum RecordMode<'a> {
    /// The taxid is parsed from each read header and mapped to its label.
    Training {
        labels: &'a LabelIndex,
        header: HeaderConvention,
    },
    /// Records carry no label.
    Predict,
}

/// Counts reported by an encode run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeSummary {
    /// Reads (or read pairs) consumed from the input.
    pub fragments: u64,
    pub records: u64,
}

fn fragment_label(fragment: &[DNASequence], mode: RecordMode) -> Result<Option<i64>> {
    match (mode, fragment.first()) {
        (RecordMode::Training { labels, header }, Some(read)) => {
            let label = header
                .parse_taxid(read)
                .and_then(|taxid| labels.require_label(taxid))
                .map_err(|e| PipelineError::in_read(&read.id, e))?;
            Ok(Some(i64::from(label)))
        }
        _ => Ok(None),
    }
}

/// The same read on the opposite strand.
fn reverse_strand(read: &DNASequence) -> Result<DNASequence> {
    let rc = reverse_complement(read.seq.to_ascii_uppercase().as_bytes())
        .map_err(|e| PipelineError::in_read(&read.id, e))?;
    Ok(DNASequence {
        seq: String::from_utf8_lossy(&rc).into_owned(),
        ..read.clone()
    })
}

/// All records of one fragment, in `r1, rc(r1), r2, rc(r2)` order.
fn encode_fragment(
    fragment: &[DNASequence],
    encoding: &Encoding,
    mode: RecordMode,
    both_strands: bool,
) -> Result<Vec<Record>> {
    let label = fragment_label(fragment, mode)?;
    let mut records = Vec::with_capacity(fragment.len() * 2);
    for read in fragment {
        records.push(Record {
            read: encoding.encode_read(read)?,
            label,
        });
        if both_strands {
            records.push(Record {
                read: encoding.encode_read(&reverse_strand(read)?)?,
                label,
            });
        }
    }
    Ok(records)
}

/// Encodes fragments chunk by chunk on the rayon pool and writes them in input order.
fn write_fragments<I>(
    fragments: I,
    output: &Path,
    encoding: &Encoding,
    mode: RecordMode,
    both_strands: bool,
) -> Result<EncodeSummary>
where
    I: Iterator<Item = Result<Vec<DNASequence>>>,
{
    write_atomic(output, |out| {
        let mut writer = RecordWriter::new(out);
        let mut summary = EncodeSummary::default();
        let mut chunk: Vec<Vec<DNASequence>> = Vec::with_capacity(CHUNK_SIZE);
        let mut fragments = fragments.peekable();

        while fragments.peek().is_some() {
            chunk.clear();
            for fragment in fragments.by_ref().take(CHUNK_SIZE) {
                chunk.push(fragment?);
            }
            let encoded: Vec<Vec<Record>> = chunk
                .par_iter()
                .map(|fragment| encode_fragment(fragment, encoding, mode, both_strands))
                .collect::<Result<_>>()?;
            for record in encoded.iter().flatten() {
                writer.write_record(record)?;
            }
            summary.fragments += chunk.len() as u64;
            log::debug!("Encoded chunk of {} fragments", chunk.len());
        }

        summary.records = writer.records_written();
        writer.into_inner()?;
        Ok(summary)
    })
}

/// Converts a FASTA/FASTQ file into a record file.
pub fn encode_reads(
    input: &Path,
    output: &Path,
    encoding: &Encoding,
    mode: RecordMode,
    both_strands: bool,
) -> Result<EncodeSummary> {
    let reads = open_sequences(input)?.map(|read| read.map(|r| vec![r]));
    let summary = write_fragments(reads, output, encoding, mode, both_strands)?;
    log::info!(
        "Encoded {} reads into {} records ({})",
        summary.fragments,
        summary.records,
        output.display()
    );
    Ok(summary)
}

/// Converts two mate files into one record file. Each pair is labelled from
/// its first mate; the files must hold the same number of reads.
pub fn encode_paired(
    r1: &Path,
    r2: &Path,
    output: &Path,
    encoding: &Encoding,
    mode: RecordMode,
    both_strands: bool,
) -> Result<EncodeSummary> {
    let mut mates1 = open_sequences(r1)?;
    let mut mates2 = open_sequences(r2)?;
    let pairs = std::iter::from_fn(move || match (mates1.next(), mates2.next()) {
        (None, None) => None,
        (Some(a), Some(b)) => Some(a.and_then(|a| b.map(|b| vec![a, b]))),
        _ => Some(Err(PipelineError::InvalidArgument(
            "mate files hold different numbers of reads".into(),
        ))),
    });
    let summary = write_fragments(pairs, output, encoding, mode, both_strands)?;
    log::info!(
        "Encoded {} read pairs into {} records ({})",
        summary.fragments,
        summary.records,
        output.display()
    );
    Ok(summary)
}

/// Reduces a model's probability matrix to the requested outputs under `prefix`.
/// Returns the number of reads reported.
/// The row grouping comes from `config` through [`PredictMode::layout`], so
/// pair calls always average all four rows of a read pair.
pub fn aggregate_predictions(
    matrix_path: &Path,
    prefix: &Path,
    config: &PipelineConfig,
    mode: PredictMode,
    translate: Option<&LabelIndex>,
) -> Result<usize> {
    config.validate(Stage::Predict(mode))?;
    let aggregator =
        Aggregator::with_group_size(config.num_classes()?, config.predict_group_size(mode))?;
    let batch_size = config.batch_size;
    let file = File::open(matrix_path).map_err(|e| PipelineError::io(matrix_path, e))?;
    let batches = MatrixBatches::new(
        BufReader::new(file),
        matrix_path,
        aggregator.num_classes(),
        batch_size,
    )?;

    let reads = match mode {
        PredictMode::Prob => {
            let matrix = aggregator.probabilities(batches)?;
            write_atomic(with_suffix(prefix, "probability.txt"), |out| {
                write_matrix(out, &matrix)
            })?;
            matrix.nrows()
        }
        PredictMode::TopN(n) => {
            let calls = aggregator.top_n_calls(batches, n)?;
            write_top_n(prefix, &calls)?;
            calls.indices.nrows()
        }
        PredictMode::SingleClass | PredictMode::PairedClass => {
            let tag = if mode == PredictMode::SingleClass { "single" } else { "paired" };
            let calls = aggregator.best_calls(batches, translate)?;
            write_class_calls(prefix, tag, &calls)?;
            write_atomic(with_suffix(prefix, "prediction.txt"), |out| {
                write_predictions(out, &calls)
            })?;
            calls.len()
        }
    };
    log::info!("Reported {reads} reads under {}", prefix.display());
    Ok(reads)
}

/// Builds and writes the community profile of a `taxon<TAB>confidence` file.
/// Returns the number of taxa reported.
pub fn profile_predictions(
    predictions: &Path,
    output: &Path,
    names: &NameTable,
    thresholds: ProfileThresholds,
) -> Result<usize> {
    let file = File::open(predictions).map_err(|e| PipelineError::io(predictions, e))?;
    let mut accumulator = TaxonAccumulator::new(thresholds);
    accumulator.read_predictions(BufReader::new(file), predictions)?;
    let profile = accumulator.filter().sort();
    let taxa = profile.records().len();
    profile.write(output, names)?;
    Ok(taxa)
}

/// Writes plain per-taxon read counts of a prediction or label file.
pub fn count_predictions(input: &Path, output: &Path, names: &NameTable) -> Result<usize> {
    let file = File::open(input).map_err(|e| PipelineError::io(input, e))?;
    let counts = count_reads(BufReader::new(file), input)?;
    write_atomic(output, |out| write_read_counts(out, &counts, names))?;
    Ok(counts.len())
}

/// Copies a FASTA file, prefixing each header with `label|<taxid>|`.
pub fn label_fasta(input: &Path, output: &Path, taxid: i64) -> Result<u64> {
    let reads = open_sequences(input)?;
    let written = write_atomic(output, |out| write_labeled_fasta(reads, taxid, out))?;
    log::info!("Labelled {written} reads with taxid {taxid}");
    Ok(written)
}

/// Labels every genome listed in a `genome<TAB>taxid` map file, writing
/// `label_<file name>` into `output_dir`. Returns the output paths.
pub fn label_fasta_map(map_path: &Path, output_dir: &Path) -> Result<Vec<PathBuf>> {
    let file = File::open(map_path).map_err(|e| PipelineError::io(map_path, e))?;
    let mut outputs = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| PipelineError::io(map_path, e))?;
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        let mut fields = line.split('\t');
        let (Some(genome), Some(taxid)) = (fields.next(), fields.next()) else {
            return Err(PipelineError::parse(map_path, idx + 1, "expected genome<TAB>taxid"));
        };
        let taxid: i64 = taxid.trim().parse().map_err(|_| {
            PipelineError::parse(map_path, idx + 1, format!("invalid taxid {taxid:?}"))
        })?;
        let genome = Path::new(genome);
        let Some(name) = genome.file_name() else {
            return Err(PipelineError::parse(map_path, idx + 1, "genome entry has no file name"));
        };
        let mut label_name = std::ffi::OsString::from("label_");
        label_name.push(name);
        let output = output_dir.join(label_name);
        label_fasta(genome, &output, taxid)?;
        outputs.push(output);
    }
    log::info!("Labelled {} genomes from {}", outputs.len(), map_path.display());
    Ok(outputs)
}

/// Simulates variable-length reads: each read loses a random number of
/// 3' bases drawn from `trim` and is written as FASTA. Returns the read count.
pub fn trim_reads<G: Rng>(
    input: &Path,
    output: &Path,
    trim: RangeInclusive<usize>,
    rng: &mut G,
) -> Result<u64> {
    let reads = open_sequences(input)?;
    let written = write_atomic(output, |out| write_trimmed_fasta(reads, trim, rng, out))?;
    log::info!("Trimmed {written} reads into {}", output.display());
    Ok(written)
}
