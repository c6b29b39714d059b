//src/fastx.rs

use needletail::errors::{ParseError, ParseErrorKind};
use needletail::parser::{FastxReader, Format};
use rand::Rng;
use std::fs::File;
use std::io::{Read, Write};
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::types::DNASequence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceFormat {
    Fasta,
    Fastq,
}

/// Streams reads from a FASTA or FASTQ file through needletail. The format
/// and gzip compression are detected from the leading bytes.
pub struct SequenceReader {
    /// `None` for an empty input.
    reader: Option<Box<dyn FastxReader>>,
    path: PathBuf,
    format: Option<SequenceFormat>,
    done: bool,
}

pub fn open_sequences<P: AsRef<Path>>(path: P) -> Result<SequenceReader> {
    let path = path.as_ref();
    let f = File::open(path).map_err(|e| PipelineError::io(path, e))?;
    SequenceReader::from_reader(f, path)
}

fn parse_error(path: &Path, e: ParseError) -> PipelineError {
    PipelineError::parse(path, e.position.line as usize, e.to_string())
}

impl SequenceReader {
    pub fn from_reader<R: Read + Send + 'static>(reader: R, path: &Path) -> Result<Self> {
        let reader = match needletail::parse_fastx_reader(reader) {
            Ok(reader) => Some(reader),
            Err(e) if matches!(e.kind, ParseErrorKind::EmptyFile) => {
                log::debug!("{} is empty", path.display());
                None
            }
            Err(e) => return Err(parse_error(path, e)),
        };
        Ok(Self {
            reader,
            path: path.to_path_buf(),
            format: None,
            done: false,
        })
    }

    pub fn format(&self) -> Option<SequenceFormat> {
        self.format
    }

    fn next_record(&mut self) -> Result<Option<DNASequence>> {
        let Some(reader) = self.reader.as_mut() else {
            return Ok(None);
        };
        let record = match reader.next() {
            None => return Ok(None),
            Some(record) => record.map_err(|e| parse_error(&self.path, e))?,
        };

        self.format = Some(match record.format() {
            Format::Fasta => SequenceFormat::Fasta,
            Format::Fastq => SequenceFormat::Fastq,
        });
        let header_line = String::from_utf8_lossy(record.id()).into_owned();
        Ok(Some(DNASequence {
            id: header_line.split_whitespace().next().unwrap_or("").to_string(),
            seq: String::from_utf8_lossy(&record.seq()).into_owned(),
            header_line,
        }))
    }
}

impl Iterator for SequenceReader {
    type Item = Result<DNASequence>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = self.next_record();
        if !matches!(next, Ok(Some(_))) {
            self.done = true;
        }
        next.transpose()
    }
}

/// Copies FASTA reads to `out`, prefixing each header with `label|<taxid>|`
/// so the read can later be labeled from its header. Returns the read count.
pub fn write_labeled_fasta<I, W>(reads: I, taxid: i64, out: &mut W) -> Result<u64>
where
    I: IntoIterator<Item = Result<DNASequence>>,
    W: Write + ?Sized,
{
    let mut written = 0u64;
    for read in reads {
        let read = read?;
        writeln!(out, ">label|{taxid}|{}", read.header_line)?;
        writeln!(out, "{}", read.seq)?;
        written += 1;
    }
    Ok(written)
}

/// Writes reads as FASTA (`>id` headers) after cutting a uniformly drawn
/// number of bases in `trim` off each 3' end. Reads never shrink below one
/// base. Returns the read count.
pub fn write_trimmed_fasta<I, W, G>(
    reads: I,
    trim: RangeInclusive<usize>,
    rng: &mut G,
    out: &mut W,
) -> Result<u64>
where
    I: IntoIterator<Item = Result<DNASequence>>,
    W: Write + ?Sized,
    G: Rng,
{
    if trim.is_empty() {
        return Err(PipelineError::InvalidArgument(format!(
            "trim range {}..={} is empty",
            trim.start(),
            trim.end()
        )));
    }
    let mut written = 0u64;
    for read in reads {
        let read = read?;
        let cut = rng.random_range(trim.clone());
        let keep = read.seq.len().saturating_sub(cut).max(1).min(read.seq.len());
        writeln!(out, ">{}", read.id)?;
        writeln!(out, "{}", &read.seq[..keep])?;
        written += 1;
    }
    Ok(written)
}
