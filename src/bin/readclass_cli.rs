use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use readclass::aggregate::Replicates;
use readclass::config::{EncodingKind, HeaderSetting, PipelineConfig, Stage};
use readclass::labels::{LabelIndex, NameTable};
use readclass::tokenizer::Encoding;
use readclass::vocab::{IdBase, Vocabulary};
use readclass::{
    aggregate_predictions, count_predictions, encode_paired, encode_reads, label_fasta,
    label_fasta_map, profile_predictions, trim_reads, PredictMode, RecordMode,
};

/// Read encoding and prediction reporting for k-mer taxonomic classifiers.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON configuration; explicit flags override its values.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert FASTA/FASTQ reads into a record file.
    Encode {
        #[arg(short, long)]
        input: PathBuf,
        /// Second mate file for paired-end reads.
        #[arg(long)]
        input2: Option<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
        /// Label every record from its header taxid.
        #[arg(long)]
        training: bool,
        #[arg(long)]
        vocab: Option<PathBuf>,
        #[arg(long)]
        labels: Option<PathBuf>,
        #[arg(short = 'k', long)]
        kmer_size: Option<usize>,
        #[arg(long, value_enum)]
        encoding: Option<CliEncoding>,
        /// Reserve token id 0 for padding.
        #[arg(long)]
        pad_reserved: bool,
        /// Header preset: kmer, art or metasim.
        #[arg(long)]
        header: Option<String>,
        /// Skip the reverse-complement records.
        #[arg(long)]
        single_strand: bool,
        #[arg(short = 't', long)]
        threads: Option<usize>,
    },
    /// Aggregate a model's probability matrix.
    Predict {
        /// Whitespace-delimited probabilities, one row per record.
        #[arg(short, long)]
        matrix: PathBuf,
        /// Output prefix.
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, value_enum, default_value_t = CliPredictMode::TopN)]
        mode: CliPredictMode,
        #[arg(long)]
        num_classes: Option<usize>,
        #[arg(long)]
        top_n: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long, value_enum)]
        replicates: Option<CliReplicates>,
        /// Rows are one per read, without reverse-complement replicates.
        #[arg(long)]
        single_strand: bool,
        /// Report taxids instead of labels.
        #[arg(long)]
        translate: bool,
        #[arg(long)]
        labels: Option<PathBuf>,
    },
    /// Build a community profile from per-read predictions.
    Profile {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        names: Option<PathBuf>,
        #[arg(long)]
        min_count: Option<u64>,
        #[arg(long)]
        min_prob: Option<f64>,
        #[arg(long)]
        min_reads_prob: Option<f64>,
    },
    /// Count reads per taxon without thresholds.
    Count {
        #[arg(short, long)]
        input: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        names: Option<PathBuf>,
    },
    /// Prefix FASTA headers with `label|<taxid>|`.
    LabelFasta {
        #[arg(short, long, required_unless_present = "map", requires = "taxid")]
        input: Option<PathBuf>,
        /// Output file, or the output directory with `--map`.
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long)]
        taxid: Option<i64>,
        /// `genome<TAB>taxid` list; each genome is written to `label_<name>`.
        #[arg(short, long, conflicts_with_all = ["input", "taxid"])]
        map: Option<PathBuf>,
    },
    /// Cut a random number of bases off the 3' end of every read.
    Trim {
        #[arg(short, long)]
        input: PathBuf,
        /// FASTA output.
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value_t = 0)]
        min_trim: usize,
        #[arg(long, default_value_t = 75)]
        max_trim: usize,
        /// Seed for reproducible trimming.
        #[arg(long)]
        seed: Option<u64>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CliEncoding {
    Kmer,
    OneHot,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CliReplicates {
    Single,
    DoubleStrand,
    PairedEnd,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CliPredictMode {
    Prob,
    TopN,
    SingleClass,
    PairedClass,
}

fn spinner(color: &str, msg: &str) -> Result<ProgressBar> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"])
            .template(&format!("{{spinner:.{color}}} {{msg}}"))?,
    );
    spinner.set_message(msg.to_string());
    Ok(spinner)
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::from_json_file(path)
            .with_context(|| format!("Loading configuration {}", path.display())),
        None => Ok(PipelineConfig::default()),
    }
}

fn load_names(config: &PipelineConfig) -> Result<NameTable> {
    let path = config.name_path()?;
    NameTable::load(path).with_context(|| format!("Loading name table {}", path.display()))
}

fn run_encode(mut config: PipelineConfig, command: Command) -> Result<()> {
    let Command::Encode {
        input,
        input2,
        output,
        training,
        vocab,
        labels,
        kmer_size,
        encoding,
        pad_reserved,
        header,
        single_strand,
        threads,
    } = command
    else {
        bail!("not an encode command");
    };

    config.vocab_path = vocab.or(config.vocab_path);
    config.label_path = labels.or(config.label_path);
    config.k = kmer_size.unwrap_or(config.k);
    config.threads = threads.or(config.threads);
    if let Some(encoding) = encoding {
        config.encoding = match encoding {
            CliEncoding::Kmer => EncodingKind::Kmer,
            CliEncoding::OneHot => EncodingKind::OneHot,
        };
    }
    if pad_reserved {
        config.id_base = IdBase::PadReserved;
    }
    if let Some(header) = header {
        config.header_convention = HeaderSetting::Preset(header);
    }
    if single_strand {
        config.strands_average = false;
    }
    config.validate(if training { Stage::EncodeTraining } else { Stage::EncodePredict })?;

    if let Some(threads) = config.threads {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build_global()
            .context("Configuring the rayon thread pool")?;
    }

    let spinner_load = spinner("blue", "Loading vocabulary and labels...")?;
    let encoder = match config.encoding {
        EncodingKind::Kmer => {
            let path = config.vocab_path()?;
            let vocab = Vocabulary::load(path, config.k, config.id_base)
                .with_context(|| format!("Loading vocabulary {}", path.display()))?;
            Encoding::kmer(Arc::new(vocab))
        }
        EncodingKind::OneHot => Encoding::one_hot(),
    };
    let label_index = if training {
        let path = config.label_path()?;
        Some(LabelIndex::load(path).with_context(|| format!("Loading labels {}", path.display()))?)
    } else {
        None
    };
    let mode = match &label_index {
        Some(labels) => RecordMode::Training {
            labels,
            header: config.header_convention.resolve()?,
        },
        None => RecordMode::Predict,
    };
    spinner_load.finish_with_message("Inputs loaded.");

    let spinner_encode = spinner("green", "Encoding reads...")?;
    let summary = match &input2 {
        Some(mates) => encode_paired(&input, mates, &output, &encoder, mode, config.strands_average),
        None => encode_reads(&input, &output, &encoder, mode, config.strands_average),
    }
    .with_context(|| format!("Encoding {}", input.display()))?;
    spinner_encode.finish_with_message(format!(
        "Wrote {} records for {} reads to {}",
        summary.records,
        summary.fragments,
        output.display()
    ));
    Ok(())
}

fn run_predict(mut config: PipelineConfig, command: Command) -> Result<()> {
    let Command::Predict {
        matrix,
        output,
        mode,
        num_classes,
        top_n,
        batch_size,
        replicates,
        single_strand,
        translate,
        labels,
    } = command
    else {
        bail!("not a predict command");
    };

    config.num_classes = num_classes.or(config.num_classes);
    config.top_n = top_n.unwrap_or(config.top_n);
    config.batch_size = batch_size.unwrap_or(config.batch_size);
    config.label_path = labels.or(config.label_path);
    config.translate |= translate;
    if let Some(replicates) = replicates {
        config.replicates = match replicates {
            CliReplicates::Single => Replicates::Single,
            CliReplicates::DoubleStrand => Replicates::DoubleStrand,
            CliReplicates::PairedEnd => Replicates::PairedEnd,
        };
    }
    if single_strand {
        config.strands_average = false;
    }
    let mode = match mode {
        CliPredictMode::Prob => PredictMode::Prob,
        CliPredictMode::TopN => PredictMode::TopN(config.top_n),
        CliPredictMode::SingleClass => PredictMode::SingleClass,
        CliPredictMode::PairedClass => PredictMode::PairedClass,
    };
    config.validate(Stage::Predict(mode))?;

    let label_index = if config.translate {
        let path = config.label_path()?;
        Some(LabelIndex::load(path).with_context(|| format!("Loading labels {}", path.display()))?)
    } else {
        None
    };

    let spinner_predict = spinner("green", "Aggregating predictions...")?;
    let reads = aggregate_predictions(&matrix, &output, &config, mode, label_index.as_ref())
        .with_context(|| format!("Aggregating {}", matrix.display()))?;
    spinner_predict.finish_with_message(format!("Reported {reads} reads."));
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        command @ Command::Encode { .. } => run_encode(config, command)?,
        command @ Command::Predict { .. } => run_predict(config, command)?,
        Command::Profile {
            input,
            output,
            names,
            min_count,
            min_prob,
            min_reads_prob,
        } => {
            config.name_path = names.or(config.name_path);
            config.min_count = min_count.unwrap_or(config.min_count);
            config.min_prob = min_prob.unwrap_or(config.min_prob);
            config.min_reads_prob = min_reads_prob.unwrap_or(config.min_reads_prob);
            config.validate(Stage::Profile)?;
            let names = load_names(&config)?;

            let spinner_profile = spinner("yellow", "Building community profile...")?;
            let taxa = profile_predictions(&input, &output, &names, config.thresholds())
                .with_context(|| format!("Profiling {}", input.display()))?;
            spinner_profile.finish_with_message(format!("Profile of {taxa} taxa written."));
        }
        Command::Count {
            input,
            output,
            names,
        } => {
            config.name_path = names.or(config.name_path);
            let names = load_names(&config)?;

            let spinner_count = spinner("yellow", "Counting reads...")?;
            let taxa = count_predictions(&input, &output, &names)
                .with_context(|| format!("Counting {}", input.display()))?;
            spinner_count.finish_with_message(format!("Counted reads of {taxa} taxa."));
        }
        Command::LabelFasta {
            input,
            output,
            taxid,
            map,
        } => {
            let spinner_label = spinner("cyan", "Labelling FASTA headers...")?;
            match (map, input, taxid) {
                (Some(map), _, _) => {
                    let genomes = label_fasta_map(&map, &output)
                        .with_context(|| format!("Labelling genomes of {}", map.display()))?;
                    spinner_label.finish_with_message(format!("Labelled {} genomes.", genomes.len()));
                }
                (None, Some(input), Some(taxid)) => {
                    let reads = label_fasta(&input, &output, taxid)
                        .with_context(|| format!("Labelling {}", input.display()))?;
                    spinner_label.finish_with_message(format!("Labelled {reads} reads."));
                }
                _ => bail!("label-fasta needs --map or both --input and --taxid"),
            }
        }
        Command::Trim {
            input,
            output,
            min_trim,
            max_trim,
            seed,
        } => {
            let seed = seed.unwrap_or_else(|| rand::rng().random());
            log::info!("Trimming with seed {seed}");
            let mut rng = StdRng::seed_from_u64(seed);

            let spinner_trim = spinner("cyan", "Trimming reads...")?;
            let reads = trim_reads(&input, &output, min_trim..=max_trim, &mut rng)
                .with_context(|| format!("Trimming {}", input.display()))?;
            spinner_trim.finish_with_message(format!("Trimmed {reads} reads."));
        }
    }

    let spinner_done = spinner("cyan", "All done!")?;
    spinner_done.finish_with_message("All done!");
    Ok(())
}
