//src/config.rs

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use crate::aggregate::{PredictMode, Replicates};
use crate::error::{PipelineError, Result};
use crate::profile::ProfileThresholds;
use crate::tokenizer::HeaderConvention;
use crate::vocab::IdBase;

/// Largest supported k-mer length.
pub const MAX_K: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingKind {
    #[default]
    Kmer,
    OneHot,
}

/// A named header preset (`kmer`, `art`, `metasim`) or an explicit convention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderSetting {
    Preset(String),
    Custom(HeaderConvention),
}

impl Default for HeaderSetting {
    fn default() -> Self {
        HeaderSetting::Preset("kmer".to_string())
    }
}

impl HeaderSetting {
    pub fn resolve(&self) -> Result<HeaderConvention> {
        match self {
            HeaderSetting::Preset(name) => HeaderConvention::preset(name).ok_or_else(|| {
                PipelineError::InvalidArgument(format!("unknown header convention {name:?}"))
            }),
            HeaderSetting::Custom(convention) => Ok(*convention),
        }
    }
}

/// Which part of the pipeline a configuration is about to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    EncodeTraining,
    EncodePredict,
    Predict(PredictMode),
    Profile,
}

/// Every tunable of the pipeline. Missing JSON fields take their defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub k: usize,
    pub vocab_path: Option<PathBuf>,
    pub label_path: Option<PathBuf>,
    /// `name<TAB>id` table used by the profiler and the read counter.
    pub name_path: Option<PathBuf>,
    pub min_count: u64,
    pub min_prob: f64,
    pub min_reads_prob: f64,
    pub top_n: usize,
    /// Average the forward and reverse-complement predictions of a read.
    pub strands_average: bool,
    /// Report taxids instead of zero-based labels.
    pub translate: bool,
    pub encoding: EncodingKind,
    pub id_base: IdBase,
    pub header_convention: HeaderSetting,
    pub batch_size: usize,
    pub num_classes: Option<usize>,
    /// Fixed pad length; batches pad to their longest read when unset.
    pub max_len: Option<usize>,
    pub replicates: Replicates,
    /// Worker threads for encoding; rayon's default when unset.
    pub threads: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            k: 12,
            vocab_path: None,
            label_path: None,
            name_path: None,
            min_count: 0,
            min_prob: 50.0,
            min_reads_prob: 50.0,
            top_n: 5,
            strands_average: true,
            translate: false,
            encoding: EncodingKind::Kmer,
            id_base: IdBase::Zero,
            header_convention: HeaderSetting::default(),
            batch_size: 32,
            num_classes: None,
            max_len: None,
            replicates: Replicates::DoubleStrand,
            threads: None,
        }
    }
}

fn require<'a>(value: &'a Option<PathBuf>, field: &str) -> Result<&'a Path> {
    value
        .as_deref()
        .ok_or_else(|| PipelineError::InvalidArgument(format!("{field} is required")))
}

impl PipelineConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
        let config: PipelineConfig =
            serde_json::from_reader(BufReader::new(file)).map_err(|source| PipelineError::Config {
                path: path.to_path_buf(),
                source,
            })?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Rows averaged into one read: the replicate layout, halved when the
    /// reverse-complement strand is not part of the stream.
    pub fn group_size(&self) -> usize {
        self.strand_group(self.replicates)
    }

    /// Rows averaged into one call by `mode`, which may override the configured layout.
    pub fn predict_group_size(&self, mode: PredictMode) -> usize {
        self.strand_group(mode.layout(self.replicates))
    }

    fn strand_group(&self, layout: Replicates) -> usize {
        let size = layout.group_size();
        if self.strands_average {
            size
        } else {
            (size / 2).max(1)
        }
    }

    pub fn thresholds(&self) -> ProfileThresholds {
        ProfileThresholds {
            min_count: self.min_count,
            min_prob: self.min_prob,
            min_reads_prob: self.min_reads_prob,
        }
    }

    pub fn vocab_path(&self) -> Result<&Path> {
        require(&self.vocab_path, "vocab_path")
    }

    pub fn label_path(&self) -> Result<&Path> {
        require(&self.label_path, "label_path")
    }

    pub fn name_path(&self) -> Result<&Path> {
        require(&self.name_path, "name_path")
    }

    pub fn num_classes(&self) -> Result<usize> {
        self.num_classes
            .ok_or_else(|| PipelineError::InvalidArgument("num_classes is required".into()))
    }

    pub fn validate(&self, stage: Stage) -> Result<()> {
        if self.k == 0 || self.k > MAX_K {
            return Err(PipelineError::InvalidArgument(format!(
                "k must be between 1 and {MAX_K}, got {}",
                self.k
            )));
        }
        let group_size = match stage {
            Stage::Predict(mode) => self.predict_group_size(mode),
            _ => self.group_size(),
        };
        if self.batch_size == 0 || self.batch_size % group_size != 0 {
            return Err(PipelineError::InvalidArgument(format!(
                "batch_size {} must be a positive multiple of the replicate group size {group_size}",
                self.batch_size
            )));
        }
        for (name, value) in [
            ("min_prob", self.min_prob),
            ("min_reads_prob", self.min_reads_prob),
        ] {
            if !value.is_finite() {
                return Err(PipelineError::InvalidArgument(format!("{name} must be finite")));
            }
        }
        if self.max_len == Some(0) {
            return Err(PipelineError::InvalidArgument("max_len must be positive".into()));
        }
        self.header_convention.resolve()?;

        match stage {
            Stage::EncodeTraining | Stage::EncodePredict => {
                if self.encoding == EncodingKind::Kmer {
                    require(&self.vocab_path, "vocab_path")?;
                }
                if stage == Stage::EncodeTraining {
                    require(&self.label_path, "label_path")?;
                }
            }
            Stage::Predict(mode) => {
                let num_classes = self.num_classes()?;
                if let PredictMode::TopN(n) = mode {
                    if n == 0 || n > num_classes {
                        return Err(PipelineError::InvalidArgument(format!(
                            "top_n must be between 1 and {num_classes}, got {n}"
                        )));
                    }
                }
                if self.translate {
                    require(&self.label_path, "label_path")?;
                }
            }
            Stage::Profile => {
                require(&self.name_path, "name_path")?;
            }
        }
        Ok(())
    }
}
