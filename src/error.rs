// src/error.rs

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Every failure the pipeline can surface. Nothing is retried; callers abort the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("cannot access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Stream(#[from] io::Error),

    /// A malformed line in one of the text inputs (vocabulary, label table, matrices...).
    #[error("{}:{line}: {message}", .path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("invalid nucleotide {:?} at position {position}", char::from(*.base))]
    InvalidBase { base: u8, position: usize },

    /// Tokenizer failure tagged with the read it happened on.
    #[error("read {read_id}: {source}")]
    InRead {
        read_id: String,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("record #{index}: {message}")]
    Record { index: u64, message: String },

    #[error("batch of {rows} rows cannot be split into replicate groups of {group_size}")]
    Shape { rows: usize, group_size: usize },

    #[error("expected {expected} columns, found {found}")]
    Dimension { expected: usize, found: usize },

    #[error("probability row {row}: {message}")]
    Probability { row: usize, message: String },

    #[error("invalid configuration {}: {source}", .path.display())]
    Config {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("label {0} has no entry in the label index")]
    UnknownLabel(i64),

    #[error("taxid {0} has no entry in the label index")]
    UnknownTaxon(i64),

    #[error("no name registered for taxon {0:?}")]
    UnknownName(String),
}

impl PipelineError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn parse(path: impl Into<PathBuf>, line: usize, message: impl Into<String>) -> Self {
        PipelineError::Parse {
            path: path.into(),
            line,
            message: message.into(),
        }
    }

    pub(crate) fn in_read(read_id: &str, source: PipelineError) -> Self {
        PipelineError::InRead {
            read_id: read_id.to_string(),
            source: Box::new(source),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
