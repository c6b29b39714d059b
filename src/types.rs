//src/types.rs

use ndarray::Array2;

/// A minimal representation of a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DNASequence {
    /// First whitespace-delimited word of the header.
    pub id: String,
    /// Whole header line without the leading `>`/`@`.
    pub header_line: String,
    pub seq: String,
}

/// Token ids of one read, one per k-mer window.
pub type TokenSequence = Vec<u32>;

/// The encoded form of one read, as stored in a record.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadPayload {
    Tokens(TokenSequence),
    /// `len x 4` probability rows over A, C, G, T.
    OneHot(Array2<f32>),
}

/// On-disk tag of a payload. A record file carries exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Tokens = 0,
    OneHot = 1,
}

impl PayloadKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(PayloadKind::Tokens),
            1 => Some(PayloadKind::OneHot),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PayloadKind::Tokens => "tokens",
            PayloadKind::OneHot => "one-hot",
        }
    }
}

impl ReadPayload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            ReadPayload::Tokens(_) => PayloadKind::Tokens,
            ReadPayload::OneHot(_) => PayloadKind::OneHot,
        }
    }

    /// Number of positions: tokens for k-mer payloads, bases for one-hot payloads.
    pub fn positions(&self) -> usize {
        match self {
            ReadPayload::Tokens(tokens) => tokens.len(),
            ReadPayload::OneHot(array) => array.nrows(),
        }
    }
}

/// One serialized unit of a record file.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub read: ReadPayload,
    /// Present in training/eval files, absent in predict files.
    pub label: Option<i64>,
}

/// Per-taxon accumulation of the profiler.
#[derive(Debug, Clone, PartialEq)]
pub struct TaxonCountRecord {
    pub taxon_id: String,
    pub read_count: u64,
    pub mean_confidence: f64,
}

/// Best-class call for one (replicate-averaged) read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassCall {
    /// Zero-based label, or taxid when translated.
    pub class_id: i64,
    /// Winning probability times 100.
    pub confidence: f64,
}

/// Padded read payloads of one batch, one row per record.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchReads {
    /// `batch x len` token ids, right-padded with 0.
    Tokens(Array2<u32>),
    /// `batch x (len * 4)` flattened one-hot rows, right-padded with 0.0.
    OneHot(Array2<f32>),
}

impl BatchReads {
    pub fn nrows(&self) -> usize {
        match self {
            BatchReads::Tokens(a) => a.nrows(),
            BatchReads::OneHot(a) => a.nrows(),
        }
    }
}
