//src/tokenizer.rs

use byteorder::{LittleEndian as LE, ReadBytesExt};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::sync::Arc;

use crate::error::{PipelineError, Result};
use crate::types::{BatchReads, DNASequence, PayloadKind, ReadPayload, TokenSequence};
use crate::vocab::{is_iupac, Vocabulary};

const THIRD: f32 = 1.0 / 3.0;

/// Probability vector over A, C, G, T for every IUPAC symbol the codec accepts.
#[inline]
pub fn base_vector(b: u8) -> Option<[f32; 4]> {
    let v = match b {
        b'A' => [1.0, 0.0, 0.0, 0.0],
        b'C' => [0.0, 1.0, 0.0, 0.0],
        b'G' => [0.0, 0.0, 1.0, 0.0],
        b'T' => [0.0, 0.0, 0.0, 1.0],
        b'K' => [0.0, 0.0, 0.5, 0.5],
        b'M' => [0.5, 0.5, 0.0, 0.0],
        b'R' => [0.5, 0.0, 0.5, 0.0],
        b'Y' => [0.0, 0.5, 0.0, 0.5],
        b'S' => [0.0, 0.5, 0.5, 0.0],
        b'W' => [0.5, 0.0, 0.0, 0.5],
        b'B' => [0.0, THIRD, THIRD, THIRD],
        b'V' => [THIRD, THIRD, THIRD, 0.0],
        b'H' => [THIRD, THIRD, 0.0, THIRD],
        b'D' => [THIRD, 0.0, THIRD, THIRD],
        b'N' | b'X' => [0.25, 0.25, 0.25, 0.25],
        _ => return None,
    };
    Some(v)
}

/// Upper-cases a read and rejects anything outside the IUPAC alphabet.
fn normalize(sequence: &[u8]) -> Result<Vec<u8>> {
    sequence
        .iter()
        .enumerate()
        .map(|(position, &b)| {
            let up = b.to_ascii_uppercase();
            if is_iupac(up) {
                Ok(up)
            } else {
                Err(PipelineError::InvalidBase { base: b, position })
            }
        })
        .collect()
}

/// Splits a read into overlapping k-mer windows and resolves each through the vocabulary.
///
/// Reads shorter than k yield an empty sequence.
pub fn encode(sequence: &[u8], vocab: &Vocabulary) -> Result<TokenSequence> {
    let seq = normalize(sequence)?;
    let k = vocab.k();
    if seq.len() < k {
        return Ok(Vec::new());
    }
    seq.windows(k).map(|kmer| vocab.lookup(kmer)).collect()
}

/// One probability row over A, C, G, T per base.
pub fn encode_one_hot(sequence: &[u8]) -> Result<Array2<f32>> {
    let mut array = Array2::<f32>::zeros((sequence.len(), 4));
    for (position, (&b, mut row)) in sequence.iter().zip(array.rows_mut()).enumerate() {
        let v = base_vector(b.to_ascii_uppercase())
            .ok_or(PipelineError::InvalidBase { base: b, position })?;
        for (cell, value) in row.iter_mut().zip(v) {
            *cell = value;
        }
    }
    Ok(array)
}

/// Which part of the header holds the taxid field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeaderField {
    /// First whitespace-delimited word.
    Id,
    /// Whole header line.
    Description,
}

/// Where the upstream read generator embeds the species taxid in a read header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderConvention {
    pub delimiter: char,
    pub field: usize,
    pub source: HeaderField,
}

impl HeaderConvention {
    /// `>NC_018018.1|999|GCF_000265505.1-200000` style identifiers.
    pub const KMER: Self = Self {
        delimiter: '|',
        field: 1,
        source: HeaderField::Id,
    };
    /// ART-simulated reads share the k-mer convention.
    pub const ART: Self = Self::KMER;
    /// MetaSim writes the taxid as the fifth field of the description.
    pub const METASIM: Self = Self {
        delimiter: '|',
        field: 4,
        source: HeaderField::Description,
    };

    pub fn preset(name: &str) -> Option<Self> {
        match name {
            "kmer" => Some(Self::KMER),
            "art" => Some(Self::ART),
            "metasim" => Some(Self::METASIM),
            _ => None,
        }
    }

    pub fn parse_taxid(&self, read: &DNASequence) -> Result<i64> {
        let text = match self.source {
            HeaderField::Id => &read.id,
            HeaderField::Description => &read.header_line,
        };
        let field = text.split(self.delimiter).nth(self.field).ok_or_else(|| {
            PipelineError::InvalidArgument(format!(
                "header {text:?} has no field {} when split on {:?}",
                self.field, self.delimiter
            ))
        })?;
        field.trim().parse().map_err(|_| {
            PipelineError::InvalidArgument(format!("taxid field {field:?} of {text:?} is not an integer"))
        })
    }
}

impl Default for HeaderConvention {
    fn default() -> Self {
        Self::KMER
    }
}

/// Capabilities every read encoding provides to the codec and the batcher.
pub trait ReadEncoding {
    fn kind(&self) -> PayloadKind;

    fn encode(&self, sequence: &[u8]) -> Result<ReadPayload>;

    /// Reads `count` serialized values of this encoding back into a payload.
    fn decode<R: Read>(&self, reader: &mut R, count: usize) -> Result<ReadPayload>;

    /// Right-pads (or truncates) every read to `len` positions with zeros.
    fn pad_to(&self, reads: &[ReadPayload], len: usize) -> Result<BatchReads>;
}

/// K-mer token encoding backed by a shared vocabulary.
#[derive(Debug, Clone)]
pub struct KmerEncoder {
    vocab: Arc<Vocabulary>,
}

impl KmerEncoder {
    pub fn new(vocab: Arc<Vocabulary>) -> Self {
        Self { vocab }
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }
}

impl ReadEncoding for KmerEncoder {
    fn kind(&self) -> PayloadKind {
        PayloadKind::Tokens
    }

    fn encode(&self, sequence: &[u8]) -> Result<ReadPayload> {
        encode(sequence, &self.vocab).map(ReadPayload::Tokens)
    }

    fn decode<R: Read>(&self, reader: &mut R, count: usize) -> Result<ReadPayload> {
        let mut tokens = vec![0u32; count];
        reader.read_u32_into::<LE>(&mut tokens)?;
        Ok(ReadPayload::Tokens(tokens))
    }

    fn pad_to(&self, reads: &[ReadPayload], len: usize) -> Result<BatchReads> {
        let mut batch = Array2::<u32>::zeros((reads.len(), len));
        for (read, mut row) in reads.iter().zip(batch.rows_mut()) {
            let ReadPayload::Tokens(tokens) = read else {
                return Err(mismatch(PayloadKind::Tokens, read.kind()));
            };
            for (cell, &token) in row.iter_mut().zip(tokens) {
                *cell = token;
            }
        }
        Ok(BatchReads::Tokens(batch))
    }
}

/// Fixed ambiguity-table one-hot encoding; needs no vocabulary.
#[derive(Debug, Clone, Copy, Default)]
pub struct OneHotEncoder;

impl ReadEncoding for OneHotEncoder {
    fn kind(&self) -> PayloadKind {
        PayloadKind::OneHot
    }

    fn encode(&self, sequence: &[u8]) -> Result<ReadPayload> {
        encode_one_hot(sequence).map(ReadPayload::OneHot)
    }

    fn decode<R: Read>(&self, reader: &mut R, count: usize) -> Result<ReadPayload> {
        if count % 4 != 0 {
            return Err(PipelineError::InvalidArgument(format!(
                "one-hot payload of {count} floats is not a multiple of 4"
            )));
        }
        let mut values = vec![0f32; count];
        reader.read_f32_into::<LE>(&mut values)?;
        let array = Array2::from_shape_vec((count / 4, 4), values)
            .map_err(|e| PipelineError::InvalidArgument(e.to_string()))?;
        Ok(ReadPayload::OneHot(array))
    }

    fn pad_to(&self, reads: &[ReadPayload], len: usize) -> Result<BatchReads> {
        let mut batch = Array2::<f32>::zeros((reads.len(), len * 4));
        for (read, mut row) in reads.iter().zip(batch.rows_mut()) {
            let ReadPayload::OneHot(array) = read else {
                return Err(mismatch(PayloadKind::OneHot, read.kind()));
            };
            for (cell, &value) in row.iter_mut().zip(array.iter()) {
                *cell = value;
            }
        }
        Ok(BatchReads::OneHot(batch))
    }
}

/// The encoding selected once at configuration time.
#[derive(Debug, Clone)]
pub enum Encoding {
    Kmer(KmerEncoder),
    OneHot(OneHotEncoder),
}

impl Encoding {
    pub fn kmer(vocab: Arc<Vocabulary>) -> Self {
        Encoding::Kmer(KmerEncoder::new(vocab))
    }

    pub fn one_hot() -> Self {
        Encoding::OneHot(OneHotEncoder)
    }

    /// Encodes a parsed read, tagging any failure with the read id.
    pub fn encode_read(&self, read: &DNASequence) -> Result<ReadPayload> {
        self.encode(read.seq.as_bytes())
            .map_err(|e| PipelineError::in_read(&read.id, e))
    }
}

impl ReadEncoding for Encoding {
    fn kind(&self) -> PayloadKind {
        match self {
            Encoding::Kmer(e) => e.kind(),
            Encoding::OneHot(e) => e.kind(),
        }
    }

    fn encode(&self, sequence: &[u8]) -> Result<ReadPayload> {
        match self {
            Encoding::Kmer(e) => e.encode(sequence),
            Encoding::OneHot(e) => e.encode(sequence),
        }
    }

    fn decode<R: Read>(&self, reader: &mut R, count: usize) -> Result<ReadPayload> {
        match self {
            Encoding::Kmer(e) => e.decode(reader, count),
            Encoding::OneHot(e) => e.decode(reader, count),
        }
    }

    fn pad_to(&self, reads: &[ReadPayload], len: usize) -> Result<BatchReads> {
        match self {
            Encoding::Kmer(e) => e.pad_to(reads, len),
            Encoding::OneHot(e) => e.pad_to(reads, len),
        }
    }
}

fn mismatch(expected: PayloadKind, found: PayloadKind) -> PipelineError {
    PipelineError::InvalidArgument(format!(
        "cannot pad a {} read with the {} encoding",
        found.as_str(),
        expected.as_str()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::IdBase;
    use approx::assert_abs_diff_eq;

    fn poly_a_vocab() -> Arc<Vocabulary> {
        Arc::new(Vocabulary::from_tokens(["AAAAAAAAAAAA", "<unk>"], 12, IdBase::Zero).unwrap())
    }

    #[test]
    fn test_encode_slides_one_base_at_a_time() {
        let vocab = poly_a_vocab();
        // Second window AAAAAAAAAAAT and its reverse complement are both absent.
        assert_eq!(encode(b"AAAAAAAAAAAAT", &vocab).unwrap(), vec![0, 1]);
        // TTTTTTTTTTTT is the reverse complement of the only token.
        assert_eq!(encode(b"TTTTTTTTTTTTT", &vocab).unwrap(), vec![0, 0]);
    }

    #[test]
    fn test_short_reads_yield_empty_sequence() {
        let vocab = poly_a_vocab();
        assert!(encode(b"", &vocab).unwrap().is_empty());
        assert!(encode(b"AC", &vocab).unwrap().is_empty());
        assert_eq!(encode(b"AAAAAAAAAAAA", &vocab).unwrap().len(), 1);
    }

    #[test]
    fn test_encode_accepts_lowercase_and_rejects_non_iupac() {
        let vocab = poly_a_vocab();
        assert_eq!(encode(b"aaaaaaaaaaaa", &vocab).unwrap(), vec![0]);
        match encode(b"AAAAAAAAAAA-A", &vocab) {
            Err(PipelineError::InvalidBase { base, position }) => {
                assert_eq!(base, b'-');
                assert_eq!(position, 11);
            }
            other => panic!("expected invalid base, got {other:?}"),
        }
    }

    #[test]
    fn test_one_hot_ambiguity_table() {
        let array = encode_one_hot(b"ANKB").unwrap();
        assert_eq!(array.dim(), (4, 4));
        assert_eq!(array.row(0).to_vec(), vec![1.0, 0.0, 0.0, 0.0]);
        assert_eq!(array.row(1).to_vec(), vec![0.25, 0.25, 0.25, 0.25]);
        assert_eq!(array.row(2).to_vec(), vec![0.0, 0.0, 0.5, 0.5]);
        assert_abs_diff_eq!(array.row(3).sum(), 1.0, epsilon = 1e-6);
        assert!(encode_one_hot(b"AZ").is_err());
    }

    #[test]
    fn test_header_conventions() {
        let read = DNASequence {
            id: "NC_018018.1|999|GCF_000265505.1-200000".into(),
            header_line: "NC_018018.1|999|GCF_000265505.1-200000 extra".into(),
            seq: "ACGT".into(),
        };
        assert_eq!(HeaderConvention::KMER.parse_taxid(&read).unwrap(), 999);

        let metasim = DNASequence {
            id: "r1".into(),
            header_line: "r1 |SOURCE_1|x|y|1280|".into(),
            seq: "ACGT".into(),
        };
        assert_eq!(HeaderConvention::METASIM.parse_taxid(&metasim).unwrap(), 1280);
        assert!(HeaderConvention::KMER.parse_taxid(&metasim).is_err());
    }

    #[test]
    fn test_pad_to_pads_and_truncates() {
        let enc = Encoding::kmer(poly_a_vocab());
        let reads = vec![
            ReadPayload::Tokens(vec![5, 6, 7]),
            ReadPayload::Tokens(vec![8]),
        ];
        let BatchReads::Tokens(batch) = enc.pad_to(&reads, 2).unwrap() else {
            panic!("expected token batch");
        };
        assert_eq!(batch.row(0).to_vec(), vec![5, 6]);
        assert_eq!(batch.row(1).to_vec(), vec![8, 0]);

        let one_hot = Encoding::one_hot();
        assert!(one_hot.pad_to(&reads, 2).is_err());
        let reads = vec![ReadPayload::OneHot(encode_one_hot(b"AC").unwrap())];
        let BatchReads::OneHot(batch) = one_hot.pad_to(&reads, 3).unwrap() else {
            panic!("expected one-hot batch");
        };
        assert_eq!(batch.ncols(), 12);
        assert_eq!(
            batch.row(0).to_vec(),
            vec![1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]
        );
    }
}
