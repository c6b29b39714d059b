//src/vocab.rs

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;

use crate::error::{PipelineError, Result};

/// Vocabulary line that designates the unknown token.
pub const UNKNOWN_TOKEN: &str = "<unk>";

/// How line indexes of the vocabulary file become token ids.
///
/// `Zero` numbers the first line 0. `PadReserved` numbers it 1 and keeps id 0
/// for batch padding, so a padded position can never alias a real k-mer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdBase {
    #[default]
    Zero,
    PadReserved,
}

impl IdBase {
    pub fn first_id(&self) -> u32 {
        match self {
            IdBase::Zero => 0,
            IdBase::PadReserved => 1,
        }
    }
}

/// Immutable k-mer -> token id table, built once and shared read-only.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    token_to_id: AHashMap<Vec<u8>, u32>,
    unknown_id: u32,
    k: usize,
    id_base: IdBase,
}

impl Vocabulary {
    /// Loads a vocabulary file with one token per line; line order defines ids.
    pub fn load<P: AsRef<Path>>(path: P, k: usize, id_base: IdBase) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
        let vocab = Self::build(BufReader::new(file).lines(), path, k, id_base)?;
        log::info!(
            "Loaded vocabulary {} with {} k-mers, k={}, unknown id={}, id base={:?}",
            path.display(),
            vocab.len(),
            vocab.k,
            vocab.unknown_id,
            vocab.id_base
        );
        Ok(vocab)
    }

    /// Builds a vocabulary from in-memory tokens, in the same order a file would list them.
    pub fn from_tokens<I, S>(tokens: I, k: usize, id_base: IdBase) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let lines = tokens
            .into_iter()
            .map(|t| Ok::<String, io::Error>(t.as_ref().to_string()));
        Self::build(lines, Path::new("<memory>"), k, id_base)
    }

    fn build<I>(lines: I, path: &Path, k: usize, id_base: IdBase) -> Result<Self>
    where
        I: Iterator<Item = io::Result<String>>,
    {
        if k == 0 {
            return Err(PipelineError::InvalidArgument("k must be at least 1".into()));
        }

        let mut token_to_id = AHashMap::new();
        let mut unknown_id = None;
        let mut next_id = id_base.first_id();

        for (idx, line) in lines.enumerate() {
            let line_no = idx + 1;
            let line = line.map_err(|e| PipelineError::io(path, e))?;
            let token = line.trim_end();
            // Blank lines (typically a trailing one) carry no token and take no id.
            if token.is_empty() {
                continue;
            }
            let id = next_id;
            next_id += 1;

            if token == UNKNOWN_TOKEN {
                if unknown_id.replace(id).is_some() {
                    return Err(PipelineError::parse(path, line_no, "duplicate <unk> token"));
                }
                continue;
            }
            if token.len() != k {
                return Err(PipelineError::parse(
                    path,
                    line_no,
                    format!("token {token:?} has length {}, expected k={k}", token.len()),
                ));
            }
            if let Some(bad) = token.bytes().find(|&b| !matches!(b, b'A' | b'C' | b'G' | b'T')) {
                return Err(PipelineError::parse(
                    path,
                    line_no,
                    format!("token {token:?} contains non-ACGT symbol {:?}", bad as char),
                ));
            }
            let kmer = token.as_bytes().to_vec();
            // Only one orientation per canonical family, otherwise lookup would depend on strand.
            let rc = reverse_complement(&kmer)?;
            if rc != kmer && token_to_id.contains_key(&rc) {
                return Err(PipelineError::parse(
                    path,
                    line_no,
                    format!(
                        "{token:?} is the reverse complement of an earlier token {:?}",
                        String::from_utf8_lossy(&rc)
                    ),
                ));
            }
            if token_to_id.insert(kmer, id).is_some() {
                return Err(PipelineError::parse(path, line_no, format!("duplicate token {token:?}")));
            }
        }

        let unknown_id = match unknown_id {
            Some(id) => id,
            None => {
                log::warn!(
                    "{} has no {UNKNOWN_TOKEN} line; reserving id {next_id} for unknown k-mers",
                    path.display()
                );
                next_id
            }
        };

        Ok(Self {
            token_to_id,
            unknown_id,
            k,
            id_base,
        })
    }

    /// Resolves a k-mer: exact match, then its reverse complement, then the unknown id.
    pub fn lookup(&self, kmer: &[u8]) -> Result<u32> {
        if kmer.len() != self.k {
            return Err(PipelineError::InvalidArgument(format!(
                "k-mer of length {} looked up in a k={} vocabulary",
                kmer.len(),
                self.k
            )));
        }
        if let Some(&id) = self.token_to_id.get(kmer) {
            return Ok(id);
        }
        let rc = reverse_complement(kmer)?;
        Ok(self
            .token_to_id
            .get(rc.as_slice())
            .copied()
            .unwrap_or(self.unknown_id))
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn unknown_id(&self) -> u32 {
        self.unknown_id
    }

    pub fn id_base(&self) -> IdBase {
        self.id_base
    }

    /// Number of real k-mer tokens (the unknown token excluded).
    pub fn len(&self) -> usize {
        self.token_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.token_to_id.is_empty()
    }

    pub fn tokens(&self) -> impl Iterator<Item = (&[u8], u32)> {
        self.token_to_id.iter().map(|(k, &v)| (k.as_slice(), v))
    }
}

/// True for the 16 IUPAC symbols the codec accepts (upper case).
#[inline]
pub fn is_iupac(b: u8) -> bool {
    complement_base(b).is_some()
}

/// Watson-Crick complement; every ambiguity code collapses to `N`.
#[inline]
pub fn complement_base(b: u8) -> Option<u8> {
    match b {
        b'A' => Some(b'T'),
        b'T' => Some(b'A'),
        b'C' => Some(b'G'),
        b'G' => Some(b'C'),
        b'N' | b'K' | b'M' | b'R' | b'Y' | b'S' | b'W' | b'B' | b'V' | b'H' | b'D' | b'X' => {
            Some(b'N')
        }
        _ => None,
    }
}

/// Reverse complement of a k-mer or read.
pub fn reverse_complement(seq: &[u8]) -> Result<Vec<u8>> {
    seq.iter()
        .enumerate()
        .rev()
        .map(|(position, &base)| {
            complement_base(base).ok_or(PipelineError::InvalidBase { base, position })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_vocab(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file
    }

    #[test]
    fn test_load_assigns_ids_in_line_order() {
        let file = write_vocab(&["AAA", "AAC", "<unk>"]);
        let vocab = Vocabulary::load(file.path(), 3, IdBase::Zero).unwrap();
        assert_eq!(vocab.len(), 2);
        assert_eq!(vocab.lookup(b"AAA").unwrap(), 0);
        assert_eq!(vocab.lookup(b"AAC").unwrap(), 1);
        assert_eq!(vocab.unknown_id(), 2);

        let padded = Vocabulary::load(file.path(), 3, IdBase::PadReserved).unwrap();
        assert_eq!(padded.lookup(b"AAA").unwrap(), 1);
        assert_eq!(padded.lookup(b"AAC").unwrap(), 2);
        assert_eq!(padded.unknown_id(), 3);
    }

    #[test]
    fn test_blank_lines_take_no_id() {
        let file = write_vocab(&["AAA", "", "AAC", "<unk>", ""]);
        let vocab = Vocabulary::load(file.path(), 3, IdBase::Zero).unwrap();
        assert_eq!(vocab.len(), 2);
        assert_eq!(vocab.lookup(b"AAC").unwrap(), 1);
        assert_eq!(vocab.unknown_id(), 2);
    }

    #[test]
    fn test_lookup_falls_back_to_reverse_complement() {
        let vocab = Vocabulary::from_tokens(["AAC", "<unk>"], 3, IdBase::Zero).unwrap();
        // GTT is the reverse complement of AAC.
        assert_eq!(vocab.lookup(b"GTT").unwrap(), 0);
        assert_eq!(vocab.lookup(b"CCC").unwrap(), 1);
    }

    #[test]
    fn test_ambiguous_kmer_resolves_to_unknown() {
        let vocab = Vocabulary::from_tokens(["AAC", "<unk>"], 3, IdBase::Zero).unwrap();
        assert_eq!(vocab.lookup(b"ANC").unwrap(), vocab.unknown_id());
    }

    #[test]
    fn test_missing_unknown_line_reserves_next_id() {
        let vocab = Vocabulary::from_tokens(["AAA", "AAC"], 3, IdBase::PadReserved).unwrap();
        assert_eq!(vocab.unknown_id(), 3);
        assert_eq!(vocab.lookup(b"GGG").unwrap(), 3);
    }

    #[test]
    fn test_rejects_malformed_vocabularies() {
        let wrong_len = write_vocab(&["AAA", "AC"]);
        match Vocabulary::load(wrong_len.path(), 3, IdBase::Zero) {
            Err(PipelineError::Parse { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected parse error, got {other:?}"),
        }
        assert!(Vocabulary::from_tokens(["AAA", "AAA"], 3, IdBase::Zero).is_err());
        assert!(Vocabulary::from_tokens(["ANA"], 3, IdBase::Zero).is_err());
        // AAC and GTT are the same canonical family.
        assert!(Vocabulary::from_tokens(["AAC", "GTT"], 3, IdBase::Zero).is_err());
        assert!(Vocabulary::from_tokens(["AAC"], 0, IdBase::Zero).is_err());
    }

    #[test]
    fn test_palindromes_are_accepted() {
        let vocab = Vocabulary::from_tokens(["ACGT", "<unk>"], 4, IdBase::Zero).unwrap();
        assert_eq!(vocab.lookup(b"ACGT").unwrap(), 0);
    }

    #[test]
    fn test_unreadable_file_is_io_error() {
        let err = Vocabulary::load("/nonexistent/vocab.txt", 12, IdBase::Zero).unwrap_err();
        assert!(matches!(err, PipelineError::Io { .. }));
    }

    #[test]
    fn test_reverse_complement() {
        assert_eq!(reverse_complement(b"AACG").unwrap(), b"CGTT".to_vec());
        assert_eq!(reverse_complement(b"AKRX").unwrap(), b"NNNT".to_vec());
        assert_eq!(reverse_complement(b"").unwrap(), Vec::<u8>::new());
        match reverse_complement(b"ACZ") {
            Err(PipelineError::InvalidBase { base, position }) => {
                assert_eq!(base, b'Z');
                assert_eq!(position, 2);
            }
            other => panic!("expected invalid base, got {other:?}"),
        }
    }
}
