//src/labels.rs

use ahash::AHashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{PipelineError, Result};

/// Bijection between zero-based training labels and external taxids.
#[derive(Debug, Clone, Default)]
pub struct LabelIndex {
    label_to_taxid: AHashMap<i32, i64>,
    taxid_to_label: AHashMap<i64, i32>,
}

impl LabelIndex {
    /// Parses a label table in the format:
    /// ```text
    /// <label_id>\t<taxid>
    /// ```
    /// Blank lines are skipped; any other malformed row, or a row repeating a
    /// label or taxid, is an error carrying its line number.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
        let reader = BufReader::new(file);

        let mut index = LabelIndex::default();
        for (idx, line_result) in reader.lines().enumerate() {
            let line_no = idx + 1;
            let line = line_result.map_err(|e| PipelineError::io(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let parts: Vec<&str> = line.trim_end().split('\t').collect();
            if parts.len() < 2 {
                return Err(PipelineError::parse(path, line_no, "expected label<TAB>taxid"));
            }
            let label: i32 = parts[0].trim().parse().map_err(|_| {
                PipelineError::parse(path, line_no, format!("label {:?} is not an integer", parts[0]))
            })?;
            let taxid: i64 = parts[1].trim().parse().map_err(|_| {
                PipelineError::parse(path, line_no, format!("taxid {:?} is not an integer", parts[1]))
            })?;
            index
                .insert(label, taxid)
                .map_err(|message| PipelineError::parse(path, line_no, message))?;
        }

        log::info!("Loaded {} labels from {}", index.len(), path.display());
        Ok(index)
    }

    /// Builds an index from `(label, taxid)` pairs, enforcing the bijection.
    pub fn from_pairs<I: IntoIterator<Item = (i32, i64)>>(pairs: I) -> Result<Self> {
        let mut index = LabelIndex::default();
        for (label, taxid) in pairs {
            index.insert(label, taxid).map_err(PipelineError::InvalidArgument)?;
        }
        Ok(index)
    }

    fn insert(&mut self, label: i32, taxid: i64) -> std::result::Result<(), String> {
        if self.label_to_taxid.contains_key(&label) {
            return Err(format!("label {label} listed twice"));
        }
        if self.taxid_to_label.contains_key(&taxid) {
            return Err(format!("taxid {taxid} listed twice"));
        }
        self.label_to_taxid.insert(label, taxid);
        self.taxid_to_label.insert(taxid, label);
        Ok(())
    }

    pub fn taxid(&self, label: i32) -> Option<i64> {
        self.label_to_taxid.get(&label).copied()
    }

    pub fn label(&self, taxid: i64) -> Option<i32> {
        self.taxid_to_label.get(&taxid).copied()
    }

    /// Label for a taxid, failing when the taxid is not part of the model.
    pub fn require_label(&self, taxid: i64) -> Result<i32> {
        self.label(taxid).ok_or(PipelineError::UnknownTaxon(taxid))
    }

    /// Taxid for a predicted label, failing when the label has no row.
    pub fn require_taxid(&self, label: i64) -> Result<i64> {
        i32::try_from(label)
            .ok()
            .and_then(|l| self.taxid(l))
            .ok_or(PipelineError::UnknownLabel(label))
    }

    pub fn len(&self) -> usize {
        self.label_to_taxid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.label_to_taxid.is_empty()
    }
}

/// Maps a label or taxid (as written in prediction files) to a display name.
#[derive(Debug, Clone, Default)]
pub struct NameTable {
    names: AHashMap<String, String>,
}

impl NameTable {
    /// Parses a name table in the format:
    /// ```text
    /// <name>\t<label or taxid>
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
        let reader = BufReader::new(file);

        let mut names = AHashMap::new();
        for (idx, line_result) in reader.lines().enumerate() {
            let line = line_result.map_err(|e| PipelineError::io(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let parts: Vec<&str> = line.trim_end().split('\t').collect();
            if parts.len() < 2 {
                return Err(PipelineError::parse(path, idx + 1, "expected name<TAB>id"));
            }
            names.insert(parts[1].trim().to_string(), parts[0].to_string());
        }

        log::info!("Loaded {} names from {}", names.len(), path.display());
        Ok(Self { names })
    }

    pub fn from_pairs<I, S, T>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, T)>,
        S: Into<String>,
        T: Into<String>,
    {
        Self {
            names: pairs
                .into_iter()
                .map(|(id, name)| (id.into(), name.into()))
                .collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&str> {
        self.names.get(id).map(String::as_str)
    }

    pub fn require(&self, id: &str) -> Result<&str> {
        self.get(id)
            .ok_or_else(|| PipelineError::UnknownName(id.to_string()))
    }
}
