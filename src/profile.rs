//src/profile.rs

use indexmap::IndexMap;
use std::fmt::Write as FmtWrite;
use std::io::{BufRead, Write};
use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::labels::NameTable;
use crate::output::write_atomic;
use crate::types::{ClassCall, TaxonCountRecord};

/// Cut-offs applied while building a community profile. Confidences are percentages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProfileThresholds {
    /// Taxa with fewer surviving reads are dropped.
    pub min_count: u64,
    /// Taxa whose rounded mean confidence is lower are dropped.
    pub min_prob: f64,
    /// Reads below this confidence are not counted at all.
    pub min_reads_prob: f64,
}

impl Default for ProfileThresholds {
    fn default() -> Self {
        Self {
            min_count: 0,
            min_prob: 50.0,
            min_reads_prob: 50.0,
        }
    }
}

/// Renders a confidence the way the reports have always printed it:
/// whole numbers keep one decimal (`70.0`), others their shortest form.
pub fn format_confidence(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        format!("{value}")
    }
}

/// Two decimals, halves to even (`70.125` gives `70.12`).
fn round2(value: f64) -> f64 {
    (value * 100.0).round_ties_even() / 100.0
}

#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    count: u64,
    confidence_sum: f64,
}

/// First stage of profiling: per-taxon read counts and confidence sums,
/// kept in first-seen order.
#[derive(Debug, Clone)]
pub struct TaxonAccumulator {
    thresholds: ProfileThresholds,
    taxa: IndexMap<String, Tally>,
    discarded: u64,
}

impl TaxonAccumulator {
    pub fn new(thresholds: ProfileThresholds) -> Self {
        Self {
            thresholds,
            taxa: IndexMap::new(),
            discarded: 0,
        }
    }

    /// Counts one read unless its confidence is below `min_reads_prob`.
    pub fn add(&mut self, taxon: &str, confidence: f64) -> bool {
        if confidence < self.thresholds.min_reads_prob {
            self.discarded += 1;
            return false;
        }
        let tally = self.taxa.entry(taxon.to_string()).or_default();
        tally.count += 1;
        tally.confidence_sum += confidence;
        true
    }

    pub fn add_calls(&mut self, calls: &[ClassCall]) {
        for call in calls {
            self.add(&call.class_id.to_string(), call.confidence);
        }
    }

    /// Consumes `taxon<TAB>confidence` lines. Blank lines are skipped.
    pub fn read_predictions<R: BufRead>(&mut self, reader: R, path: &Path) -> Result<()> {
        for (idx, line_result) in reader.lines().enumerate() {
            let line_no = idx + 1;
            let line = line_result.map_err(|e| PipelineError::io(path, e))?;
            if line.trim().is_empty() {
                continue;
            }
            let parts: Vec<&str> = line.split('\t').collect();
            if parts.len() < 2 {
                return Err(PipelineError::parse(path, line_no, "expected taxon<TAB>confidence"));
            }
            let confidence: f64 = parts[1].trim().parse().map_err(|_| {
                PipelineError::parse(path, line_no, format!("confidence {:?} is not a number", parts[1]))
            })?;
            self.add(parts[0].trim(), confidence);
        }
        Ok(())
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Computes rounded mean confidences and drops taxa failing `min_count`
    /// or `min_prob`.
    pub fn filter(self) -> FilteredTaxa {
        if self.discarded > 0 {
            log::warn!(
                "{} reads discarded below confidence {}",
                self.discarded,
                self.thresholds.min_reads_prob
            );
        }
        let ProfileThresholds { min_count, min_prob, .. } = self.thresholds;
        let records = self
            .taxa
            .into_iter()
            .map(|(taxon_id, tally)| TaxonCountRecord {
                taxon_id,
                read_count: tally.count,
                mean_confidence: round2(tally.confidence_sum / tally.count as f64),
            })
            .filter(|r| r.read_count >= min_count && r.mean_confidence >= min_prob)
            .collect();
        FilteredTaxa { records }
    }
}

/// Taxa that passed the thresholds, still in first-seen order.
#[derive(Debug, Clone)]
pub struct FilteredTaxa {
    records: Vec<TaxonCountRecord>,
}

impl FilteredTaxa {
    pub fn records(&self) -> &[TaxonCountRecord] {
        &self.records
    }

    /// Orders taxa by read count, descending. Ties keep first-seen order.
    pub fn sort(mut self) -> CommunityProfile {
        self.records.sort_by(|a, b| b.read_count.cmp(&a.read_count));
        CommunityProfile {
            records: self.records,
        }
    }
}

/// Final, ordered community profile ready to be written.
#[derive(Debug, Clone)]
pub struct CommunityProfile {
    records: Vec<TaxonCountRecord>,
}

impl CommunityProfile {
    pub fn records(&self) -> &[TaxonCountRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Generate report text on demand
    pub fn get_report(&self, names: &NameTable) -> Result<String> {
        let mut output = String::new();
        output.push_str("Name\tCount\tConfidence\n");
        for record in &self.records {
            let name = names.require(&record.taxon_id)?;
            writeln!(
                output,
                "{}\t{}\t{}",
                name,
                record.read_count,
                format_confidence(record.mean_confidence)
            )
            .map_err(|e| PipelineError::InvalidArgument(e.to_string()))?;
        }
        Ok(output)
    }

    /// Writes the report atomically and ends the profile's life.
    pub fn write(self, path: &Path, names: &NameTable) -> Result<()> {
        let report = self.get_report(names)?;
        write_atomic(path, |out| Ok(out.write_all(report.as_bytes())?))?;
        log::info!("Wrote {} taxa to {}", self.records.len(), path.display());
        Ok(())
    }
}

/// Plain per-taxon read counts, no thresholds: `(taxon, count)` by count
/// descending, ties in first-seen order. Only the first column of each line is used.
pub fn count_reads<R: BufRead>(reader: R, path: &Path) -> Result<Vec<(String, u64)>> {
    let mut counts: IndexMap<String, u64> = IndexMap::new();
    for line_result in reader.lines() {
        let line = line_result.map_err(|e| PipelineError::io(path, e))?;
        let taxon = match line.split('\t').next().map(str::trim) {
            Some(t) if !t.is_empty() => t,
            _ => continue,
        };
        *counts.entry(taxon.to_string()).or_insert(0) += 1;
    }
    let mut counts: Vec<(String, u64)> = counts.into_iter().collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1));
    Ok(counts)
}

/// `name<TAB>count` lines for the output of [`count_reads`].
pub fn write_read_counts<W: Write + ?Sized>(
    out: &mut W,
    counts: &[(String, u64)],
    names: &NameTable,
) -> Result<()> {
    for (taxon, count) in counts {
        writeln!(out, "{}\t{}", names.require(taxon)?, count)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds(min_count: u64) -> ProfileThresholds {
        ProfileThresholds {
            min_count,
            min_prob: 50.0,
            min_reads_prob: 50.0,
        }
    }

    #[test]
    fn test_profile_counts_and_means() {
        let mut acc = TaxonAccumulator::new(thresholds(2));
        for c in [60.0, 70.0, 80.0] {
            assert!(acc.add("X", c));
        }
        assert!(!acc.add("Y", 40.0));
        assert_eq!(acc.discarded(), 1);

        let profile = acc.filter().sort();
        assert_eq!(
            profile.records(),
            &[TaxonCountRecord {
                taxon_id: "X".into(),
                read_count: 3,
                mean_confidence: 70.0,
            }]
        );

        let names = NameTable::from_pairs([("X", "Taxon X")]);
        assert_eq!(
            profile.get_report(&names).unwrap(),
            "Name\tCount\tConfidence\nTaxon X\t3\t70.0\n"
        );
    }

    #[test]
    fn test_min_count_removes_taxon() {
        let mut acc = TaxonAccumulator::new(thresholds(4));
        for c in [60.0, 70.0, 80.0] {
            acc.add("X", c);
        }
        assert!(acc.filter().sort().is_empty());
    }

    #[test]
    fn test_min_prob_uses_rounded_mean() {
        let mut acc = TaxonAccumulator::new(ProfileThresholds {
            min_count: 0,
            min_prob: 66.67,
            min_reads_prob: 0.0,
        });
        for c in [100.0, 100.0, 0.0] {
            acc.add("X", c);
        }
        let filtered = acc.filter();
        assert_eq!(filtered.records()[0].mean_confidence, 66.67);
    }

    #[test]
    fn test_ties_keep_first_seen_order() {
        let mut acc = TaxonAccumulator::new(thresholds(0));
        for taxon in ["B", "A", "C", "A", "B", "C", "D"] {
            acc.add(taxon, 90.0);
        }
        let profile = acc.filter().sort();
        let order: Vec<&str> = profile
            .records()
            .iter()
            .map(|r| r.taxon_id.as_str())
            .collect();
        assert_eq!(order, vec!["B", "A", "C", "D"]);
    }

    #[test]
    fn test_mean_rounds_half_to_even() {
        assert_eq!(round2(70.125), 70.12);
        assert_eq!(round2(70.375), 70.38);
        assert_eq!(round2(0.125), 0.12);

        let mut acc = TaxonAccumulator::new(ProfileThresholds {
            min_count: 0,
            min_prob: 70.125,
            min_reads_prob: 0.0,
        });
        acc.add("X", 70.25);
        acc.add("X", 70.0);
        assert!(acc.filter().records().is_empty());
    }

    #[test]
    fn test_read_predictions() {
        let text = "562\t80.5\n\n1280\t99\n562\t45\n";
        let mut acc = TaxonAccumulator::new(thresholds(0));
        acc.read_predictions(text.as_bytes(), Path::new("pred.txt")).unwrap();
        let profile = acc.filter().sort();
        assert_eq!(profile.records().len(), 2);
        assert_eq!(profile.records()[0].taxon_id, "562");
        assert_eq!(profile.records()[0].mean_confidence, 80.5);

        let mut bad = TaxonAccumulator::new(thresholds(0));
        let err = bad.read_predictions("562\tninety\n".as_bytes(), Path::new("pred.txt"));
        assert!(matches!(err, Err(PipelineError::Parse { line: 1, .. })));
    }

    #[test]
    fn test_missing_name_fails() {
        let mut acc = TaxonAccumulator::new(thresholds(0));
        acc.add("7", 90.0);
        let profile = acc.filter().sort();
        assert!(matches!(
            profile.get_report(&NameTable::default()),
            Err(PipelineError::UnknownName(_))
        ));
    }

    #[test]
    fn test_write_profile_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.tsv");
        let mut acc = TaxonAccumulator::new(thresholds(0));
        acc.add_calls(&[
            ClassCall { class_id: 1, confidence: 75.25 },
            ClassCall { class_id: 1, confidence: 75.25 },
        ]);
        let names = NameTable::from_pairs([("1", "Bacillus")]);
        acc.filter().sort().write(&path, &names).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "Name\tCount\tConfidence\nBacillus\t2\t75.25\n"
        );
    }

    #[test]
    fn test_count_reads() {
        let text = "b\t90\na\nb\n\nc\t10\na\n";
        let counts = count_reads(text.as_bytes(), Path::new("labels.txt")).unwrap();
        assert_eq!(
            counts,
            vec![("b".to_string(), 2), ("a".to_string(), 2), ("c".to_string(), 1)]
        );
        let names = NameTable::from_pairs([("a", "Alpha"), ("b", "Beta"), ("c", "Gamma")]);
        let mut out = Vec::new();
        write_read_counts(&mut out, &counts, &names).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "Beta\t2\nAlpha\t2\nGamma\t1\n");
    }

    #[test]
    fn test_format_confidence() {
        assert_eq!(format_confidence(70.0), "70.0");
        assert_eq!(format_confidence(66.67), "66.67");
        assert_eq!(format_confidence(100.0), "100.0");
    }
}
