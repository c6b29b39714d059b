//src/aggregate.rs

use ndarray::{Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};
use crate::labels::LabelIndex;
use crate::types::ClassCall;

/// Largest deviation of a row sum from 1 still accepted as a probability vector.
pub const ROW_SUM_TOLERANCE: f64 = 1e-3;

/// How many consecutive prediction rows describe the same underlying read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Replicates {
    /// One row per read; no averaging.
    Single,
    /// Forward and reverse-complement rows.
    #[default]
    DoubleStrand,
    /// Both strands of both mates.
    PairedEnd,
}

impl Replicates {
    pub fn group_size(&self) -> usize {
        match self {
            Replicates::Single => 1,
            Replicates::DoubleStrand => 2,
            Replicates::PairedEnd => 4,
        }
    }
}

/// Output of the predict stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictMode {
    /// Averaged probability matrix.
    Prob,
    /// The `n` most probable classes per read.
    TopN(usize),
    /// Best class per single-end read.
    SingleClass,
    /// Best class per read pair.
    PairedClass,
}

impl PredictMode {
    /// Row layout this mode reads. A pair call always spans both mates, so
    /// `PairedClass` uses the paired-end layout whatever was configured, and
    /// `SingleClass` never groups more than the two strands of one read.
    pub fn layout(self, configured: Replicates) -> Replicates {
        match (self, configured) {
            (PredictMode::PairedClass, _) => Replicates::PairedEnd,
            (PredictMode::SingleClass, Replicates::PairedEnd) => Replicates::DoubleStrand,
            (_, configured) => configured,
        }
    }
}

/// Arithmetic mean of each run of `group_size` consecutive rows.
pub fn average_replicates(
    batch: ArrayView2<f64>,
    group_size: usize,
    num_classes: usize,
) -> Result<Array2<f64>> {
    if batch.ncols() != num_classes {
        return Err(PipelineError::Dimension {
            expected: num_classes,
            found: batch.ncols(),
        });
    }
    if group_size == 0 || batch.nrows() % group_size != 0 {
        return Err(PipelineError::Shape {
            rows: batch.nrows(),
            group_size,
        });
    }

    let groups = batch.nrows() / group_size;
    let mut out = Array2::<f64>::zeros((groups, num_classes));
    for (group, mut averaged) in batch
        .axis_chunks_iter(Axis(0), group_size)
        .zip(out.rows_mut())
    {
        for row in group.rows() {
            averaged += &row;
        }
        averaged /= group_size as f64;
    }
    Ok(out)
}

/// Per row, the `n` most probable class indices and their probabilities,
/// descending by probability; equal probabilities keep the lower index first.
pub fn top_n(probabilities: ArrayView2<f64>, n: usize) -> Result<(Array2<usize>, Array2<f64>)> {
    let num_classes = probabilities.ncols();
    if n == 0 || n > num_classes {
        return Err(PipelineError::InvalidArgument(format!(
            "top_n must be between 1 and {num_classes}, got {n}"
        )));
    }

    let rows = probabilities.nrows();
    let mut indices = Array2::<usize>::zeros((rows, n));
    let mut probs = Array2::<f64>::zeros((rows, n));
    let mut order: Vec<usize> = Vec::with_capacity(num_classes);
    for (r, row) in probabilities.rows().into_iter().enumerate() {
        order.clear();
        order.extend(0..num_classes);
        order.sort_by(|&a, &b| row[b].total_cmp(&row[a]).then(a.cmp(&b)));
        for (slot, &class) in order.iter().take(n).enumerate() {
            indices[[r, slot]] = class;
            probs[[r, slot]] = row[class];
        }
    }
    Ok((indices, probs))
}

/// Argmax of every row (first index on ties) with confidence `max * 100`.
/// With a label index the winning label is reported as its taxid.
pub fn best_class(
    probabilities: ArrayView2<f64>,
    translate: Option<&LabelIndex>,
) -> Result<Vec<ClassCall>> {
    probabilities
        .rows()
        .into_iter()
        .map(|row| {
            let (label, max) = row
                .iter()
                .enumerate()
                .fold((0usize, f64::NEG_INFINITY), |best, (i, &p)| {
                    if p > best.1 {
                        (i, p)
                    } else {
                        best
                    }
                });
            let class_id = match translate {
                Some(index) => index.require_taxid(label as i64)?,
                None => label as i64,
            };
            Ok(ClassCall {
                class_id,
                confidence: max * 100.0,
            })
        })
        .collect()
}

/// Top-N calls over a whole prediction stream.
#[derive(Debug, Clone, PartialEq)]
pub struct TopNCalls {
    pub indices: Array2<usize>,
    /// Raw probabilities, aligned with `indices`.
    pub probs: Array2<f64>,
}

/// Reduces a stream of probability batches, one batch at a time.
#[derive(Debug, Clone, Copy)]
pub struct Aggregator {
    num_classes: usize,
    group_size: usize,
}

impl Aggregator {
    pub fn new(num_classes: usize, replicates: Replicates) -> Result<Self> {
        Self::with_group_size(num_classes, replicates.group_size())
    }

    /// Groups of `group_size` consecutive rows are averaged into one read.
    pub fn with_group_size(num_classes: usize, group_size: usize) -> Result<Self> {
        if num_classes == 0 {
            return Err(PipelineError::InvalidArgument("num_classes must be positive".into()));
        }
        if group_size == 0 {
            return Err(PipelineError::InvalidArgument("group size must be positive".into()));
        }
        Ok(Self {
            num_classes,
            group_size,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// Checks the probability invariant, then averages replicate groups.
    fn reduce(&self, batch: &Array2<f64>, first_row: usize) -> Result<Array2<f64>> {
        if batch.ncols() != self.num_classes {
            return Err(PipelineError::Dimension {
                expected: self.num_classes,
                found: batch.ncols(),
            });
        }
        for (i, row) in batch.rows().into_iter().enumerate() {
            if row.iter().any(|&p| !(p >= 0.0)) {
                return Err(PipelineError::Probability {
                    row: first_row + i,
                    message: "negative or NaN probability".into(),
                });
            }
            let sum = row.sum();
            if (sum - 1.0).abs() > ROW_SUM_TOLERANCE {
                return Err(PipelineError::Probability {
                    row: first_row + i,
                    message: format!("row sums to {sum}"),
                });
            }
        }
        average_replicates(batch.view(), self.group_size, self.num_classes)
    }

    /// Pulls every batch, reducing each as it arrives; `f` sees reduced batches in order.
    fn drain<I, F>(&self, batches: I, mut f: F) -> Result<()>
    where
        I: IntoIterator<Item = Result<Array2<f64>>>,
        F: FnMut(Array2<f64>) -> Result<()>,
    {
        let mut seen_rows = 0usize;
        let mut seen_batches = 0usize;
        for batch in batches {
            let batch = batch?;
            let reduced = self.reduce(&batch, seen_rows)?;
            seen_rows += batch.nrows();
            seen_batches += 1;
            f(reduced)?;
        }
        log::info!("Prediction finished: {seen_batches} batches, {seen_rows} rows");
        Ok(())
    }

    /// Replicate-averaged probability matrix of the whole stream.
    pub fn probabilities<I>(&self, batches: I) -> Result<Array2<f64>>
    where
        I: IntoIterator<Item = Result<Array2<f64>>>,
    {
        let mut values = Vec::new();
        let mut rows = 0;
        self.drain(batches, |reduced| {
            rows += reduced.nrows();
            values.extend(reduced.iter().copied());
            Ok(())
        })?;
        Array2::from_shape_vec((rows, self.num_classes), values)
            .map_err(|e| PipelineError::InvalidArgument(e.to_string()))
    }

    pub fn top_n_calls<I>(&self, batches: I, n: usize) -> Result<TopNCalls>
    where
        I: IntoIterator<Item = Result<Array2<f64>>>,
    {
        if n == 0 || n > self.num_classes {
            return Err(PipelineError::InvalidArgument(format!(
                "top_n must be between 1 and {}, got {n}",
                self.num_classes
            )));
        }
        let mut indices = Vec::new();
        let mut probs = Vec::new();
        let mut rows = 0;
        self.drain(batches, |reduced| {
            let (idx, p) = top_n(reduced.view(), n)?;
            rows += idx.nrows();
            indices.extend(idx.iter().copied());
            probs.extend(p.iter().copied());
            Ok(())
        })?;
        let shape_err = |e: ndarray::ShapeError| PipelineError::InvalidArgument(e.to_string());
        Ok(TopNCalls {
            indices: Array2::from_shape_vec((rows, n), indices).map_err(shape_err)?,
            probs: Array2::from_shape_vec((rows, n), probs).map_err(shape_err)?,
        })
    }

    pub fn best_calls<I>(&self, batches: I, translate: Option<&LabelIndex>) -> Result<Vec<ClassCall>>
    where
        I: IntoIterator<Item = Result<Array2<f64>>>,
    {
        let mut calls = Vec::new();
        self.drain(batches, |reduced| {
            calls.extend(best_class(reduced.view(), translate)?);
            Ok(())
        })?;
        Ok(calls)
    }
}

/// Lazily reads a whitespace-delimited probability matrix (one row per line)
/// in batches of `batch_size` rows.
pub struct MatrixBatches<R: BufRead> {
    reader: R,
    path: PathBuf,
    num_classes: usize,
    batch_size: usize,
    line_no: usize,
    done: bool,
}

impl<R: BufRead> MatrixBatches<R> {
    pub fn new(reader: R, path: &Path, num_classes: usize, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(PipelineError::InvalidArgument("batch size must be positive".into()));
        }
        Ok(Self {
            reader,
            path: path.to_path_buf(),
            num_classes,
            batch_size,
            line_no: 0,
            done: false,
        })
    }

    fn next_batch(&mut self) -> Result<Option<Array2<f64>>> {
        let mut values = Vec::with_capacity(self.batch_size * self.num_classes);
        let mut rows = 0;
        let mut line = String::new();
        while rows < self.batch_size {
            line.clear();
            let n = self
                .reader
                .read_line(&mut line)
                .map_err(|e| PipelineError::io(&self.path, e))?;
            if n == 0 {
                break;
            }
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            let before = values.len();
            for field in line.split_whitespace() {
                let p: f64 = field.parse().map_err(|_| {
                    PipelineError::parse(&self.path, self.line_no, format!("{field:?} is not a number"))
                })?;
                values.push(p);
            }
            let found = values.len() - before;
            if found != self.num_classes {
                return Err(PipelineError::parse(
                    &self.path,
                    self.line_no,
                    format!("expected {} probabilities, found {found}", self.num_classes),
                ));
            }
            rows += 1;
        }
        if rows == 0 {
            return Ok(None);
        }
        Array2::from_shape_vec((rows, self.num_classes), values)
            .map(Some)
            .map_err(|e| PipelineError::InvalidArgument(e.to_string()))
    }
}

impl<R: BufRead> Iterator for MatrixBatches<R> {
    type Item = Result<Array2<f64>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let next = self.next_batch();
        if !matches!(next, Ok(Some(_))) {
            self.done = true;
        }
        next.transpose()
    }
}
