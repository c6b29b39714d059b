//src/output.rs

use ndarray::{Array2, ArrayView2};
use std::fmt::Display;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use crate::aggregate::TopNCalls;
use crate::error::{PipelineError, Result};
use crate::types::ClassCall;

/// Writes `path` through a temporary file in the same directory, renamed into
/// place only after `fill` succeeds. On error nothing appears at `path`.
pub fn write_atomic<P, F, T>(path: P, fill: F) -> Result<T>
where
    P: AsRef<Path>,
    F: FnOnce(&mut dyn Write) -> Result<T>,
{
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| PipelineError::io(dir, e))?;
    let value = {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        let value = fill(&mut writer)?;
        writer.flush().map_err(|e| PipelineError::io(path, e))?;
        value
    };
    // NamedTempFile is created 0600; published outputs get regular file permissions.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tmp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(0o644))
            .map_err(|e| PipelineError::io(path, e))?;
    }
    tmp.persist(path).map_err(|e| PipelineError::io(path, e.error))?;
    Ok(value)
}

/// `<prefix>.<suffix>`, keeping any extension already on the prefix.
pub fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

fn write_rows<W, T, F>(out: &mut W, rows: ArrayView2<T>, fmt: F) -> Result<()>
where
    W: Write + ?Sized,
    F: Fn(&T) -> String,
{
    for row in rows.rows() {
        let line: Vec<String> = row.iter().map(&fmt).collect();
        writeln!(out, "{}", line.join("\t"))?;
    }
    Ok(())
}

/// Tab-delimited probability matrix, one read per line.
pub fn write_matrix<W: Write + ?Sized>(out: &mut W, matrix: &Array2<f64>) -> Result<()> {
    write_rows(out, matrix.view(), |p| p.to_string())
}

/// Class indices as integers, one read per line.
pub fn write_categories<W, T>(out: &mut W, categories: ArrayView2<T>) -> Result<()>
where
    W: Write + ?Sized,
    T: Display,
{
    write_rows(out, categories, |c| c.to_string())
}

/// Probabilities as percentages with two decimals.
pub fn write_percentages<W: Write + ?Sized>(out: &mut W, probs: ArrayView2<f64>) -> Result<()> {
    write_rows(out, probs, |p| format!("{:.2}", p * 100.0))
}

/// `<prefix>.category.txt` and `<prefix>.prob.txt` for top-N output.
pub fn write_top_n(prefix: &Path, calls: &TopNCalls) -> Result<()> {
    write_atomic(with_suffix(prefix, "category.txt"), |out| {
        write_categories(out, calls.indices.view())
    })?;
    write_atomic(with_suffix(prefix, "prob.txt"), |out| {
        write_percentages(out, calls.probs.view())
    })
}

/// `<prefix>.category_<tag>.txt` and `<prefix>.prob_<tag>.txt` for best-class output.
pub fn write_class_calls(prefix: &Path, tag: &str, calls: &[ClassCall]) -> Result<()> {
    write_atomic(with_suffix(prefix, &format!("category_{tag}.txt")), |out| {
        for call in calls {
            writeln!(out, "{}", call.class_id)?;
        }
        Ok(())
    })?;
    write_atomic(with_suffix(prefix, &format!("prob_{tag}.txt")), |out| {
        for call in calls {
            writeln!(out, "{:.2}", call.confidence)?;
        }
        Ok(())
    })
}

/// Per-read `class<TAB>confidence` lines, the profiler's input format.
pub fn write_predictions<W: Write + ?Sized>(out: &mut W, calls: &[ClassCall]) -> Result<()> {
    for call in calls {
        writeln!(out, "{}\t{:.2}", call.class_id, call.confidence)?;
    }
    Ok(())
}
