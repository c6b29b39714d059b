//src/record.rs
//! Length-prefixed record files.
//!
//! Every record is a little-endian `u64` body length followed by the body:
//!
//! ```text
//! u8   kind        0 = token ids, 1 = one-hot floats
//! u8   has_label   0 or 1
//! i64  label       only when has_label == 1
//! u32  count       number of values
//! [u32 | f32; count]
//! ```
//!
//! A file is an append-only log: one payload kind per file, and either every
//! record carries a label (training/eval) or none does (predict).

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Write};
use std::path::Path;

use crate::error::{PipelineError, Result};
use crate::tokenizer::{Encoding, ReadEncoding};
use crate::types::{BatchReads, PayloadKind, ReadPayload, Record};

const VALUE_WIDTH: usize = 4;

/// Appends records to any writer, enforcing the per-file invariants.
pub struct RecordWriter<W: Write> {
    writer: W,
    kind: Option<PayloadKind>,
    labelled: Option<bool>,
    written: u64,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            kind: None,
            labelled: None,
            written: 0,
        }
    }

    /// Appends a training/eval record carrying its label.
    pub fn write_training_record(&mut self, read: &ReadPayload, label: i64) -> Result<()> {
        self.write_parts(read, Some(label))
    }

    /// Appends a predict record without a label.
    pub fn write_predict_record(&mut self, read: &ReadPayload) -> Result<()> {
        self.write_parts(read, None)
    }

    pub fn write_record(&mut self, record: &Record) -> Result<()> {
        self.write_parts(&record.read, record.label)
    }

    fn write_parts(&mut self, read: &ReadPayload, label: Option<i64>) -> Result<()> {
        let kind = read.kind();
        if *self.kind.get_or_insert(kind) != kind {
            return Err(PipelineError::Record {
                index: self.written,
                message: format!("cannot mix {} records into this file", kind.as_str()),
            });
        }
        if *self.labelled.get_or_insert(label.is_some()) != label.is_some() {
            return Err(PipelineError::Record {
                index: self.written,
                message: "training and predict records cannot share a file".into(),
            });
        }

        let count = match read {
            ReadPayload::Tokens(tokens) => tokens.len(),
            ReadPayload::OneHot(array) => array.len(),
        };
        let count = u32::try_from(count).map_err(|_| PipelineError::Record {
            index: self.written,
            message: format!("payload of {count} values is too large"),
        })?;

        let mut body = Vec::with_capacity(14 + count as usize * VALUE_WIDTH);
        body.write_u8(kind as u8)?;
        match label {
            Some(label) => {
                body.write_u8(1)?;
                body.write_i64::<LE>(label)?;
            }
            None => body.write_u8(0)?,
        }
        body.write_u32::<LE>(count)?;
        match read {
            ReadPayload::Tokens(tokens) => {
                for &t in tokens {
                    body.write_u32::<LE>(t)?;
                }
            }
            ReadPayload::OneHot(array) => {
                for &v in array.iter() {
                    body.write_f32::<LE>(v)?;
                }
            }
        }

        self.writer.write_u64::<LE>(body.len() as u64)?;
        self.writer.write_all(&body)?;
        self.written += 1;
        Ok(())
    }

    pub fn records_written(&self) -> u64 {
        self.written
    }

    /// Flushes and hands back the underlying writer.
    pub fn into_inner(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Pull-based record stream. `Ok(None)` marks a clean end of stream.
pub struct RecordReader<R: Read> {
    reader: R,
    encoding: Encoding,
    labelled: Option<bool>,
    index: u64,
    done: bool,
}

impl<R: Read> RecordReader<R> {
    pub fn new(reader: R, encoding: Encoding) -> Self {
        Self {
            reader,
            encoding,
            labelled: None,
            index: 0,
            done: false,
        }
    }

    pub fn encoding(&self) -> &Encoding {
        &self.encoding
    }

    pub fn next_record(&mut self) -> Result<Option<Record>> {
        if self.done {
            return Ok(None);
        }
        match self.read_one() {
            Ok(Some(record)) => {
                self.index += 1;
                Ok(Some(record))
            }
            other => {
                self.done = true;
                other
            }
        }
    }

    fn read_one(&mut self) -> Result<Option<Record>> {
        let mut len_buf = [0u8; 8];
        let filled = read_up_to(&mut self.reader, &mut len_buf)?;
        if filled == 0 {
            return Ok(None);
        }
        if filled < len_buf.len() {
            return Err(self.error("truncated length prefix"));
        }
        let body_len = u64::from_le_bytes(len_buf) as usize;

        let mut body = vec![0u8; body_len];
        self.reader.read_exact(&mut body).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => self.error(format!("truncated body of {body_len} bytes")),
            _ => PipelineError::Stream(e),
        })?;

        let mut cursor = Cursor::new(body.as_slice());
        let (record, trailing) = self
            .parse_body(&mut cursor)
            .map_err(|e| self.error(e.to_string()))?;
        if trailing != 0 {
            return Err(self.error(format!("{trailing} trailing bytes")));
        }
        Ok(Some(record))
    }

    fn parse_body(&mut self, cursor: &mut Cursor<&[u8]>) -> Result<(Record, usize)> {
        let tag = cursor.read_u8()?;
        let kind = PayloadKind::from_tag(tag)
            .ok_or_else(|| PipelineError::InvalidArgument(format!("unknown payload kind {tag}")))?;
        if kind != self.encoding.kind() {
            return Err(PipelineError::InvalidArgument(format!(
                "{} record in a {} stream",
                kind.as_str(),
                self.encoding.kind().as_str()
            )));
        }

        let labelled = match cursor.read_u8()? {
            0 => false,
            1 => true,
            other => {
                return Err(PipelineError::InvalidArgument(format!("bad label flag {other}")))
            }
        };
        if *self.labelled.get_or_insert(labelled) != labelled {
            return Err(PipelineError::InvalidArgument(
                "labelled and unlabelled records mixed in one stream".into(),
            ));
        }
        let label = if labelled {
            Some(cursor.read_i64::<LE>()?)
        } else {
            None
        };

        let count = cursor.read_u32::<LE>()? as usize;
        let remaining = cursor.get_ref().len() - cursor.position() as usize;
        if remaining < count * VALUE_WIDTH {
            return Err(PipelineError::InvalidArgument(format!(
                "{count} values announced but only {remaining} bytes left"
            )));
        }
        let read = self.encoding.decode(cursor, count)?;
        Ok((Record { read, label }, remaining - count * VALUE_WIDTH))
    }

    fn error(&self, message: impl Into<String>) -> PipelineError {
        PipelineError::Record {
            index: self.index,
            message: message.into(),
        }
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Fills `buf` until it is full or the reader hits end of file; returns bytes read.
fn read_up_to<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Opens a set of record files as one stream, in the given order.
pub fn open_record_files<P: AsRef<Path>>(
    paths: &[P],
    encoding: Encoding,
) -> Result<RecordReader<Box<dyn Read>>> {
    let mut chained: Box<dyn Read> = Box::new(io::empty());
    for path in paths {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| PipelineError::io(path, e))?;
        chained = Box::new(chained.chain(BufReader::new(file)));
    }
    Ok(RecordReader::new(chained, encoding))
}

/// Target length of a padded batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PadLength {
    /// Longest read of the batch.
    #[default]
    Longest,
    /// Fixed number of positions; longer reads are truncated.
    Fixed(usize),
}

/// One padded batch of records.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub reads: BatchReads,
    /// Unpadded number of positions per read.
    pub lengths: Vec<usize>,
    pub labels: Option<Vec<i64>>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }
}

/// Pulls up to `batch_size` records and pads them into one batch.
/// Returns `Ok(None)` once the stream is exhausted.
pub fn read_batch<R: Read>(
    reader: &mut RecordReader<R>,
    batch_size: usize,
    pad: PadLength,
) -> Result<Option<Batch>> {
    if batch_size == 0 {
        return Err(PipelineError::InvalidArgument("batch size must be positive".into()));
    }

    let mut payloads = Vec::with_capacity(batch_size);
    let mut labels = Vec::with_capacity(batch_size);
    let mut labelled = false;
    while payloads.len() < batch_size {
        let Some(record) = reader.next_record()? else {
            break;
        };
        labelled = record.label.is_some();
        labels.extend(record.label);
        payloads.push(record.read);
    }
    if payloads.is_empty() {
        return Ok(None);
    }

    let lengths: Vec<usize> = payloads.iter().map(ReadPayload::positions).collect();
    let len = match pad {
        PadLength::Longest => lengths.iter().copied().max().unwrap_or(0),
        PadLength::Fixed(n) => n,
    };
    let reads = reader.encoding().pad_to(&payloads, len)?;

    Ok(Some(Batch {
        reads,
        lengths,
        labels: labelled.then_some(labels),
    }))
}

/// Lazy, finite sequence of padded batches over a record stream.
pub struct BatchReader<R: Read> {
    records: RecordReader<R>,
    batch_size: usize,
    pad: PadLength,
}

impl<R: Read> BatchReader<R> {
    pub fn new(records: RecordReader<R>, batch_size: usize, pad: PadLength) -> Self {
        Self {
            records,
            batch_size,
            pad,
        }
    }
}

impl<R: Read> Iterator for BatchReader<R> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        read_batch(&mut self.records, self.batch_size, self.pad).transpose()
    }
}
