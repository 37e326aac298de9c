//! Delimited record codec.

use std::cmp::Ordering;
use std::error::Error;
use std::fmt;
use std::fmt::Display;
use std::io;
use std::io::prelude::*;

use crate::buffer::RunBuffer;

/// Record decoding error.
#[derive(Debug)]
pub enum RecordError {
    /// The stream contains data that can't be decoded into text fields.
    Malformed {
        /// Input line the record starts at, if known.
        line: Option<u64>,
        /// Decoder message.
        message: String,
    },
    /// Underlying stream I/O error.
    IO(io::Error),
}

impl Error for RecordError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self {
            RecordError::Malformed { .. } => None,
            RecordError::IO(err) => Some(err),
        }
    }
}

impl Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            RecordError::Malformed { line: Some(line), message } => {
                write!(f, "malformed record at line {}: {}", line, message)
            }
            RecordError::Malformed { line: None, message } => write!(f, "malformed record: {}", message),
            RecordError::IO(err) => write!(f, "record stream I/O error: {}", err),
        }
    }
}

impl From<csv::Error> for RecordError {
    fn from(err: csv::Error) -> Self {
        let line = err.position().map(|pos| pos.line());
        let message = err.to_string();

        match err.into_kind() {
            csv::ErrorKind::Io(err) => RecordError::IO(err),
            _ => RecordError::Malformed { line, message },
        }
    }
}

/// A single delimited record. The first field is the sort key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record(csv::StringRecord);

impl Record {
    /// Creates a record from its fields.
    pub fn new<I, T>(fields: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        Record(fields.into_iter().collect())
    }

    /// Returns the sort key. A record without fields has an empty key.
    pub fn key(&self) -> &str {
        self.0.get(0).unwrap_or("")
    }

    /// Returns the field at `idx`.
    pub fn get(&self, idx: usize) -> Option<&str> {
        self.0.get(idx)
    }

    /// Returns the number of fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Checks if the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<csv::StringRecord> for Record {
    fn from(record: csv::StringRecord) -> Self {
        Record(record)
    }
}

#[cfg(feature = "memory-limit")]
impl deepsize::DeepSizeOf for Record {
    fn deep_size_of_children(&self, _context: &mut deepsize::Context) -> usize {
        // field bytes plus one end offset per field
        self.0.as_slice().len() + self.0.len() * std::mem::size_of::<usize>()
    }
}

/// Total order used to compare record keys.
///
/// Keys are never reinterpreted implicitly: numeric comparison has to be requested.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum KeyOrder {
    /// Byte-wise comparison of the key text.
    Lexicographic,
    /// Keys that parse as numbers compare by value and sort before all other keys.
    /// Non-numeric keys compare lexicographically among themselves.
    Numeric,
}

impl Default for KeyOrder {
    fn default() -> Self {
        KeyOrder::Lexicographic
    }
}

impl KeyOrder {
    /// Compares two keys.
    pub fn compare(&self, a: &str, b: &str) -> Ordering {
        match self {
            KeyOrder::Lexicographic => a.cmp(b),
            KeyOrder::Numeric => match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
                (Ok(a), Ok(b)) => a.total_cmp(&b),
                (Ok(_), Err(_)) => Ordering::Less,
                (Err(_), Ok(_)) => Ordering::Greater,
                (Err(_), Err(_)) => a.cmp(b),
            },
        }
    }

    /// Compares two records by their keys.
    pub fn compare_records(&self, a: &Record, b: &Record) -> Ordering {
        self.compare(a.key(), b.key())
    }
}

/// Record encoding parameters shared by the input, the runs and the output.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Dialect {
    /// Field delimiter.
    pub delimiter: u8,
    /// Quote character used for fields containing the delimiter, quotes or line breaks.
    pub quote: u8,
}

impl Default for Dialect {
    fn default() -> Self {
        Dialect {
            delimiter: b',',
            quote: b'"',
        }
    }
}

impl Dialect {
    /// Returns a copy of the dialect using `delimiter` as a field separator.
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        return self;
    }

    /// Creates a record reader over `reader`.
    pub fn reader<R: Read>(&self, reader: R, buf_size: Option<usize>) -> RecordReader<R> {
        let mut builder = csv::ReaderBuilder::new();
        builder
            .has_headers(false)
            .flexible(true)
            .delimiter(self.delimiter)
            .quote(self.quote);
        if let Some(buf_size) = buf_size {
            builder.buffer_capacity(buf_size);
        }

        RecordReader {
            inner: builder.from_reader(reader),
            read: 0,
        }
    }

    /// Creates a record writer over `writer`.
    pub fn writer<W: Write>(&self, writer: W, buf_size: Option<usize>) -> RecordWriter<W> {
        let mut builder = csv::WriterBuilder::new();
        builder
            .has_headers(false)
            .flexible(true)
            .delimiter(self.delimiter)
            .quote(self.quote)
            .terminator(csv::Terminator::Any(b'\n'));
        if let Some(buf_size) = buf_size {
            builder.buffer_capacity(buf_size);
        }

        RecordWriter {
            inner: builder.from_writer(writer),
        }
    }
}

/// Streaming record reader.
pub struct RecordReader<R: Read> {
    inner: csv::Reader<R>,
    read: u64,
}

impl<R: Read> RecordReader<R> {
    /// Reads the next record. Returns [`None`] when the stream is exhausted.
    pub fn read_next(&mut self) -> Result<Option<Record>, RecordError> {
        let mut record = csv::StringRecord::new();
        if self.inner.read_record(&mut record)? {
            self.read += 1;
            Ok(Some(Record(record)))
        } else {
            Ok(None)
        }
    }

    /// Reads records into `buffer` until it is full or the stream is exhausted.
    /// Returns the number of records read; zero means the stream is exhausted.
    pub fn read_batch<B: RunBuffer>(&mut self, buffer: &mut B) -> Result<usize, RecordError> {
        let mut read = 0;
        while !buffer.is_full() {
            match self.read_next()? {
                Some(record) => buffer.push(record),
                None => break,
            }
            read += 1;
        }

        return Ok(read);
    }

    /// Number of records read so far.
    pub fn records_read(&self) -> u64 {
        self.read
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = Result<Record, RecordError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read_next().transpose()
    }
}

/// Streaming record writer.
pub struct RecordWriter<W: Write> {
    inner: csv::Writer<W>,
}

impl<W: Write> RecordWriter<W> {
    /// Writes a single record.
    pub fn write(&mut self, record: &Record) -> io::Result<()> {
        self.inner.write_byte_record(record.0.as_byte_record())?;
        return Ok(());
    }

    /// Flushes buffered data to the underlying writer.
    pub fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }

    /// Flushes buffered data and returns the underlying writer.
    pub fn into_inner(self) -> io::Result<W> {
        self.inner.into_inner().map_err(|err| err.into_error())
    }
}
