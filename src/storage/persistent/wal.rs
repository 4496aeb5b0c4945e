//! Append-only log of committed mutation batches.
//!
//! # File Format
//! ```text
//! [MAGIC: 4 bytes][VERSION: 1 byte]
//! [RECORD 1: codec-framed WalEntry]
//! [RECORD 2: codec-framed WalEntry]
//! ...
//! ```
//!
//! One record holds one committed transaction (or one autocommitted write),
//! so replay never observes half a node's rows.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Error as IoError, ErrorKind, Result as IoResult, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::codec;
use crate::storage::Mutation;

/// A single log record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    /// Monotonically increasing sequence number, starting at 1.
    pub sequence: u64,
    /// Wall-clock time the record was written.
    pub timestamp: DateTime<Utc>,
    pub kind: WalEntryKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalEntryKind {
    /// Mutations made visible together.
    Commit(Vec<Mutation>),
}

struct Tail {
    writer: BufWriter<File>,
    sequence: u64,
}

fn poisoned() -> IoError {
    IoError::other("poisoned lock: write-ahead log")
}

/// Write-ahead log. Thread-safe via an internal mutex.
pub struct WriteAheadLog {
    path: PathBuf,
    tail: Mutex<Tail>,
    sync_on_write: bool,
}

impl std::fmt::Debug for WriteAheadLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteAheadLog")
            .field("path", &self.path)
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

impl WriteAheadLog {
    /// Opens or creates a log file.
    ///
    /// An existing file is scanned for its last valid sequence number; a new
    /// file gets the header.
    ///
    /// # Errors
    ///
    /// Propagates I/O errors and rejects files with foreign magic bytes.
    pub fn open(path: &Path, sync_on_write: bool) -> IoResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let len = file.metadata()?.len();
        let sequence = if len >= 5 {
            let (sequence, valid_end) = Self::recover(path)?;
            if valid_end < len {
                warn!(
                    path = %path.display(),
                    discarded = len - valid_end,
                    "truncating unreadable write-ahead log tail"
                );
                file.set_len(valid_end)?;
                if sync_on_write {
                    file.sync_all()?;
                }
            }
            sequence
        } else {
            file.set_len(0)?;
            codec::write_header(&mut file)?;
            if sync_on_write {
                file.sync_all()?;
            }
            0
        };
        drop(file);

        let file = OpenOptions::new().append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            tail: Mutex::new(Tail {
                writer: BufWriter::new(file),
                sequence,
            }),
            sync_on_write,
        })
    }

    /// Appends one record and returns its sequence number.
    ///
    /// # Errors
    ///
    /// Propagates encoding and I/O errors; the sequence number only advances
    /// once the record is written.
    pub fn append(&self, kind: WalEntryKind) -> IoResult<u64> {
        let mut tail = self.tail.lock().map_err(|_| poisoned())?;
        let candidate = tail.sequence + 1;
        let entry = WalEntry {
            sequence: candidate,
            timestamp: Utc::now(),
            kind,
        };

        let encoded = codec::encode(&entry)?;
        tail.writer.write_all(&encoded)?;
        tail.writer.flush()?;
        if self.sync_on_write {
            tail.writer.get_ref().sync_all()?;
        }

        tail.sequence = candidate;
        Ok(candidate)
    }

    /// Iterates over every record from the start of the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or has a bad header.
    pub fn iter(&self) -> IoResult<WalIterator> {
        WalIterator::new(&self.path)
    }

    /// Sequence number of the last record written.
    #[must_use]
    pub fn current_sequence(&self) -> u64 {
        self.tail.lock().map(|tail| tail.sequence).unwrap_or(0)
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the last valid sequence number and the offset just past it.
    fn recover(path: &Path) -> IoResult<(u64, u64)> {
        let mut iter = WalIterator::new(path)?;
        let mut last = 0;
        let mut valid_end = iter.position()?;
        loop {
            match iter.next() {
                Some(Ok(entry)) => {
                    last = entry.sequence;
                    valid_end = iter.position()?;
                }
                Some(Err(e)) => {
                    warn!(sequence = last + 1, error = %e, "corrupt write-ahead log record; ignoring the rest");
                    break;
                }
                None => break,
            }
        }
        Ok((last, valid_end))
    }
}

/// Iterator over log records.
///
/// A torn final record (short read) ends the iteration silently; any other
/// decoding failure is yielded as an error.
pub struct WalIterator {
    reader: BufReader<File>,
    file_size: u64,
}

impl WalIterator {
    fn new(path: &Path) -> IoResult<Self> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        codec::read_header(&mut reader)?;
        Ok(Self { reader, file_size })
    }

    fn position(&mut self) -> IoResult<u64> {
        self.reader.stream_position()
    }

    fn at_eof(&mut self) -> IoResult<bool> {
        Ok(self.position()? >= self.file_size)
    }
}

impl Iterator for WalIterator {
    type Item = IoResult<WalEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.at_eof() {
            Ok(true) => return None,
            Ok(false) => {}
            Err(e) => return Some(Err(e)),
        }
        match codec::decode(&mut self.reader) {
            Ok(entry) => Some(Ok(entry)),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => None,
            Err(e) => Some(Err(e)),
        }
    }
}
