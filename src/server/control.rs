//! Durable per-target replication cursor.
//!
//! One control file exists per `(target directory, source GUID)` pair and
//! records how far replay has progressed: the highest segment started or
//! completed, the acknowledged byte offset inside it, the replica's last
//! observed replication sequence, and a snapshot of the open transactions.
//!
//! The file is held under an exclusive advisory lock for the duration of a
//! scan-and-replay cycle, and every write is flushed to stable storage
//! before the caller proceeds.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use uuid::Uuid;

use super::protocol::{read_u16_le, read_u32_le, read_u64_le};
use super::transactions::ActiveTransactions;

pub const CONTROL_SIGNATURE: &[u8; 10] = b"FBREPLCTL\0";
pub const CONTROL_VERSION: u16 = 1;

/// Signature + version + txn_count + sequence + offset + db_sequence.
const CONTROL_HEADER_LEN: usize = 10 + 2 + 4 + 8 + 4 + 8;
/// Transaction id + originating sequence.
const TXN_RECORD_LEN: usize = 8 + 8;

#[derive(Debug, Error)]
pub enum ControlFileError {
    #[error("control file io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("control file {path:?} lock failed: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("control file {path:?} appears corrupted: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// Control file path for a source GUID inside a target's source directory.
pub fn control_file_path(directory: &Path, guid: &Uuid) -> PathBuf {
    directory.join(guid.hyphenated().to_string())
}

/// Read-only view of a control file, for diagnostics and tests.
///
/// Does not take the lock; a concurrently running driver may be mid-update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ControlSnapshot {
    pub sequence: u64,
    pub offset: u32,
    pub db_sequence: u64,
    pub transactions: ActiveTransactions,
}

pub fn read_control_file(path: &Path) -> Result<ControlSnapshot, ControlFileError> {
    let mut file = File::open(path).map_err(|source| ControlFileError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)
        .map_err(|source| ControlFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    decode(path, &bytes)
}

/// Exclusive, write-through handle on a control file.
///
/// The advisory lock is acquired in [`ControlFile::open`] and released when
/// the handle is dropped. fs2 maps to `flock` on POSIX and `LockFileEx` on
/// Windows, so two driver processes sharing a directory serialize here.
#[derive(Debug)]
pub struct ControlFile {
    file: File,
    path: PathBuf,
    sequence: u64,
    offset: u32,
    db_sequence: u64,
    txn_count: u32,
}

impl ControlFile {
    /// Create-or-open the control file for `guid`, lock it exclusively, and
    /// load the persisted cursor.
    ///
    /// A fresh file is initialized to `sequence = hint_sequence - 1` (the
    /// caller passes the first segment it is about to replay) with an empty
    /// active set. An existing file replaces the contents of `transactions`
    /// with the persisted snapshot.
    pub fn open(
        directory: &Path,
        guid: &Uuid,
        hint_sequence: u64,
        transactions: &mut ActiveTransactions,
    ) -> Result<Self, ControlFileError> {
        let path = control_file_path(directory, guid);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| ControlFileError::Io {
                path: path.clone(),
                source,
            })?;

        file.lock_exclusive()
            .map_err(|source| ControlFileError::Lock {
                path: path.clone(),
                source,
            })?;

        let length = file
            .metadata()
            .map_err(|source| ControlFileError::Io {
                path: path.clone(),
                source,
            })?
            .len();

        let mut control = Self {
            file,
            path,
            sequence: 0,
            offset: 0,
            db_sequence: 0,
            txn_count: 0,
        };

        if length == 0 {
            transactions.clear();
            control.sequence = hint_sequence.saturating_sub(1);
            control.persist(transactions)?;
        } else {
            let mut bytes = Vec::with_capacity(length as usize);
            control
                .file
                .read_to_end(&mut bytes)
                .map_err(|source| ControlFileError::Io {
                    path: control.path.clone(),
                    source,
                })?;
            let snapshot = decode(&control.path, &bytes)?;
            control.sequence = snapshot.sequence;
            control.offset = snapshot.offset;
            control.db_sequence = snapshot.db_sequence;
            control.txn_count = snapshot.transactions.len() as u32;
            *transactions = snapshot.transactions;
        }

        Ok(control)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest segment whose replay has begun or completed.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Acknowledged byte offset inside `sequence`; zero once it completed.
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Replica's replication sequence observed at the last connect.
    pub fn db_sequence(&self) -> u64 {
        self.db_sequence
    }

    /// Persist a new replica sequence. The active-transaction records on
    /// disk are left untouched.
    pub fn save_db_sequence(&mut self, db_sequence: u64) -> Result<(), ControlFileError> {
        self.db_sequence = db_sequence;
        self.persist_header()
    }

    /// Persist partial progress inside a segment.
    ///
    /// Applies only when `(sequence, offset)` moves forward; stale
    /// checkpoints are ignored so the cursor is strictly monotonic.
    pub fn save_partial(
        &mut self,
        sequence: u64,
        offset: u32,
        transactions: &ActiveTransactions,
    ) -> Result<(), ControlFileError> {
        let update = if sequence > self.sequence {
            // A new segment may only start once the previous one completed.
            debug_assert_eq!(self.offset, 0);
            self.sequence = sequence;
            self.offset = offset;
            true
        } else if sequence == self.sequence && offset > self.offset {
            self.offset = offset;
            true
        } else {
            false
        };

        if update {
            self.persist(transactions)?;
        }
        Ok(())
    }

    /// Persist the completion of a segment: `offset` returns to zero.
    pub fn save_complete(
        &mut self,
        sequence: u64,
        transactions: &ActiveTransactions,
    ) -> Result<(), ControlFileError> {
        if sequence >= self.sequence {
            self.sequence = sequence;
            self.offset = 0;
            self.persist(transactions)?;
        }
        Ok(())
    }

    fn persist(&mut self, transactions: &ActiveTransactions) -> Result<(), ControlFileError> {
        self.txn_count = transactions.len() as u32;

        let mut buf =
            Vec::with_capacity(CONTROL_HEADER_LEN + transactions.len() * TXN_RECORD_LEN);
        self.encode_header(&mut buf);
        for (transaction_id, sequence) in transactions.iter() {
            buf.extend_from_slice(&transaction_id.to_le_bytes());
            buf.extend_from_slice(&sequence.to_le_bytes());
        }

        self.write_at_start(&buf)
    }

    fn persist_header(&mut self) -> Result<(), ControlFileError> {
        let mut buf = Vec::with_capacity(CONTROL_HEADER_LEN);
        self.encode_header(&mut buf);
        self.write_at_start(&buf)
    }

    fn encode_header(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(CONTROL_SIGNATURE);
        buf.extend_from_slice(&CONTROL_VERSION.to_le_bytes());
        buf.extend_from_slice(&self.txn_count.to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.db_sequence.to_le_bytes());
    }

    fn write_at_start(&mut self, buf: &[u8]) -> Result<(), ControlFileError> {
        let result = self
            .file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.file.write_all(buf))
            // Write-through: the checkpoint must be on stable storage
            // before replay proceeds past it.
            .and_then(|()| self.file.sync_data());

        result.map_err(|source| ControlFileError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl Drop for ControlFile {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn decode(path: &Path, bytes: &[u8]) -> Result<ControlSnapshot, ControlFileError> {
    let corrupt = |reason: String| ControlFileError::Corrupt {
        path: path.to_path_buf(),
        reason,
    };

    if bytes.len() < CONTROL_HEADER_LEN {
        return Err(corrupt(format!(
            "truncated header: {} bytes, need {CONTROL_HEADER_LEN}",
            bytes.len()
        )));
    }

    if &bytes[..CONTROL_SIGNATURE.len()] != CONTROL_SIGNATURE {
        return Err(corrupt("unknown signature".to_string()));
    }

    let mut offset = CONTROL_SIGNATURE.len();
    let version = read_u16_le(bytes, &mut offset);
    if version != CONTROL_VERSION {
        return Err(corrupt(format!(
            "unsupported version {version} (supported: {CONTROL_VERSION})"
        )));
    }

    let txn_count = read_u32_le(bytes, &mut offset);
    let sequence = read_u64_le(bytes, &mut offset);
    let cursor_offset = read_u32_le(bytes, &mut offset);
    let db_sequence = read_u64_le(bytes, &mut offset);

    let records_len = txn_count as usize * TXN_RECORD_LEN;
    if bytes.len() < CONTROL_HEADER_LEN + records_len {
        return Err(corrupt(format!(
            "truncated transaction records: {txn_count} declared, file has {} bytes",
            bytes.len()
        )));
    }

    let mut transactions = ActiveTransactions::new();
    for _ in 0..txn_count {
        let transaction_id = read_u64_le(bytes, &mut offset);
        let origin = read_u64_le(bytes, &mut offset);
        transactions.insert(transaction_id, origin);
    }

    Ok(ControlSnapshot {
        sequence,
        offset: cursor_offset,
        db_sequence,
        transactions,
    })
}
