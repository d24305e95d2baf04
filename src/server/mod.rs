//! Replication log applier.
//!
//! A primary database writes ordered, numbered change-log segments into an
//! archive directory. This module watches that directory and replays the
//! segments, in order and transaction-aware, against one or more replica
//! databases:
//!
//! - [`scan_directory`] enumerates and validates segments into an ordered
//!   queue;
//! - [`ControlFile`] is the durable per-target cursor (last applied
//!   sequence, intra-segment offset, open transactions, replica sequence);
//! - [`run_pass`] drives one scan-and-replay cycle for a [`Target`],
//!   including crash rewind, gap detection and segment garbage collection;
//! - [`ReplServer`] runs one worker thread per configured target until a
//!   shutdown flag is raised.
//!
//! Replica databases are reached through the [`ReplicaConnector`] seam
//! supplied by the hosting server.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

mod control;
mod protocol;
mod replay;
mod replica;
mod scan;
mod transactions;
mod worker;

pub use control::{
    CONTROL_SIGNATURE, CONTROL_VERSION, ControlFile, ControlFileError, ControlSnapshot,
    control_file_path, read_control_file,
};
pub use protocol::{
    BLOCK_BEGIN_TRANS, BLOCK_END_TRANS, BLOCK_HEADER_LEN, BlockHeader, HeaderError,
    PROTOCOL_VERSION, SEGMENT_HEADER_LEN, SEGMENT_SIGNATURE, SEGMENT_VERSION, SegmentHeader,
    SegmentState,
};
pub use replay::{PassOutcome, Target, run_pass};
pub use replica::{DiscardConnector, ReplicaConnector, ReplicaError, ReplicaSession};
pub use scan::{LogSegment, PRESERVED_PREFIX, ScanOptions, scan_directory};
pub use transactions::ActiveTransactions;
pub use worker::{ReplServer, repl_server};

/// Errors that abort one replay pass.
///
/// None of these stop the server: the control file still holds the last
/// durable checkpoint, so the worker backs off and the next pass retries
/// from there.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("log file io error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("log file {path:?} appears corrupted: {reason}")]
    SegmentCorrupt { path: PathBuf, reason: String },
    #[error("log file {path:?} was unexpectedly changed")]
    SegmentChanged { path: PathBuf },
    #[error("Required segment {sequence} is missing")]
    MissingSegment { sequence: u64 },
    #[error(transparent)]
    Control(#[from] ControlFileError),
    #[error(transparent)]
    Replica(#[from] ReplicaError),
}
