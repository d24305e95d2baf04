//! The replay driver: one scan-and-replay pass for one target.
//!
//! A pass scans the target's source directory into an ordered queue, then
//! walks the queue segment by segment: fast-forward past anything the
//! replica already absorbed, detect out-of-band replica resets, refuse to
//! jump a gap, rewind-filter bytes that were already acknowledged, stream
//! the rest to the replica, checkpoint after every block, and delete
//! segments no open transaction reaches into.

use std::fs::File;
use std::io::Read;
use std::sync::Arc;

use crate::config::TargetConfig;

use super::ServerError;
use super::control::ControlFile;
use super::protocol::{BLOCK_HEADER_LEN, BlockHeader, SEGMENT_HEADER_LEN};
use super::replica::{ReplicaConnector, ReplicaError, ReplicaSession};
use super::scan::{ScanOptions, is_sharing_violation, scan_directory};
use super::transactions::ActiveTransactions;

/// How one pass ended, and therefore what the worker does next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassOutcome {
    /// Nothing to do; sleep for the idle timeout.
    Suspend,
    /// At least one segment was replayed; run another pass immediately.
    Continue,
    /// The pass aborted; sleep for the error timeout and retry.
    Error,
}

/// One replication target: a replica database fed from one source
/// directory. Owned exclusively by its worker thread.
pub struct Target {
    config: TargetConfig,
    connector: Arc<dyn ReplicaConnector>,
    session: Option<Box<dyn ReplicaSession>>,
    /// Replica sequence read once per connection.
    sequence: u64,
    connected: bool,
    /// Last error message logged, for duplicate suppression.
    last_error: Option<String>,
}

impl Target {
    pub fn new(config: TargetConfig, connector: Arc<dyn ReplicaConnector>) -> Self {
        Self {
            config,
            connector,
            session: None,
            sequence: 0,
            connected: false,
            last_error: None,
        }
    }

    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    /// The last error message this target logged, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    fn scan_options(&self) -> ScanOptions<'_> {
        ScanOptions {
            directory: &self.config.log_source_directory,
            source_guid: self.config.source_guid,
            db_name: &self.config.db_name,
            verbose: self.config.verbose_logging,
            preserve_segments: self.config.preserve_segments,
            delete_free: true,
        }
    }

    /// Connect to the replica if not yet connected this cycle and return
    /// its replication sequence. The session is reused for the rest of the
    /// cycle.
    fn init_replica(&mut self) -> Result<u64, ReplicaError> {
        if self.connected {
            return Ok(self.sequence);
        }

        self.verbose(|| format!("Connecting to database ({})", self.config.db_name));

        let mut session = self
            .connector
            .connect(&self.config.db_name, &self.config.apply_user)?;
        let sequence = session.replication_sequence()?;

        self.session = Some(session);
        self.sequence = sequence;
        self.connected = true;
        Ok(sequence)
    }

    /// Drop the replica session, if any. Called by the worker between
    /// cycles that did not continue immediately.
    pub fn disconnect(&mut self) {
        if self.session.is_some() {
            self.verbose(|| format!("Disconnecting from database ({})", self.config.db_name));
            self.session = None;
            self.sequence = 0;
        }
        self.connected = false;
    }

    fn is_disconnected(&self) -> bool {
        self.session.is_none()
    }

    fn replicate(&mut self, block: &[u8]) -> Result<(), ReplicaError> {
        match self.session.as_mut() {
            Some(session) => session.apply(block),
            None => Err(ReplicaError::Apply {
                reason: "no replica session".to_string(),
            }),
        }
    }

    pub(crate) fn verbose(&self, message: impl FnOnce() -> String) {
        if self.config.verbose_logging {
            tracing::info!(db = %self.config.db_name, "{}", message());
        }
    }

    /// Log an error unless it repeats the previous one, so a stuck
    /// condition does not spam the log on every retry.
    pub(crate) fn log_error(&mut self, message: String) {
        if self.last_error.as_deref() != Some(message.as_str()) {
            tracing::error!(db = %self.config.db_name, "{message}");
            self.last_error = Some(message);
        }
    }
}

/// Run one pass for `target`, logging any error with duplicate
/// suppression.
pub fn run_pass(target: &mut Target) -> PassOutcome {
    match process_queue(target) {
        Ok(outcome) => outcome,
        Err(err) => {
            target.log_error(err.to_string());
            PassOutcome::Error
        }
    }
}

fn process_queue(target: &mut Target) -> Result<PassOutcome, ServerError> {
    target.verbose(|| {
        format!(
            "Scanning directory ({})",
            target.config.log_source_directory.display()
        )
    });

    let queue = scan_directory(&target.scan_options())?;

    if queue.is_empty() {
        target.verbose(|| "No suitable files found".to_string());
        return Ok(PassOutcome::Suspend);
    }

    target.verbose(|| format!("Added {} segments to the processing queue", queue.len()));

    let preserve = target.config.preserve_segments;
    let directory = target.config.log_source_directory.clone();

    let mut outcome = PassOutcome::Suspend;
    let mut transactions = ActiveTransactions::new();
    // Scratch buffer for one assembled block (header + payload), reused
    // across blocks and segments within the pass.
    let mut block_buf: Vec<u8> = Vec::new();

    let mut next_sequence = 0u64;
    // After a worker restart or a reconnect we must resume from the oldest
    // byte an open transaction still needs, not from the last checkpoint.
    let restart = target.is_disconnected();

    for index in 0..queue.len() {
        let segment = &queue[index];
        let sequence = segment.header.sequence;

        let mut control =
            ControlFile::open(&directory, &segment.header.guid, sequence, &mut transactions)?;

        let mut last_sequence = control.sequence();
        let mut last_offset = control.offset();

        let db_sequence = target.init_replica()?;
        let last_db_sequence = control.db_sequence();

        // The replica already absorbed this range, e.g. from a backup
        // restore or a parallel applier.
        if sequence <= db_sequence {
            target.verbose(|| {
                format!(
                    "Deleting file ({}) due to fast forward",
                    segment.path.display()
                )
            });
            segment.remove(preserve)?;
            continue;
        }

        // The replica was reset out-of-band: restart our cursor from its
        // self-reported position.
        if db_sequence != last_db_sequence {
            target.verbose(|| {
                format!(
                    "Resetting replication to continue from segment {}",
                    db_sequence + 1
                )
            });
            control.save_db_sequence(db_sequence)?;
            transactions.clear();
            control.save_complete(db_sequence, &transactions)?;
            last_sequence = db_sequence;
            last_offset = 0;
        }

        let mut oldest_sequence = transactions.oldest_sequence();

        // Earliest segment still interesting: the oldest one an open
        // transaction reaches into, else the segment we stopped inside,
        // else the one after the last completed.
        let threshold = if oldest_sequence != 0 {
            oldest_sequence
        } else if last_offset != 0 {
            last_sequence
        } else {
            last_sequence + 1
        };

        if sequence < threshold {
            target.verbose(|| {
                format!(
                    "Deleting file ({}) as priorly replicated",
                    segment.path.display()
                )
            });
            segment.remove(preserve)?;
            continue;
        }

        if next_sequence == 0 {
            next_sequence = if restart { threshold } else { last_sequence + 1 };
        }

        if sequence > next_sequence {
            return Err(ServerError::MissingSegment {
                sequence: next_sequence,
            });
        }

        // Already replayed, retained only for its open transactions.
        if sequence < next_sequence {
            continue;
        }

        target.verbose(|| {
            format!(
                "Replicating file ({}), segment {sequence}",
                segment.path.display()
            )
        });

        let org_oldest_sequence = oldest_sequence;

        let mut file = match File::open(&segment.path) {
            Ok(file) => file,
            Err(err) if is_sharing_violation(&err) => {
                target.verbose(|| {
                    format!(
                        "Stopping to process the queue, sharing violation for file ({})",
                        segment.path.display()
                    )
                });
                break;
            }
            Err(source) => {
                return Err(ServerError::Io {
                    path: segment.path.clone(),
                    source,
                });
            }
        };

        // The file must not have been rewritten since the scan.
        let mut raw_header = [0u8; SEGMENT_HEADER_LEN];
        file.read_exact(&mut raw_header)
            .map_err(|source| ServerError::Io {
                path: segment.path.clone(),
                source,
            })?;
        if raw_header != segment.raw_header {
            return Err(ServerError::SegmentChanged {
                path: segment.path.clone(),
            });
        }

        let segment_length = u64::from(segment.header.length);
        let mut total_offset = SEGMENT_HEADER_LEN as u64;

        while total_offset < segment_length {
            let mut header_buf = [0u8; BLOCK_HEADER_LEN];
            file.read_exact(&mut header_buf)
                .map_err(|source| ServerError::Io {
                    path: segment.path.clone(),
                    source,
                })?;
            let block = BlockHeader::decode(&header_buf);

            let payload_len = block.payload_len();
            let block_len = BLOCK_HEADER_LEN as u64 + payload_len;

            if total_offset + block_len > segment_length {
                return Err(ServerError::SegmentCorrupt {
                    path: segment.path.clone(),
                    reason: format!(
                        "block at offset {total_offset} overruns segment length {segment_length}"
                    ),
                });
            }

            if payload_len > 0 {
                // Bytes before the acknowledged checkpoint were already
                // processed by the replica; in rewind mode only blocks of
                // still-open transactions may be re-presented.
                let rewind = sequence < last_sequence
                    || (sequence == last_sequence
                        && (last_offset == 0 || total_offset < u64::from(last_offset)));

                block_buf.resize(BLOCK_HEADER_LEN + payload_len as usize, 0);
                block_buf[..BLOCK_HEADER_LEN].copy_from_slice(&header_buf);
                file.read_exact(&mut block_buf[BLOCK_HEADER_LEN..])
                    .map_err(|source| ServerError::Io {
                        path: segment.path.clone(),
                        source,
                    })?;

                if let Err(err) =
                    dispatch_block(target, &mut transactions, sequence, &block, &block_buf, rewind)
                {
                    oldest_sequence = transactions.oldest_sequence();
                    target.verbose(|| {
                        format!(
                            "Last segment:offset {}:{}, oldest segment {oldest_sequence}",
                            control.sequence(),
                            control.offset()
                        )
                    });
                    return Err(err.into());
                }
            }

            total_offset += block_len;

            // length is u32, so any in-bounds offset fits.
            control.save_partial(sequence, total_offset as u32, &transactions)?;
        }

        control.save_complete(sequence, &transactions)?;

        drop(file);

        target.verbose(|| {
            format!("Successfully replicated {total_offset} bytes in segment {sequence}")
        });

        oldest_sequence = transactions.oldest_sequence();
        next_sequence = sequence + 1;

        target.verbose(|| {
            format!(
                "Last segment:offset {}:{}, oldest segment {oldest_sequence}",
                control.sequence(),
                control.offset()
            )
        });

        // The oldest open transaction moved on (or everything committed):
        // segments we previously had to keep may now be removable.
        if org_oldest_sequence != 0 && oldest_sequence != org_oldest_sequence {
            let gc_threshold = if oldest_sequence != 0 {
                oldest_sequence.min(sequence)
            } else {
                sequence
            };

            if let Ok(mut pos) =
                queue.binary_search_by_key(&org_oldest_sequence, |s| s.header.sequence)
            {
                while pos < queue.len() {
                    let stale = &queue[pos];
                    pos += 1;

                    if stale.header.sequence >= gc_threshold {
                        break;
                    }

                    target.verbose(|| {
                        format!(
                            "Deleting file ({}) as already replicated",
                            stale.path.display()
                        )
                    });
                    stale.remove(preserve)?;
                }
            }
        }

        if oldest_sequence != 0 {
            target.verbose(|| {
                format!(
                    "Preserving file ({}) due to uncommitted transactions",
                    segment.path.display()
                )
            });
        } else {
            target.verbose(|| {
                format!(
                    "Deleting file ({}) as already replicated",
                    segment.path.display()
                )
            });
            segment.remove(preserve)?;
        }

        outcome = PassOutcome::Continue;
    }

    Ok(outcome)
}

/// Deliver one block to the replica (unless rewind suppresses it) and track
/// the transaction boundaries it carries.
fn dispatch_block(
    target: &mut Target,
    transactions: &mut ActiveTransactions,
    sequence: u64,
    block: &BlockHeader,
    bytes: &[u8],
    rewind: bool,
) -> Result<(), ReplicaError> {
    let transaction_id = block.transaction_id;

    // In rewind mode, only still-open transactions may be re-presented:
    // everything else is already durable downstream.
    if !rewind || transaction_id == 0 || transactions.contains(transaction_id) {
        target.replicate(bytes)?;
    }

    if block.ends_transaction() {
        if transaction_id != 0 {
            transactions.remove(transaction_id);
        } else if !rewind {
            // Engine-wide barrier; during rewind it was already applied.
            transactions.clear();
        }
    } else if block.begins_transaction() && !rewind && !transactions.contains(transaction_id) {
        transactions.insert(transaction_id, sequence);
    }

    Ok(())
}
