//! Client seam towards a replica database.
//!
//! The driver never interprets block payloads; it hands them to a
//! [`ReplicaSession`] supplied by the hosting server. The session wraps
//! whatever client library actually talks to the replica and its
//! change-applier.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("replica connect failed for {db_name}: {reason}")]
    Connect { db_name: String, reason: String },
    #[error("replication sequence query failed: {reason}")]
    Sequence { reason: String },
    #[error("replica apply failed: {reason}")]
    Apply { reason: String },
}

/// One replicator session against a replica database.
///
/// Dropping the session closes it.
pub trait ReplicaSession: Send {
    /// The replica's self-reported `REPLICATION_SEQUENCE`: the highest
    /// segment whose effects it has durably absorbed.
    fn replication_sequence(&mut self) -> Result<u64, ReplicaError>;

    /// Hand one raw block (header + payload bytes) to the replica's
    /// change-applier.
    fn apply(&mut self, block: &[u8]) -> Result<(), ReplicaError>;
}

/// Factory for replica sessions; one connector serves all targets.
pub trait ReplicaConnector: Send + Sync {
    fn connect(&self, db_name: &str, user: &str)
    -> Result<Box<dyn ReplicaSession>, ReplicaError>;
}

/// Connector whose sessions report a fixed replication sequence and accept
/// every block without applying it anywhere.
///
/// Useful for draining a log directory without a replica attached, and for
/// tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiscardConnector {
    pub sequence: u64,
}

impl DiscardConnector {
    pub fn new(sequence: u64) -> Self {
        Self { sequence }
    }
}

impl ReplicaConnector for DiscardConnector {
    fn connect(
        &self,
        _db_name: &str,
        _user: &str,
    ) -> Result<Box<dyn ReplicaSession>, ReplicaError> {
        Ok(Box::new(DiscardSession {
            sequence: self.sequence,
        }))
    }
}

struct DiscardSession {
    sequence: u64,
}

impl ReplicaSession for DiscardSession {
    fn replication_sequence(&mut self) -> Result<u64, ReplicaError> {
        Ok(self.sequence)
    }

    fn apply(&mut self, _block: &[u8]) -> Result<(), ReplicaError> {
        Ok(())
    }
}
