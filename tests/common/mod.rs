//! Shared fixtures: a segment builder and a recording replica.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use replog::config::TargetConfig;
use replog::server::{
    BLOCK_HEADER_LEN, BlockHeader, ReplicaConnector, ReplicaError, ReplicaSession,
    SEGMENT_HEADER_LEN, SegmentHeader, SegmentState,
};

/// Writes segment files the way the primary would.
pub struct SegmentBuilder {
    guid: Uuid,
    sequence: u64,
    state: SegmentState,
    blocks: Vec<u8>,
}

impl SegmentBuilder {
    pub fn new(guid: Uuid, sequence: u64) -> Self {
        Self {
            guid,
            sequence,
            state: SegmentState::Full,
            blocks: Vec::new(),
        }
    }

    pub fn state(mut self, state: SegmentState) -> Self {
        self.state = state;
        self
    }

    pub fn block(mut self, transaction_id: u64, flags: u32, data: &[u8]) -> Self {
        let header = BlockHeader {
            transaction_id,
            flags,
            data_length: data.len() as u32,
            meta_length: 0,
        };
        self.blocks.extend_from_slice(&header.encode());
        self.blocks.extend_from_slice(data);
        self
    }

    pub fn write(self, directory: &Path) -> PathBuf {
        let header = SegmentHeader {
            state: self.state,
            guid: self.guid,
            sequence: self.sequence,
            length: (SEGMENT_HEADER_LEN + self.blocks.len()) as u32,
        };
        let mut bytes = header.encode().to_vec();
        bytes.extend_from_slice(&self.blocks);

        let path = directory.join(format!("archive_{:06}", self.sequence));
        fs::write(&path, bytes).unwrap();
        path
    }
}

/// Replica connector that records every applied block and allows failure
/// injection. Cloning shares the recorded state.
#[derive(Clone)]
pub struct RecordingConnector {
    sequence: Arc<AtomicU64>,
    applied: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Apply calls fail once this many blocks were accepted.
    fail_after: Arc<AtomicUsize>,
    connects: Arc<AtomicUsize>,
}

impl RecordingConnector {
    pub fn new(sequence: u64) -> Self {
        Self {
            sequence: Arc::new(AtomicU64::new(sequence)),
            applied: Arc::new(Mutex::new(Vec::new())),
            fail_after: Arc::new(AtomicUsize::new(usize::MAX)),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn set_sequence(&self, sequence: u64) {
        self.sequence.store(sequence, Ordering::SeqCst);
    }

    pub fn fail_after(&self, accepted_blocks: usize) {
        self.fail_after.store(accepted_blocks, Ordering::SeqCst);
    }

    pub fn clear_failure(&self) {
        self.fail_after.store(usize::MAX, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn applied_blocks(&self) -> Vec<Vec<u8>> {
        self.applied.lock().unwrap().clone()
    }

    /// Payload bytes of every applied block, in delivery order.
    pub fn applied_payloads(&self) -> Vec<Vec<u8>> {
        self.applied_blocks()
            .iter()
            .map(|block| block[BLOCK_HEADER_LEN..].to_vec())
            .collect()
    }
}

impl ReplicaConnector for RecordingConnector {
    fn connect(
        &self,
        _db_name: &str,
        _user: &str,
    ) -> Result<Box<dyn ReplicaSession>, ReplicaError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingSession {
            connector: self.clone(),
        }))
    }
}

struct RecordingSession {
    connector: RecordingConnector,
}

impl ReplicaSession for RecordingSession {
    fn replication_sequence(&mut self) -> Result<u64, ReplicaError> {
        Ok(self.connector.sequence.load(Ordering::SeqCst))
    }

    fn apply(&mut self, block: &[u8]) -> Result<(), ReplicaError> {
        let mut applied = self.connector.applied.lock().unwrap();
        if applied.len() >= self.connector.fail_after.load(Ordering::SeqCst) {
            return Err(ReplicaError::Apply {
                reason: "injected failure".to_string(),
            });
        }
        applied.push(block.to_vec());
        Ok(())
    }
}

pub fn target_config(directory: &Path) -> TargetConfig {
    TargetConfig {
        db_name: "replica".to_string(),
        log_source_directory: directory.to_path_buf(),
        ..TargetConfig::default()
    }
}

/// Names of the plain files currently in the directory, sorted.
pub fn dir_entries(directory: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(directory)
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
