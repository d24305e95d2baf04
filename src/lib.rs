#![forbid(unsafe_code)]

//! Replication change-log applier.
//!
//! A primary database archives its change log as ordered, numbered segment
//! files. This crate replays those segments against replica databases:
//! per-target worker threads scan the archive directory, reconstruct a
//! gap-free stream, hand blocks to the replica's change-applier through the
//! [`server::ReplicaConnector`] seam, and track durable progress in a
//! per-target control file so that a crash at any point resumes without
//! losing or duplicating committed work.
//!
//! The hosting server embeds the crate: it loads a [`config::Config`],
//! supplies a connector for its replica client library, and calls
//! [`server::repl_server`] with a shutdown flag.

pub mod config;
pub mod error;
pub mod server;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

pub use server::{
    ActiveTransactions, ControlFile, ControlSnapshot, DiscardConnector, LogSegment, PassOutcome,
    ReplServer, ReplicaConnector, ReplicaError, ReplicaSession, ServerError, Target, repl_server,
    run_pass,
};
