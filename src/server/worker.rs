//! Per-target worker threads and the server entry point.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crate::config::TargetConfig;

use super::replay::{PassOutcome, Target, run_pass};
use super::replica::ReplicaConnector;

/// Handle over the running worker threads.
///
/// Each worker owns its [`Target`] exclusively; the only shared state is
/// the shutdown flag and the active-worker counter.
pub struct ReplServer {
    workers: Vec<JoinHandle<()>>,
    active: Arc<AtomicUsize>,
}

impl ReplServer {
    /// Spawn one worker thread per configured target.
    ///
    /// Workers observe `shutdown` at loop boundaries; raising it lets each
    /// worker finish its current pass and exit.
    pub fn start(
        connector: Arc<dyn ReplicaConnector>,
        targets: Vec<TargetConfig>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        let active = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::with_capacity(targets.len());

        for config in targets {
            let target = Target::new(config, Arc::clone(&connector));
            let shutdown = Arc::clone(&shutdown);
            let active = Arc::clone(&active);
            active.fetch_add(1, Ordering::SeqCst);
            workers.push(thread::spawn(move || {
                run_worker_loop(target, shutdown, active);
            }));
        }

        Self { workers, active }
    }

    /// Number of workers that have not yet exited.
    pub fn active_workers(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Block until every worker has exited.
    pub fn wait(self) {
        for handle in self.workers {
            let _ = handle.join();
        }
    }
}

/// Spawn the replication server over the configured targets.
///
/// With `wait` the call blocks until all workers observed the shutdown flag
/// and exited; otherwise it returns immediately after spawning and the
/// workers run detached.
pub fn repl_server(
    connector: Arc<dyn ReplicaConnector>,
    targets: Vec<TargetConfig>,
    shutdown: Arc<AtomicBool>,
    wait: bool,
) {
    let server = ReplServer::start(connector, targets, shutdown);
    if wait {
        server.wait();
    }
}

fn run_worker_loop(mut target: Target, shutdown: Arc<AtomicBool>, active: Arc<AtomicUsize>) {
    target.verbose(|| "Started replication thread".to_string());

    while !shutdown.load(Ordering::Relaxed) {
        let outcome = run_pass(&mut target);

        // More segments may already be waiting after a productive pass.
        if outcome == PassOutcome::Continue {
            continue;
        }

        target.disconnect();

        if !shutdown.load(Ordering::Relaxed) {
            let timeout = if outcome == PassOutcome::Suspend {
                target.config().apply_idle_timeout()
            } else {
                target.config().apply_error_timeout()
            };

            target.verbose(|| format!("Going to sleep for {} seconds", timeout.as_secs()));
            thread::sleep(timeout);
        }
    }

    target.verbose(|| "Finished replication thread".to_string());

    active.fetch_sub(1, Ordering::SeqCst);
}
