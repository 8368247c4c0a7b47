//! Per-connection flush worker.

use super::{FlushOutcome, SyncEngine};
use crate::error::{Result, SyncError};
use crate::types::{ConnectionId, Timestamp};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How long an idle worker sleeps between checks.
const IDLE_WAIT: Duration = Duration::from_millis(500);

/// A thread that flushes one connection at its effective period.
///
/// Publishes wake the worker of every affected connection. The worker exits
/// when the connection closes, [`FlushWorker::stop`] is called, or a newer
/// worker is spawned for the same connection.
pub struct FlushWorker {
    connection: ConnectionId,
    engine: Arc<SyncEngine>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FlushWorker {
    pub fn spawn(engine: Arc<SyncEngine>, connection: ConnectionId) -> Result<Self> {
        if engine.state(connection).is_none() {
            return Err(SyncError::ConnectionNotFound(connection));
        }
        let (waker, wakeups) = bounded(1);
        let token = engine.register_waker(connection, waker);

        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let engine = Arc::clone(&engine);
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name(format!("flush-{}", connection))
                .spawn(move || run(engine, connection, token, wakeups, stop))?
        };

        Ok(Self {
            connection,
            engine,
            stop,
            handle: Some(handle),
        })
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true)
    }

    /// Ask the worker to exit after its current flush.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.engine.wake(std::iter::once(&self.connection));
    }

    /// Stop the worker and wait for it to exit.
    pub fn join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!(connection = %self.connection, "flush worker panicked");
            }
        }
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    engine: Arc<SyncEngine>,
    connection: ConnectionId,
    token: u64,
    wakeups: Receiver<()>,
    stop: Arc<AtomicBool>,
) {
    tracing::debug!(connection = %connection, "flush worker started");
    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        let wait = match engine.flush(connection, Timestamp::now()) {
            Ok(FlushOutcome::NotDue(delay)) => delay,
            Ok(FlushOutcome::Flushed { .. }) | Ok(FlushOutcome::Skipped) => IDLE_WAIT,
            Ok(FlushOutcome::Aborted { .. }) | Err(_) => break,
        };
        match wakeups.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    engine.unregister_waker(connection, token);
    tracing::debug!(connection = %connection, "flush worker stopped");
}
