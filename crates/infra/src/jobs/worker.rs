//! Long-running consume loop.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::dispatcher::{DispatchError, Dispatcher};
use super::types::Disposition;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging
    pub name: String,
    /// Pause after a broker or recording failure before polling again
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "classification-worker".to_string(),
            error_backoff: Duration::from_secs(1),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct WorkerStats {
    pub deliveries: u64,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub dropped: u64,
    pub errors: u64,
    pub uptime_secs: u64,
}

impl WorkerStats {
    fn count(&mut self, disposition: Disposition) {
        self.deliveries += 1;
        match disposition {
            Disposition::Success => self.succeeded += 1,
            Disposition::Retry => self.retried += 1,
            Disposition::DeadLetter => self.dead_lettered += 1,
            Disposition::Drop => self.dropped += 1,
        }
    }
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the in-flight delivery to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(err) = join.await {
                error!(error = %err, "worker task ended abnormally");
            }
        }
    }

    /// Get current worker statistics.
    pub fn stats(&self) -> WorkerStats {
        self.stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

/// Background worker driving a [`Dispatcher`].
pub struct Worker {
    dispatcher: Arc<Dispatcher>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(dispatcher: Arc<Dispatcher>, config: WorkerConfig) -> Self {
        Self { dispatcher, config }
    }

    /// Declare the topology, then spawn the consume loop on the current tokio runtime.
    pub async fn start(self) -> Result<WorkerHandle, DispatchError> {
        self.dispatcher.declare_topology().await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let join = tokio::spawn(worker_loop(
            self.dispatcher,
            self.config,
            shutdown_rx,
            stats.clone(),
        ));

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        })
    }
}

async fn worker_loop(
    dispatcher: Arc<Dispatcher>,
    config: WorkerConfig,
    mut shutdown: watch::Receiver<bool>,
    stats: Arc<Mutex<WorkerStats>>,
) {
    info!(worker = %config.name, queue = %dispatcher.queue(), "worker started");
    let start_time = Instant::now();

    loop {
        // Shutdown is only observed between deliveries.
        let stop = *shutdown.borrow();
        if stop {
            break;
        }

        let result = dispatcher.poll_once().await;

        if let Ok(mut s) = stats.lock() {
            s.uptime_secs = start_time.elapsed().as_secs();
            match &result {
                Ok(Some(disposition)) => s.count(*disposition),
                Ok(None) => {}
                Err(_) => s.errors += 1,
            }
        }

        match result {
            Ok(Some(disposition)) => {
                debug!(worker = %config.name, disposition = disposition.as_str(), "delivery settled");
            }
            Ok(None) => {}
            Err(err) => {
                error!(worker = %config.name, error = %err, "delivery handling failed; backing off");
                tokio::select! {
                    _ = tokio::time::sleep(config.error_backoff) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }

    info!(worker = %config.name, "worker stopped");
}
