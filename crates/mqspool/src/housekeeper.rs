//! Spool Housekeeping Background Task
//!
//! Periodic maintenance for the message spool:
//!
//! 1. Purge terminal rows (dropped, confirmed, published fire-and-forget)
//!    older than the purge horizon
//! 2. Optionally checkpoint the backend, for deployments where the engine
//!    runs without write-ahead data logging and needs an explicit flush
//!
//! ## Scheduling
//!
//! The task fires one second after start and then at a fixed rate. A tick
//! that fails is logged and the schedule keeps running; a maintenance
//! failure must never kill the scheduler.
//!
//! ## Cancellation
//!
//! `stop` and `update` signal shutdown over a oneshot channel and raise a
//! cancellation flag that the purge observes between its delete sweeps,
//! so a tick in progress winds down at the next statement boundary
//! instead of being torn mid-transaction.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info};

use crate::store::SqliteMessageStore;
use crate::MessageStore;

/// Delay before the first tick after start.
const START_DELAY: Duration = Duration::from_secs(1);

/// Housekeeper configuration.
#[derive(Debug, Clone)]
pub struct HousekeeperConfig {
    /// Period of the maintenance tick (default: 15 minutes).
    pub interval: Duration,
    /// Age past which terminal rows are purged (default: 60 seconds).
    pub purge_age: Duration,
    /// Checkpoint after each purge. Enable when the backend runs without
    /// write-ahead data logging (default: off).
    pub checkpoint: bool,
}

impl Default for HousekeeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(900),
            purge_age: Duration::from_secs(60),
            checkpoint: false,
        }
    }
}

struct RunningTask {
    handle: JoinHandle<()>,
    shutdown_tx: oneshot::Sender<()>,
    cancelled: Arc<AtomicBool>,
}

/// Scheduled maintenance task for a [`SqliteMessageStore`].
///
/// The store handle is passed in at scheduling time; the task owns a
/// clone of the `Arc` and nothing points back at the task, so the
/// housekeeper never outlives the spool it serves.
pub struct Housekeeper {
    store: Arc<SqliteMessageStore>,
    task: Mutex<Option<RunningTask>>,
}

impl Housekeeper {
    /// Starts housekeeping for `store` with the given schedule.
    pub fn start(store: Arc<SqliteMessageStore>, config: HousekeeperConfig) -> Self {
        let task = Self::spawn(Arc::clone(&store), config);
        Self {
            store,
            task: Mutex::new(Some(task)),
        }
    }

    /// Cancels the running schedule and starts a fresh one with the new
    /// parameters.
    pub async fn update(&self, config: HousekeeperConfig) {
        let mut slot = self.task.lock().await;
        if let Some(task) = slot.take() {
            stop_task(task).await;
        }
        *slot = Some(Self::spawn(Arc::clone(&self.store), config));
    }

    /// Cancels the schedule. Idempotent; a tick in progress winds down at
    /// its next cancellation point before this returns.
    pub async fn stop(&self) {
        let mut slot = self.task.lock().await;
        if let Some(task) = slot.take() {
            stop_task(task).await;
        }
    }

    fn spawn(store: Arc<SqliteMessageStore>, config: HousekeeperConfig) -> RunningTask {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);

        let handle = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + START_DELAY, config.interval);
            info!(
                "housekeeper started (interval: {:?}, purge age: {:?})",
                config.interval, config.purge_age
            );

            loop {
                tokio::select! {
                    _ = ticks.tick() => {
                        run_tick(&store, &config, &flag).await;
                        if flag.load(Ordering::Relaxed) {
                            break;
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("housekeeper shutting down");
                        break;
                    }
                }
            }
        });

        RunningTask {
            handle,
            shutdown_tx,
            cancelled,
        }
    }
}

async fn stop_task(task: RunningTask) {
    task.cancelled.store(true, Ordering::Relaxed);
    let _ = task.shutdown_tx.send(());
    let _ = task.handle.await;
}

async fn run_tick(store: &SqliteMessageStore, config: &HousekeeperConfig, cancelled: &AtomicBool) {
    debug!("housekeeping tick");

    match store
        .delete_stale_with_cancel(config.purge_age, Some(cancelled))
        .await
    {
        Ok(deleted) if deleted > 0 => debug!("housekeeping purged {} stale messages", deleted),
        Ok(_) => {}
        Err(e) => error!("housekeeping purge failed: {}", e),
    }

    if cancelled.load(Ordering::Relaxed) {
        return;
    }

    if config.checkpoint {
        if let Err(e) = store.checkpoint().await {
            error!("housekeeping checkpoint failed: {}", e);
        }
    }
}
