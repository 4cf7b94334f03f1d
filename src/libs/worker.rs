//! Supervised periodic workers.
//!
//! Each monitored user runs a handful of independent loops (probe sampling,
//! background aggregation, idle re-evaluation, fusion). A [`PeriodicWorker`]
//! wraps one of them: a tokio task ticking on a fixed period until its
//! [`CancellationToken`] fires. Stopping a user cancels the shared token and
//! joins every worker, so no tick can run after the join returns.
//!
//! Ticks touch SQLite and `sysinfo`, so each one runs on the blocking pool and
//! the loop awaits it before checking for cancellation again.

use crate::libs::messages::Message;
use crate::{msg_debug, msg_warning};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub struct PeriodicWorker {
    name: String,
    handle: JoinHandle<()>,
}

impl PeriodicWorker {
    /// Spawns `tick` every `period` on the given runtime.
    ///
    /// The first tick fires one full period after spawning. Ticks never
    /// overlap; a slow tick delays the next one instead of bursting. A tick
    /// in flight when the token fires is allowed to finish.
    pub fn spawn<F>(runtime: &Handle, name: impl Into<String>, period: Duration, cancel: CancellationToken, tick: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let name = name.into();
        let task_name = name.clone();
        let period = period.max(Duration::from_millis(10));
        let tick = Arc::new(tick);

        let handle = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        msg_debug!(Message::WorkerStopped(task_name.clone()));
                        break;
                    }
                    _ = ticker.tick() => {
                        let tick = tick.clone();
                        if let Err(e) = tokio::task::spawn_blocking(move || tick()).await {
                            msg_warning!(Message::WorkerTickFailed(task_name.clone(), e.to_string()));
                        }
                    }
                }
            }
        });

        Self { name, handle }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Waits for the worker to finish. The owning token must be cancelled
    /// first or this waits forever.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            msg_warning!(Message::WorkerJoinFailed(self.name, e.to_string()));
        }
    }
}
