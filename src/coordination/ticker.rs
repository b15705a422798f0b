//! Periodic task loop shared by every monitor.
//!
//! Each monitor owns one `PeriodicTask`. A tick that returns an error or panics is logged
//! and the loop carries on, so one failing check never takes its monitor down. Ticks run
//! in their own task; a panic there is contained and does not trigger process shutdown.

use crate::error::Result;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

tokio::task_local! {
    static CONTAINED_TICK: ();
}

/// True while polling a periodic tick, whose panics are contained by its loop
pub fn in_contained_tick() -> bool {
    CONTAINED_TICK.try_with(|_| ()).is_ok()
}

pub struct PeriodicTask {
    name: String,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    /// Start ticking every `period`. A zero period yields an inert task.
    pub fn start<F, Fut>(name: &str, period: Duration, run_immediately: bool, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        if period.is_zero() {
            debug!(task = name, "periodic task disabled (zero interval)");
            return Self::inert(name);
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let task_name = name.to_string();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            if !run_immediately {
                // the first tick of a tokio interval completes immediately
                interval.tick().await;
            }

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        match tokio::spawn(CONTAINED_TICK.scope((), tick())).await {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => warn!(task = %task_name, error = %e, "periodic tick failed"),
                            Err(e) if e.is_panic() => error!(task = %task_name, "periodic tick panicked"),
                            Err(e) => warn!(task = %task_name, error = %e, "periodic tick cancelled"),
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(task = %task_name, "periodic task stopped");
        });

        Self {
            name: name.to_string(),
            stop_tx: Mutex::new(Some(stop_tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    fn inert(name: &str) -> Self {
        Self {
            name: name.to_string(),
            stop_tx: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    /// Stop the loop and wait for an in-progress tick to finish. Safe to call repeatedly.
    pub async fn stop(&self) {
        let stop_tx = self
            .stop_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(tx) = stop_tx {
            let _ = tx.send(true);
        }

        let handle = self
            .handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Some(handle) = self
            .handle
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}
