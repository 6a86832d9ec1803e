use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::UnitError;

// ─── Unit ─────────────────────────────────────────────────────────────────

/// One independently supervised piece of work: a watcher, a monitor, the
/// approval router, or the scheduler.
#[async_trait]
pub trait Unit: Send {
    fn name(&self) -> &str;

    /// Do one round of work. Per-item problems are handled inside the tick;
    /// an `Err` means the unit itself is unhealthy.
    async fn tick(&mut self) -> Result<(), UnitError>;
}

/// Tick `unit` every `interval` until `shutdown` turns true or its sender
/// is dropped. The stop signal is only observed between ticks, so an
/// in-flight tick always completes.
pub async fn run_loop(
    unit: &mut dyn Unit,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), UnitError> {
    loop {
        if *shutdown.borrow() {
            return Ok(());
        }
        unit.tick().await?;
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

// ─── RunningUnit ──────────────────────────────────────────────────────────

/// A unit started on its own task, outside any supervision.
pub struct RunningUnit {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<(), UnitError>>,
}

impl RunningUnit {
    /// Spawn `unit` ticking every `poll_interval`.
    pub fn start<U: Unit + 'static>(mut unit: U, poll_interval: Duration) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { run_loop(&mut unit, poll_interval, stop_rx).await });
        Self { stop_tx, handle }
    }

    /// Request a stop and wait for the in-flight tick to finish.
    pub async fn stop(self) -> Result<(), UnitError> {
        let _ = self.stop_tx.send(true);
        match self.handle.await {
            Ok(r) => r,
            Err(e) => Err(UnitError::Crashed {
                unit: "unit".into(),
                reason: format!("task failed: {e}"),
            }),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
