use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::manager::{BackupError, BackupManager};

#[derive(Debug, Clone, Copy)]
enum Job {
    /// Full backup followed by retention cleanup.
    Backup,
    Cleanup,
}

impl Job {
    fn name(self) -> &'static str {
        match self {
            Job::Backup => "backup",
            Job::Cleanup => "cleanup",
        }
    }

    async fn run(self, manager: &BackupManager) {
        if let Job::Backup = self {
            match manager.create_full_backup().await {
                Ok(info) => info!(filename = %info.filename, size = info.size, "scheduled backup created"),
                Err(e) => error!(error = %format!("{e:#}"), "scheduled backup failed"),
            }
        }
        match manager.clean_old_backups().await {
            Ok(removed) if removed > 0 => info!(removed, "retention pruning removed old backups"),
            Ok(_) => {}
            Err(e) => error!(error = %format!("{e:#}"), "retention pruning failed"),
        }
    }
}

struct Timer {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Recurring backup and cleanup timers for one [`BackupManager`].
///
/// At most one timer of each kind runs at a time. Stopping a timer only
/// prevents future ticks; a tick that is already running finishes.
pub struct BackupScheduler {
    manager: Arc<BackupManager>,
    backups: Mutex<Option<Timer>>,
    cleanup: Mutex<Option<Timer>>,
}

impl BackupScheduler {
    pub fn new(manager: Arc<BackupManager>) -> Self {
        Self {
            manager,
            backups: Mutex::new(None),
            cleanup: Mutex::new(None),
        }
    }

    /// Backs up and then cleans every `interval`, replacing any running backup timer.
    /// The first tick fires one full interval from now.
    pub fn schedule_backups(&self, interval: Duration) -> Result<()> {
        self.start(&self.backups, Job::Backup, interval)
    }

    pub fn schedule_cleanup(&self, interval: Duration) -> Result<()> {
        self.start(&self.cleanup, Job::Cleanup, interval)
    }

    pub fn stop_scheduled_backups(&self) {
        stop(&self.backups, Job::Backup);
    }

    pub fn stop_scheduled_cleanup(&self) {
        stop(&self.cleanup, Job::Cleanup);
    }

    pub fn is_active(&self) -> bool {
        is_running(&self.backups)
    }

    pub fn is_cleanup_active(&self) -> bool {
        is_running(&self.cleanup)
    }

    /// Stops both timers and waits for any in-flight tick to finish.
    pub async fn shutdown(&self) {
        let timers = [lock(&self.backups).take(), lock(&self.cleanup).take()];
        for timer in timers.into_iter().flatten() {
            let _ = timer.stop.send(());
            if let Err(e) = timer.handle.await {
                error!(error = %e, "scheduler task ended abnormally");
            }
        }
        info!("scheduler shut down");
    }

    fn start(&self, slot: &Mutex<Option<Timer>>, job: Job, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(BackupError::InvalidInterval.into());
        }
        stop(slot, job);

        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(tick_loop(self.manager.clone(), job, interval, stop_rx));
        *lock(slot) = Some(Timer {
            stop: stop_tx,
            handle,
        });
        info!(job = job.name(), interval_secs = interval.as_secs_f64(), "scheduled recurring job");
        Ok(())
    }
}

impl Drop for BackupScheduler {
    fn drop(&mut self) {
        stop(&self.backups, Job::Backup);
        stop(&self.cleanup, Job::Cleanup);
    }
}

async fn tick_loop(manager: Arc<BackupManager>, job: Job, period: Duration, mut stop: oneshot::Receiver<()>) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        // Stop wins over an overdue tick left ready by a slow previous run.
        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = ticker.tick() => {
                debug!(job = job.name(), "scheduler tick");
                job.run(&manager).await;
            }
        }
    }
    debug!(job = job.name(), "scheduler loop exited");
}

fn stop(slot: &Mutex<Option<Timer>>, job: Job) {
    if let Some(timer) = lock(slot).take() {
        let _ = timer.stop.send(());
        info!(job = job.name(), "stopped scheduled job");
    }
}

fn is_running(slot: &Mutex<Option<Timer>>) -> bool {
    lock(slot)
        .as_ref()
        .is_some_and(|timer| !timer.handle.is_finished())
}

fn lock(slot: &Mutex<Option<Timer>>) -> MutexGuard<'_, Option<Timer>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
