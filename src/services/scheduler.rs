//! Cron-driven trigger loop for backup runs.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::{str::FromStr, sync::Arc, time::Duration};
use tokio::{sync::Semaphore, task::JoinHandle};
use tracing::{info, warn};

use crate::errors::{BackupError, BackupResult};

/// Every day at 05:00 UTC. Fields: sec min hour day-of-month month day-of-week.
pub const DEFAULT_SCHEDULE: &str = "0 0 5 * * *";

/// Work performed on every firing.
#[async_trait]
pub trait ScheduledRun: Send + Sync + 'static {
    async fn run(&self);
}

pub struct Scheduler {
    schedule: Schedule,
    single_flight: bool,
    target: Arc<dyn ScheduledRun>,
}

impl Scheduler {
    /// Parse `expr` (six or seven cron fields, second resolution).
    ///
    /// With `single_flight`, a firing is skipped while the previous run is
    /// still going; otherwise runs may overlap.
    pub fn new(
        expr: &str,
        single_flight: bool,
        target: Arc<dyn ScheduledRun>,
    ) -> BackupResult<Self> {
        let schedule = Schedule::from_str(expr).map_err(|err| {
            BackupError::Configuration(format!("invalid schedule `{expr}`: {err}"))
        })?;
        Ok(Self {
            schedule,
            single_flight,
            target,
        })
    }

    /// Spawn the trigger loop. It only returns if the schedule has no
    /// further firings.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(1));
            let mut cursor = Utc::now();
            loop {
                let Some(next) = self.next_after(cursor) else {
                    warn!("schedule has no upcoming firings, stopping");
                    return;
                };
                info!("next backup run at {}", next);
                let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::time::sleep(wait).await;
                self.fire(&permits);
                cursor = next;
            }
        })
    }

    /// Next firing strictly after both `cursor` and the current time, so a
    /// firing is never repeated and missed ones are not replayed.
    fn next_after(&self, cursor: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let from = cursor.max(Utc::now());
        self.schedule.after(&from).next()
    }

    fn fire(&self, permits: &Arc<Semaphore>) {
        let target = self.target.clone();
        if !self.single_flight {
            tokio::spawn(async move { target.run().await });
            return;
        }
        match permits.clone().try_acquire_owned() {
            Ok(permit) => {
                tokio::spawn(async move {
                    target.run().await;
                    drop(permit);
                });
            }
            Err(_) => warn!("previous backup run still in progress, skipping this firing"),
        }
    }
}
