//! Watchdog: fail tasks whose lease expired without a result.
//!
//! A crashed or hung worker must not leave its task claimed forever. The
//! watchdog never retries; it records the failure so status resolution
//! reports it and a producer can enqueue the work again.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::db::Db;
use crate::error::Result;
use crate::model::TaskId;

pub struct Watchdog {
    db: Arc<Db>,
    interval: Duration,
}

impl Watchdog {
    pub fn new(db: Arc<Db>, interval: Duration) -> Self {
        Self { db, interval }
    }

    /// Run one sweep. Returns the tasks that were failed.
    pub async fn tick(&self) -> Result<Vec<TaskId>> {
        let expired = self.db.sweep_expired().await?;
        for (id, kind) in &expired {
            warn!(id = %id, kind = %kind, "task lease expired, marked error");
        }
        Ok(expired.into_iter().map(|(id, _)| id).collect())
    }

    /// Sweep every interval until shutdown. The first sweep runs at once so
    /// leases abandoned before a restart are reclaimed promptly.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = self.interval.as_secs(), "watchdog started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            if let Err(e) = self.tick().await {
                error!(error = %e, "watchdog sweep failed");
            }
        }

        info!("watchdog stopped");
    }
}
