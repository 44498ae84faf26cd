//! Queue runtime: starts the worker pool and the watchdog, stops them on
//! request.
//!
//! Constructed once at process start and handed to whoever needs to stop
//! it. There is no process-wide instance.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use super::watchdog::Watchdog;
use super::worker::run_worker;
use crate::config::QueueConfig;
use crate::db::Db;
use crate::error::Result;
use crate::handler::HandlerRegistry;

#[derive(Clone)]
pub struct QueueRuntime {
    db: Arc<Db>,
    registry: Arc<HandlerRegistry>,
    config: QueueConfig,
    shutdown: Arc<watch::Sender<bool>>,
}

impl QueueRuntime {
    pub fn new(db: Arc<Db>, registry: Arc<HandlerRegistry>, config: QueueConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            db,
            registry,
            config,
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn db(&self) -> &Arc<Db> {
        &self.db
    }

    /// Signal every worker and the watchdog to stop. Workers finish the
    /// task they hold first.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Run the worker pool and watchdog until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<()> {
        let mut tasks = JoinSet::new();

        for index in 0..self.config.worker_count {
            tasks.spawn(run_worker(
                index,
                Arc::clone(&self.db),
                Arc::clone(&self.registry),
                self.config.clone(),
                self.shutdown.subscribe(),
            ));
        }

        let watchdog = Watchdog::new(Arc::clone(&self.db), self.config.watchdog_interval);
        tasks.spawn(watchdog.run(self.shutdown.subscribe()));

        info!(
            workers = self.config.worker_count,
            lease_secs = self.config.lease.as_secs(),
            retry = %self.config.retry,
            "queue runtime started"
        );

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "queue runtime task exited abnormally");
            }
        }

        info!("queue runtime stopped");
        Ok(())
    }
}
