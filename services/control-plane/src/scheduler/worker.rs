//! Scheduler background worker.
//!
//! Runs the promotion policies on a periodic interval.

use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::watch;
use tracing::{error, info, instrument};

use super::{PolicySettings, ScheduleStats, SchedulerPolicy, SchedulerResult};

/// Scheduler worker that runs promotion passes.
pub struct SchedulerWorker {
    policy: SchedulerPolicy,
    interval: Duration,
}

impl SchedulerWorker {
    /// Create a new scheduler worker.
    pub fn new(pool: SqlitePool, settings: &PolicySettings, interval: Duration) -> Self {
        Self {
            policy: SchedulerPolicy::new(pool, settings),
            interval,
        }
    }

    /// Run the scheduler worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting scheduler worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Scheduler pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Scheduler worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Run a single promotion pass.
    pub async fn run_once(&self) -> SchedulerResult<ScheduleStats> {
        let stats = self.policy.apply_all().await?;

        if stats.promoted() > 0 {
            info!(
                control_plane_promoted = stats.control_plane.promoted,
                control_plane_current = stats.control_plane.current,
                nodes_promoted = stats.nodes.promoted,
                nodes_current = stats.nodes.current,
                "Scheduler pass complete"
            );
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::testutil::discover;

    #[tokio::test]
    async fn test_worker_promotes_and_stops() {
        let db = Database::in_memory().await.unwrap();
        discover(&db, 4).await;
        let worker = SchedulerWorker::new(
            db.pool().clone(),
            &PolicySettings::default(),
            Duration::from_millis(10),
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            worker.run(rx).await;
        });

        let store = crate::scheduler::MachineScheduleStore::new(db.pool().clone());
        for _ in 0..100 {
            if store.get_all_schedules().await.unwrap().len() == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.get_all_schedules().await.unwrap().len(), 4);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_once_with_nothing_to_do() {
        let db = Database::in_memory().await.unwrap();
        let worker = SchedulerWorker::new(
            db.pool().clone(),
            &PolicySettings::default(),
            Duration::from_secs(60),
        );

        let stats = worker.run_once().await.unwrap();
        assert_eq!(stats.promoted(), 0);
        assert!(!stats.control_plane.satisfied);
    }
}
