//! Timeout/Retry sweeper
//!
//! Periodic job that fails InProgress jobs whose deployment-configured
//! timeout has elapsed. Timeouts are wall-clock and owned by this separate
//! process, so a crashed worker never leaves jobs stuck. This is the only
//! component permitted to move a job out of InProgress purely on elapsed
//! time. After failing a job the sweeper consults the matched retry rule
//! and re-queues an evaluation when attempts remain.

use std::sync::Arc;

use pennant_core::domain::job::JobStatus;
use pennant_core::workitem::WorkItemKind;
use sqlx::PgPool;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::pipeline;
use crate::queue::WorkQueue;
use crate::repository::{job_repository, policy_repository, target_repository};

/// Fixed failure message stamped on timed-out jobs
pub const TIMED_OUT_MESSAGE: &str = "timed out";

pub struct TimeoutSweeper {
    pool: PgPool,
    queue: Arc<dyn WorkQueue>,
    interval: std::time::Duration,
}

impl TimeoutSweeper {
    pub fn new(pool: PgPool, queue: Arc<dyn WorkQueue>, interval: std::time::Duration) -> Self {
        Self {
            pool,
            queue,
            interval,
        }
    }

    /// Periodic sweep loop; runs until the task is dropped.
    pub async fn run(&self) {
        info!("Timeout sweeper started (interval: {:?})", self.interval);

        let mut ticker = tokio::time::interval(self.interval);
        loop {
            ticker.tick().await;

            match self.sweep_once().await {
                Ok(failed) => {
                    if failed > 0 {
                        info!("Timed out {} job(s) this sweep", failed);
                    }
                }
                Err(e) => error!("Sweep failed: {}", e),
            }
        }
    }

    /// Fail every overrunning job and trigger retry policy.
    pub async fn sweep_once(&self) -> Result<usize> {
        let overrunning = job_repository::find_timed_out(&self.pool).await?;
        let mut failed = 0;

        for job in overrunning {
            // Guarded transition: only InProgress jobs are failed on elapsed
            // time, and a concurrent status report wins over the sweep.
            let transitioned = job_repository::transition(
                &self.pool,
                job.id,
                &[JobStatus::InProgress],
                JobStatus::Failure,
                Some(TIMED_OUT_MESSAGE),
            )
            .await?;
            if !transitioned {
                continue;
            }
            failed += 1;

            warn!(
                "Job {} timed out on target {} (attempt {})",
                job.id, job.release_target_id, job.attempt
            );

            self.apply_retry_policy(&job).await?;
        }

        Ok(failed)
    }

    async fn apply_retry_policy(&self, job: &pennant_core::domain::job::Job) -> Result<()> {
        let policies =
            policy_repository::list_matching_target(&self.pool, job.release_target_id).await?;
        let Some(max_retries) = pipeline::retry_max(&policies) else {
            return Ok(());
        };

        if job.attempt < max_retries {
            let Some(target) =
                target_repository::find_by_id(&self.pool, job.release_target_id).await?
            else {
                return Ok(());
            };
            self.queue
                .enqueue(
                    WorkItemKind::EvaluateReleaseTarget,
                    target.id,
                    target.workspace_id,
                )
                .await?;
            info!(
                "Re-queued evaluation of target {} after timeout ({} of {} retries used)",
                target.id,
                job.attempt + 1,
                max_retries
            );
        }

        Ok(())
    }
}
