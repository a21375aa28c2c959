use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::background::{TaskContext, TaskPool};
use crate::core::error::StoreError;
use crate::core::store::FleetStore;
use crate::core::store::types::{JobStatus, format_ts, now_ts, parse_ts};

/// What a sweep did to one claimed job.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SweepOutcome {
    pub job_id: String,
    pub job_name: String,
    pub status: JobStatus,
    pub commands_enqueued: usize,
    pub next_run_at: Option<String>,
}

/// Promotes due scheduled jobs into dispatched commands. Sweeps may run from
/// the periodic tick and from the explicit API trigger at the same time;
/// the per-job claim makes the overlap harmless.
pub struct JobSweeper {
    store: Arc<FleetStore>,
}

impl JobSweeper {
    pub fn new(store: Arc<FleetStore>) -> Self {
        Self { store }
    }

    pub async fn sweep(&self, now: &str) -> Result<Vec<SweepOutcome>, StoreError> {
        let due = self.store.due_scheduled_jobs(now).await?;
        let mut outcomes = Vec::new();

        for job in due {
            if !self.store.claim_scheduled_job(&job.id).await? {
                // A concurrent sweep won this job. Not a failure.
                debug!("Lost claim on job {} ({}); skipping", job.id, job.name);
                continue;
            }

            let mut enqueued = 0usize;
            let mut enqueue_error = None;
            for host in &job.target_hosts {
                match self
                    .store
                    .enqueue_command(host, &job.action_type, job.payload.clone(), Some(&job.id))
                    .await
                {
                    Ok(_) => enqueued += 1,
                    Err(e) => {
                        enqueue_error = Some(e);
                        break;
                    }
                }
            }

            if let Some(e) = enqueue_error {
                warn!("Job {} ({}) failed during fan-out: {}", job.id, job.name, e);
                self.store.fail_scheduled_job(&job.id).await?;
                outcomes.push(SweepOutcome {
                    job_id: job.id,
                    job_name: job.name,
                    status: JobStatus::Failed,
                    commands_enqueued: enqueued,
                    next_run_at: None,
                });
                continue;
            }

            // The next occurrence advances from the run the job was scheduled
            // for, not from the sweep's wall clock, so late sweeps never
            // shift the cadence.
            let next_run_at = job
                .recurrence
                .next_run_at(parse_ts(&job.run_at)?)
                .map(format_ts);
            self.store
                .complete_scheduled_job(&job.id, next_run_at.as_deref())
                .await?;

            let status = if next_run_at.is_some() {
                JobStatus::Scheduled
            } else {
                JobStatus::Completed
            };
            info!(
                "Job {} ({}) dispatched {} command(s); now {}",
                job.id,
                job.name,
                enqueued,
                status.as_str()
            );
            outcomes.push(SweepOutcome {
                job_id: job.id,
                job_name: job.name,
                status,
                commands_enqueued: enqueued,
                next_run_at,
            });
        }

        Ok(outcomes)
    }

    /// One periodic maintenance pass: sweep due jobs, expire overdue
    /// commands, and hand the message-retention purge to the pool so the
    /// tick itself stays short.
    pub async fn run_tick(&self, pool: &TaskPool, ctx: TaskContext) {
        let now = now_ts();

        match self.sweep(&now).await {
            Ok(outcomes) if !outcomes.is_empty() => {
                info!("Sweep processed {} job(s)", outcomes.len());
            }
            Ok(_) => {}
            Err(e) => warn!("Sweep failed: {}", e),
        }

        let ttl_minutes = ctx.config.command_ttl_minutes;
        match self.store.expire_commands(&now, ttl_minutes).await {
            Ok(0) => {}
            Ok(n) => info!("Expired {} overdue command(s)", n),
            Err(e) => warn!("Command expiry failed: {}", e),
        }

        let store = self.store.clone();
        pool.submit("message retention purge", ctx, move |ctx| async move {
            let purged = store
                .purge_messages_before(ctx.config.retention_days)
                .await?;
            if purged > 0 {
                info!("Purged {} message(s) past retention", purged);
            }
            Ok(())
        })
        .await;
    }
}
