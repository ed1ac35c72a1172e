//! The timeout sweeper: reaps steps that have been in flight longer than
//! their operation allows.
//!
//! A reaped step is marked failed with an infrastructure error; its state
//! machine then refuses any late worker result, so a slow worker cannot
//! resurrect it.

use crate::error::EngineError;
use crate::orchestrator::Orchestrator;
use chrono::{DateTime, Utc};
use mixdown_core::error::{ErrorObject, STEP_TIMEOUT_CODE};
use mixdown_core::job::StepStatus;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

impl Orchestrator {
    pub(crate) async fn run_sweeper(&self, shutdown: watch::Receiver<bool>) {
        debug!("timeout sweeper started");
        let mut ticker = tokio::time::interval(self.config.sweep_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            if *shutdown.borrow() {
                debug!("timeout sweeper stopping");
                return;
            }
            if let Err(e) = self.sweep_once().await {
                warn!(error = %e, "sweep pass failed");
            }
        }
    }

    /// One pass over every active job. Public so embedded setups and
    /// tests can drive the clock themselves.
    pub async fn sweep_once(&self) -> Result<(), EngineError> {
        let now = Utc::now();
        for job_id in self.store.active_job_ids().await? {
            let reaped = self.reap_overdue_steps(&job_id, now).await?;
            if reaped {
                self.advance(&job_id).await?;
            }
        }
        Ok(())
    }

    async fn reap_overdue_steps(
        &self,
        job_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        loop {
            let Some(stored) = self.store.get(job_id).await? else {
                return Ok(false);
            };
            let mut job = stored.job;
            let mut reaped = 0usize;

            for step in &mut job.steps {
                let timeout = self.config.step_timeout(
                    self.manifests
                        .operation(&step.service, &step.command.program)
                        .and_then(|op| op.timeout_secs),
                );
                if step.is_fanned_out() {
                    for instance in &mut step.instances {
                        if instance.status.is_in_flight()
                            && overdue(instance.dispatched_at, now, timeout)
                        {
                            instance.status = StepStatus::Failed;
                            instance.error = Some(timeout_error(timeout));
                            reaped += 1;
                        }
                    }
                    if step.effective_status() == StepStatus::Failed && step.finished_at.is_none() {
                        step.finished_at = Some(now);
                    }
                } else if step.status.is_in_flight() && overdue(step.dispatched_at, now, timeout) {
                    step.status = StepStatus::Failed;
                    step.error = Some(timeout_error(timeout));
                    step.finished_at = Some(now);
                    reaped += 1;
                }
            }

            if reaped == 0 {
                return Ok(false);
            }
            warn!(%job_id, reaped, "reaped timed-out steps");
            job.touch();
            if self.store.compare_and_swap(stored.version, &job).await? {
                return Ok(true);
            }
        }
    }
}

fn overdue(dispatched_at: Option<DateTime<Utc>>, now: DateTime<Utc>, timeout: Duration) -> bool {
    match dispatched_at {
        // In flight without a dispatch timestamp is a corrupt-ish state;
        // reap it rather than let it hang forever.
        None => true,
        Some(at) => match now.signed_duration_since(at).to_std() {
            Ok(age) => age > timeout,
            Err(_) => false,
        },
    }
}

fn timeout_error(timeout: Duration) -> ErrorObject {
    ErrorObject::infrastructure(
        STEP_TIMEOUT_CODE,
        format!("no result within {}s", timeout.as_secs()),
    )
}
