//! The retry controller: resume a failed job from its earliest failed
//! step.
//!
//! Completed upstream steps keep their outputs and remain the source
//! bindings for the reset downstream steps, so a late failure retries
//! cheaply and an early failure retries expensively.

use crate::error::EngineError;
use crate::orchestrator::{Orchestrator, RetryReceipt};
use crate::template;
use mixdown_core::job::{InputSource, Job, JobStatus, StepStatus};
use std::collections::BTreeSet;
use tracing::info;

/// The earliest failed step plus everything that transitively depends on
/// it, through transitions or template references.
pub fn reset_set(job: &Job) -> Option<(usize, BTreeSet<String>)> {
    let resume_index = job
        .steps
        .iter()
        .position(|s| s.effective_status() == StepStatus::Failed)?;

    let mut set = BTreeSet::new();
    set.insert(job.steps[resume_index].name.clone());
    loop {
        let mut grew = false;
        for step in &job.steps {
            if set.contains(&step.name) {
                continue;
            }
            let depends = job
                .transitions_into(&step.name)
                .any(|t| set.contains(&t.from))
                || step.inputs.values().any(|source| match source {
                    InputSource::Template(text) => template::referenced_steps(text)
                        .iter()
                        .any(|r| set.contains(r)),
                    _ => false,
                });
            if depends {
                set.insert(step.name.clone());
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }
    Some((resume_index, set))
}

/// Reset the closure in place: statuses back to pending, bindings and
/// errors cleared, retry generation bumped.
pub fn apply_reset(job: &mut Job, resume_index: usize, set: &BTreeSet<String>) {
    for step in &mut job.steps {
        if !set.contains(&step.name) {
            continue;
        }
        step.status = StepStatus::Pending;
        step.cache_key = None;
        step.error = None;
        step.resolved_inputs.clear();
        step.produced_outputs.clear();
        step.output_checksums.clear();
        step.instances.clear();
        step.dispatched_at = None;
        step.finished_at = None;
    }
    job.resume_index = Some(resume_index);
    job.retry_generation += 1;
    job.status = JobStatus::Retrying;
}

impl Orchestrator {
    /// Begin a retry of a failed job: reset the resume closure, then
    /// re-drive the planner from the preserved upstream state.
    pub async fn retry(&self, job_id: &str) -> Result<RetryReceipt, EngineError> {
        let (resume_step, reset_steps) = loop {
            let stored = self
                .store
                .get(job_id)
                .await?
                .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
            let mut job = stored.job;
            if job.status != JobStatus::Failed {
                return Err(EngineError::NotRetryable {
                    job: job_id.to_string(),
                    status: job.status.to_string(),
                });
            }
            let Some((resume_index, set)) = reset_set(&job) else {
                return Err(EngineError::NotRetryable {
                    job: job_id.to_string(),
                    status: job.status.to_string(),
                });
            };
            let resume_step = job.steps[resume_index].name.clone();
            apply_reset(&mut job, resume_index, &set);
            job.touch();
            if self.store.compare_and_swap(stored.version, &job).await? {
                break (resume_step, set);
            }
        };

        // Stale join counters from the failed generation must not leak
        // into the new one.
        for name in &reset_steps {
            self.bus
                .clear_counter(&format!("job:{}:join:{}", job_id, name))
                .await?;
        }

        info!(%job_id, resume_step = %resume_step, reset = reset_steps.len(), "retrying job");
        self.advance(job_id).await?;
        Ok(RetryReceipt {
            status: JobStatus::Retrying,
            resume_step,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use mixdown_core::job::{CommandSpec, Step, Transition};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn step(name: &str, status: StepStatus) -> Step {
        Step {
            name: name.to_string(),
            service: "svc".to_string(),
            command: CommandSpec {
                program: "prog".to_string(),
                flags: BTreeMap::new(),
            },
            storage_policy: None,
            inputs: BTreeMap::new(),
            outputs: BTreeMap::new(),
            status,
            cache_key: None,
            error: None,
            resolved_inputs: BTreeMap::new(),
            produced_outputs: BTreeMap::new(),
            output_checksums: BTreeMap::new(),
            instances: Vec::new(),
            dispatched_at: None,
            finished_at: None,
        }
    }

    fn transition(from: &str, to: &str) -> Transition {
        Transition {
            from: from.to_string(),
            to: to.to_string(),
            mapping: BTreeMap::from([("out".to_string(), "in".to_string())]),
        }
    }

    fn job(steps: Vec<Step>, transitions: Vec<Transition>) -> Job {
        Job {
            job_id: "job-retry001".to_string(),
            user_id: "user-1".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            status: JobStatus::Failed,
            steps,
            transitions,
            resume_index: None,
            retry_generation: 0,
            error: None,
        }
    }

    #[test]
    fn closure_covers_transitive_dependents() {
        // a -> b -> c, plus d independent; b failed.
        let j = job(
            vec![
                step("a", StepStatus::Complete),
                step("b", StepStatus::Failed),
                step("c", StepStatus::Pending),
                step("d", StepStatus::Complete),
            ],
            vec![transition("a", "b"), transition("b", "c")],
        );

        let (resume_index, set) = reset_set(&j).unwrap();
        assert_eq!(resume_index, 1);
        assert_eq!(
            set,
            BTreeSet::from(["b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn closure_follows_template_references() {
        let mut c = step("c", StepStatus::Pending);
        c.inputs.insert(
            "path".to_string(),
            InputSource::Template("{{steps.b.outputs.out}}".to_string()),
        );
        let j = job(
            vec![
                step("a", StepStatus::Complete),
                step("b", StepStatus::Failed),
                c,
            ],
            vec![transition("a", "b")],
        );

        let (_, set) = reset_set(&j).unwrap();
        assert!(set.contains("c"));
        assert!(!set.contains("a"));
    }

    #[test]
    fn earliest_failed_step_wins() {
        let j = job(
            vec![
                step("a", StepStatus::Failed),
                step("b", StepStatus::Failed),
            ],
            vec![transition("a", "b")],
        );
        let (resume_index, _) = reset_set(&j).unwrap();
        assert_eq!(resume_index, 0);
    }

    #[test]
    fn reset_clears_state_and_bumps_generation() {
        let mut b = step("b", StepStatus::Failed);
        b.resolved_inputs.insert("in".to_string(), json!("x"));
        b.produced_outputs.insert("out".to_string(), json!("y"));
        b.error = Some(mixdown_core::error::ErrorObject::application(
            "tool_exit",
            "exit 1",
        ));
        b.cache_key = Some("k".to_string());
        let mut j = job(
            vec![step("a", StepStatus::Complete), b],
            vec![transition("a", "b")],
        );

        let (resume_index, set) = reset_set(&j).unwrap();
        apply_reset(&mut j, resume_index, &set);

        assert_eq!(j.status, JobStatus::Retrying);
        assert_eq!(j.retry_generation, 1);
        assert_eq!(j.resume_index, Some(1));

        let b = j.step("b").unwrap();
        assert_eq!(b.status, StepStatus::Pending);
        assert!(b.resolved_inputs.is_empty());
        assert!(b.produced_outputs.is_empty());
        assert!(b.error.is_none());
        assert!(b.cache_key.is_none());

        // Completed upstream steps are preserved.
        assert_eq!(j.step("a").unwrap().status, StepStatus::Complete);
    }

    #[test]
    fn no_failed_step_means_no_reset() {
        let j = job(vec![step("a", StepStatus::Complete)], vec![]);
        assert!(reset_set(&j).is_none());
    }
}
