//! A background job created and started before the restart must be running
//! again afterwards, as seen by the job API, the task list and the
//! persistent task metadata.

use rand::Rng;
use rollcheck_harness::{
    json, Capability, HarnessError, HarnessResult, Method, Poll, Scenario, ScenarioContext,
    ServiceRequest,
};
use serde::Serialize;
use serde_json::{json, Value};

use crate::checks::{call_json, expect_flag};
use crate::job_state::{JobState, PersistentTaskRecord};
use crate::ScenarioSettings;

pub const JOB_ID: &str = "rollup-job-test";
pub const SOURCE_INDEX: &str = "rollup-docs";
pub const TASK_TYPE: &str = "xpack/rollup/job";
pub const DOC_COUNT: usize = 59;

/// Bulk body for `count` docs, one per minute of New Year's in `year`.
pub fn bulk_body(year: u32, count: usize) -> String {
    let mut bulk = String::new();
    for i in 0..count {
        bulk.push_str(
            &json!({"index": {"_index": SOURCE_INDEX, "_type": "doc"}}).to_string(),
        );
        bulk.push('\n');
        let doc = json!({
            "timestamp": format!("{:04}-01-01T00:{:02}:00Z", year, i),
            "value": i,
        });
        bulk.push_str(&doc.to_string());
        bulk.push('\n');
    }
    bulk
}

pub fn job_config() -> Value {
    json!({
        "index_pattern": "rollup-*",
        "rollup_index": "results-rollup",
        "cron": "*/30 * * * * ?",
        "page_size": 100,
        "groups": {
            "date_histogram": {"field": "timestamp", "interval": "5m"}
        },
        "metrics": [
            {"field": "value", "metrics": ["min", "max", "sum"]}
        ]
    })
}

/// Job state as seen through each endpoint on the attempt that converged.
#[derive(Debug, Clone, Serialize)]
pub struct JobObservation {
    pub job_status: JobState,
    pub task_list: JobState,
    pub persistent_task: PersistentTaskRecord,
}

enum Seen {
    State(JobState),
    Missing(String),
}

pub struct JobPersistenceScenario {
    settings: ScenarioSettings,
}

impl JobPersistenceScenario {
    pub fn new(settings: ScenarioSettings) -> Self {
        JobPersistenceScenario { settings }
    }

    fn accepted(&self, state: JobState) -> bool {
        self.settings.accepted_job_states.contains(&state)
    }

    fn job_status(&self, ctx: &ScenarioContext<'_>) -> HarnessResult<Seen> {
        let response = ctx.call(&ServiceRequest::get(format!("/_xpack/rollup/job/{}", JOB_ID)))?;
        if response.is_unavailable() {
            return Ok(Seen::Missing("job API unavailable".to_string()));
        }
        if response.status == 404 {
            return Ok(Seen::Missing(format!("{} not found by the job API", JOB_ID)));
        }
        let body = response.success_json("rollup job")?;
        let jobs = json::require(&body, "jobs")?
            .as_array()
            .ok_or_else(|| HarnessError::fatal("jobs is not an array"))?;
        for job in jobs {
            if json::require_str(job, "config.id")? == JOB_ID {
                return JobState::at(job, "status.job_state").map(Seen::State);
            }
        }
        Ok(Seen::Missing(format!("{} not listed by the job API", JOB_ID)))
    }

    fn task_list(&self, ctx: &ScenarioContext<'_>) -> HarnessResult<Seen> {
        let body = call_json(
            ctx,
            &ServiceRequest::get("/_tasks")
                .param("detailed", "true")
                .param("actions", "xpack/rollup/*"),
            "task list",
        )?;
        let nodes = json::require(&body, "nodes")?
            .as_object()
            .ok_or_else(|| HarnessError::fatal("task list nodes is not an object"))?;
        let task = nodes
            .values()
            .filter_map(|node| node.get("tasks").and_then(Value::as_object))
            .flat_map(|tasks| tasks.values())
            .next();
        match task {
            Some(task) => JobState::at(task, "status.job_state").map(Seen::State),
            None => Ok(Seen::Missing("no rollup task running".to_string())),
        }
    }

    fn persistent_task(
        &self,
        ctx: &ScenarioContext<'_>,
        state_field: &str,
    ) -> HarnessResult<Option<PersistentTaskRecord>> {
        let body = call_json(
            ctx,
            &ServiceRequest::get("/_cluster/state/metadata"),
            "cluster state",
        )?;
        PersistentTaskRecord::find(&body, TASK_TYPE, JOB_ID, state_field)
    }

    fn observe(&self, ctx: &ScenarioContext<'_>, state_field: &str) -> HarnessResult<Poll<JobObservation>> {
        let job_status = match self.job_status(ctx)? {
            Seen::State(state) if self.accepted(state) => state,
            Seen::State(state) => return Ok(Poll::pending(format!("job API reports {}", state))),
            Seen::Missing(why) => return Ok(Poll::pending(why)),
        };
        let task_list = match self.task_list(ctx)? {
            Seen::State(state) if self.accepted(state) => state,
            Seen::State(state) => return Ok(Poll::pending(format!("task list reports {}", state))),
            Seen::Missing(why) => return Ok(Poll::pending(why)),
        };
        let persistent_task = match self.persistent_task(ctx, state_field)? {
            Some(record) if self.accepted(record.state_value) => record,
            Some(record) => {
                return Ok(Poll::pending(format!(
                    "persistent task {} reports {}",
                    record.state_field_name, record.state_value
                )))
            }
            None => {
                return Ok(Poll::pending(format!(
                    "no persistent task for [{}]",
                    JOB_ID
                )))
            }
        };
        Ok(Poll::Converged(JobObservation {
            job_status,
            task_list,
            persistent_task,
        }))
    }

    fn assert_job_running(&self, ctx: &ScenarioContext<'_>) -> HarnessResult<()> {
        let state_field = ctx
            .resolve_running(Capability::PersistentTaskStateField)?
            .field_name()?
            .to_string();
        let observed = ctx
            .poller("rollup job", self.settings.poll_interval, self.settings.poll_timeout)
            .await_convergence(|| self.observe(ctx, &state_field))?;
        tracing::info!(
            job = JOB_ID,
            job_status = %observed.job_status,
            task_list = %observed.task_list,
            persistent_task = %observed.persistent_task.state_value,
            "job is running"
        );
        Ok(())
    }
}

impl Scenario for JobPersistenceScenario {
    fn name(&self) -> &str {
        "job_persistence"
    }

    fn description(&self) -> &str {
        "a rollup job started before the restart is running after it"
    }

    fn applies_to(&self, ctx: &ScenarioContext<'_>) -> HarnessResult<bool> {
        Ok(ctx.resolve(Capability::BackgroundJobs)?.is_supported())
    }

    fn pre_upgrade(&self, ctx: &ScenarioContext<'_>) -> HarnessResult<()> {
        let year = rand::thread_rng().gen_range(1970..=2018);
        let bulk = ServiceRequest::new(Method::Post, "/_bulk")
            .raw_body(bulk_body(year, DOC_COUNT), "application/x-ndjson");
        let indexed = call_json(ctx, &bulk, "bulk index")?;
        if json::lookup(&indexed, "errors").and_then(Value::as_bool) == Some(true) {
            return Err(HarnessError::fatal(format!("bulk index reported errors: {}", indexed)));
        }

        let created = call_json(
            ctx,
            &ServiceRequest::put(format!("/_xpack/rollup/job/{}", JOB_ID)).json(&job_config()),
            "create rollup job",
        )?;
        expect_flag(&created, "acknowledged", "create rollup job")?;

        let started = call_json(
            ctx,
            &ServiceRequest::post(format!("/_xpack/rollup/job/{}/_start", JOB_ID)),
            "start rollup job",
        )?;
        expect_flag(&started, "started", "start rollup job")?;

        self.assert_job_running(ctx)
    }

    fn post_upgrade(&self, ctx: &ScenarioContext<'_>) -> HarnessResult<()> {
        ctx.wait_for_health(None)?;
        self.assert_job_running(ctx)
    }
}
