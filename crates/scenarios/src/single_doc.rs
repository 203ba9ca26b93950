//! A single document written before the restart must still be readable
//! after it.

use rollcheck_harness::{json, HarnessError, HarnessResult, Scenario, ScenarioContext, ServiceRequest};
use serde_json::{json, Value};

use crate::checks::call_json;

pub const DOC_PATH: &str = "/testsingledoc/doc/1";

pub fn document() -> Value {
    json!({"test": "test"})
}

pub struct SingleDocScenario;

impl SingleDocScenario {
    fn assert_readable(&self, ctx: &ScenarioContext<'_>) -> HarnessResult<()> {
        let body = call_json(ctx, &ServiceRequest::get(DOC_PATH), "get document")?;
        let source = json::require(&body, "_source")?;
        if *source != document() {
            return Err(HarnessError::fatal(format!(
                "{} holds {} instead of {}",
                DOC_PATH,
                source,
                document()
            )));
        }
        Ok(())
    }
}

impl Scenario for SingleDocScenario {
    fn name(&self) -> &str {
        "single_doc"
    }

    fn description(&self) -> &str {
        "a document indexed before the restart is still readable"
    }

    fn pre_upgrade(&self, ctx: &ScenarioContext<'_>) -> HarnessResult<()> {
        ctx.call(
            &ServiceRequest::put(DOC_PATH)
                .param("refresh", "true")
                .json(&document()),
        )?
        .ensure_success("index document")?;
        self.assert_readable(ctx)
    }

    fn post_upgrade(&self, ctx: &ScenarioContext<'_>) -> HarnessResult<()> {
        self.assert_readable(ctx)
    }
}
