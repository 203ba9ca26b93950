//! An index with two mapping types, legal on old versions, must be rejected
//! by SQL after the upgrade with a specific error.

use rollcheck_harness::{
    Capability, HarnessError, HarnessResult, Scenario, ScenarioContext, ServiceRequest,
};
use serde_json::json;

pub const INDEX: &str = "testsqlfailsonindexwithtwotypes";
pub const TYPES: [&str; 2] = ["type1", "type2"];
pub const SQL_PATH: &str = "/_xpack/sql";

pub fn expected_error() -> String {
    format!(
        "[{}] contains more than one type [{}] so it is incompatible with sql",
        INDEX,
        TYPES.join(", ")
    )
}

pub struct IncompatibleIndexScenario;

impl Scenario for IncompatibleIndexScenario {
    fn name(&self) -> &str {
        "incompatible_index"
    }

    fn description(&self) -> &str {
        "SQL rejects a multi-type index created before 6.0"
    }

    fn applies_to(&self, ctx: &ScenarioContext<'_>) -> HarnessResult<bool> {
        ctx.capabilities()
            .is_supported(Capability::MultiTypeIndices, ctx.origin_version())
    }

    fn pre_upgrade(&self, ctx: &ScenarioContext<'_>) -> HarnessResult<()> {
        for ty in TYPES {
            ctx.call(&ServiceRequest::post(format!("/{}/{}", INDEX, ty)).json(&json!({})))?
                .ensure_success("index typed document")?;
        }
        Ok(())
    }

    fn post_upgrade(&self, ctx: &ScenarioContext<'_>) -> HarnessResult<()> {
        let query = json!({"query": format!("SELECT * FROM {}", INDEX)});
        let response = ctx.call(&ServiceRequest::post(SQL_PATH).json(&query))?;
        if response.status != 400 {
            return Err(HarnessError::fatal(format!(
                "expected SQL on {} to fail with 400, got {}: {}",
                INDEX, response.status, response.body
            )));
        }
        if !response.body.contains(&expected_error()) {
            return Err(HarnessError::fatal(format!(
                "SQL rejected {} with an unexpected error: {}",
                INDEX, response.body
            )));
        }
        Ok(())
    }
}
