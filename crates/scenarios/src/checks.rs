use rollcheck_harness::{json, HarnessError, HarnessResult, Poll, ScenarioContext, ServiceRequest};
use serde_json::Value;

/// Send `request` and parse the 2xx JSON body.
pub(crate) fn call_json(
    ctx: &ScenarioContext<'_>,
    request: &ServiceRequest,
    context: &str,
) -> HarnessResult<Value> {
    ctx.call(request)?.success_json(context)
}

/// Fail unless the boolean at `path` is `true`.
pub(crate) fn expect_flag(body: &Value, path: &str, context: &str) -> HarnessResult<()> {
    if json::require_bool(body, path)? {
        Ok(())
    } else {
        Err(HarnessError::fatal(format!(
            "{}: expected {} to be true: {}",
            context, path, body
        )))
    }
}

/// One poll step: hit count of `index`, converged once it reaches `expected`.
/// Unassigned shards (503) count as not yet converged.
pub(crate) fn hits_at_least(
    ctx: &ScenarioContext<'_>,
    index: &str,
    expected: u64,
) -> HarnessResult<Poll<u64>> {
    let response = ctx.call(&ServiceRequest::get(format!("/{}/_search", index)).param("size", "0"))?;
    if response.is_unavailable() {
        return Ok(Poll::pending(format!("{}: shards are not yet active", index)));
    }
    let body = response.success_json("search")?;
    let total = json::require_u64(&body, "hits.total")?;
    Ok(if total >= expected {
        Poll::Converged(total)
    } else {
        Poll::pending(format!("{} has {} of {} hits", index, total, expected))
    })
}
