//! Blocking cluster health waits.

use crate::client::{ServiceClient, ServiceRequest};
use crate::error::{HarnessError, HarnessResult};
use crate::json;

/// Server-side wait applied to every health query.
pub const HEALTH_WAIT: &str = "30s";

/// Ask the service to block until `target` (or the whole cluster) satisfies
/// the wait parameters, and fail if the server-side wait timed out.
///
/// `wait_params` come from the resolver, since older versions do not
/// understand every wait flag.
pub fn wait_for_health<C: ServiceClient + ?Sized>(
    client: &C,
    target: Option<&str>,
    wait_params: &[(String, String)],
) -> HarnessResult<()> {
    let path = match target {
        Some(target) => format!("/_cluster/health/{}", target),
        None => "/_cluster/health".to_string(),
    };
    let request = wait_params
        .iter()
        .fold(ServiceRequest::get(path), |req, (k, v)| req.param(k, v))
        .param("timeout", HEALTH_WAIT);

    let response = client.call(&request)?;
    // A wait that does not complete comes back as 408 with a normal body.
    if !response.is_success() && response.status != 408 {
        response.ensure_success("cluster health")?;
    }
    let body = response.json()?;
    if json::require_bool(&body, "timed_out")? {
        return Err(HarnessError::fatal(format!(
            "cluster health for {} did not settle within {} (status {}): {}",
            target.unwrap_or("cluster"),
            HEALTH_WAIT,
            json::lookup(&body, "status")
                .and_then(|s| s.as_str())
                .unwrap_or("unknown"),
            body
        )));
    }
    tracing::debug!(target = target.unwrap_or("cluster"), "cluster health settled");
    Ok(())
}
