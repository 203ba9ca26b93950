//! Native realm users and roles survive the restart, and the security store
//! is upgraded when its format is behind.

use rand::distributions::Alphanumeric;
use rand::Rng;
use rollcheck_harness::{
    json, HarnessError, HarnessResult, ResourceRef, Scenario, ScenarioContext, ServiceRequest,
};
use serde_json::{json, Value};

use crate::checks::call_json;

pub const SECURITY_INDEX: &str = ".security";
/// Store format written by the current version.
pub const CURRENT_FORMAT: u64 = 6;
pub const NOT_UPGRADED_ERROR: &str = "Security index is not on the current version. \
Security features relying on the index will not be available until the upgrade API is run on the security index";

const PRE_USER: &str = "preupgrade_user";
const PRE_ROLE: &str = "preupgrade_role";
const POST_USER: &str = "postupgrade_user";
const POST_ROLE: &str = "postupgrade_role";

/// Whether the store needs upgrading, and the concrete index behind it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFormat {
    pub concrete_index: String,
    pub needs_upgrade: bool,
}

impl StoreFormat {
    /// Interpret `GET /.security/_settings/index.format`. An empty body means
    /// the store predates the format setting.
    pub fn from_settings(body: &Value) -> HarnessResult<StoreFormat> {
        let map = body
            .as_object()
            .ok_or_else(|| HarnessError::fatal(format!("settings response is not an object: {}", body)))?;
        let Some((concrete_index, index_settings)) = map.iter().next() else {
            return Ok(StoreFormat {
                concrete_index: SECURITY_INDEX.to_string(),
                needs_upgrade: true,
            });
        };

        let format = json::lookup(index_settings, "settings.index.format").map(|f| match f {
            Value::String(s) => s.parse::<u64>().ok(),
            other => other.as_u64(),
        });
        let needs_upgrade = match format {
            None => true,
            Some(Some(format)) => format != CURRENT_FORMAT,
            Some(None) => {
                return Err(HarnessError::fatal(format!(
                    "index.format of {} is not a number: {}",
                    concrete_index, index_settings
                )))
            }
        };
        Ok(StoreFormat {
            concrete_index: concrete_index.clone(),
            needs_upgrade,
        })
    }
}

fn user_body(id: &str) -> Value {
    let full_name: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(5)
        .map(char::from)
        .collect();
    json!({
        "password": "j@rV1s",
        "roles": ["admin", "other_role1"],
        "full_name": full_name,
        "email": format!("{}@example.com", id),
        "enabled": true,
    })
}

fn role_body() -> Value {
    json!({
        "run_as": ["abc"],
        "cluster": ["monitor"],
        "indices": [{
            "names": ["events-*"],
            "privileges": ["read"],
            "field_security": {"grant": ["category", "@timestamp", "message"]},
            "query": "{\"match\": {\"category\": \"click\"}}"
        }]
    })
}

fn user_request(id: &str) -> ServiceRequest {
    ServiceRequest::put(format!("/_xpack/security/user/{}", id)).json(&user_body(id))
}

fn create_user(ctx: &ScenarioContext<'_>, id: &str) -> HarnessResult<()> {
    ctx.call(&user_request(id))?.ensure_success("create user")
}

fn create_role(ctx: &ScenarioContext<'_>, id: &str) -> HarnessResult<()> {
    ctx.call(&ServiceRequest::put(format!("/_xpack/security/role/{}", id)).json(&role_body()))?
        .ensure_success("create role")
}

fn assert_user(ctx: &ScenarioContext<'_>, id: &str) -> HarnessResult<()> {
    let body = call_json(
        ctx,
        &ServiceRequest::get(format!("/_xpack/security/user/{}", id)),
        "get user",
    )?;
    let user = json::require(&body, id)?;
    let email = json::require_str(user, "email")?;
    if email != format!("{}@example.com", id) {
        return Err(HarnessError::fatal(format!("user {} has email {}", id, email)));
    }
    json::require(user, "full_name")?;
    json::require(user, "roles")?;
    Ok(())
}

fn assert_role(ctx: &ScenarioContext<'_>, id: &str) -> HarnessResult<()> {
    let body = call_json(
        ctx,
        &ServiceRequest::get(format!("/_xpack/security/role/{}", id)),
        "get role",
    )?;
    let role = json::require(&body, id)?;
    for field in ["run_as", "cluster", "indices"] {
        json::require(role, field)?;
    }
    Ok(())
}

pub struct SecurityStoreScenario;

impl SecurityStoreScenario {
    fn upgrade_store(&self, ctx: &ScenarioContext<'_>, store: &StoreFormat) -> HarnessResult<()> {
        tracing::info!(index = %store.concrete_index, "security store is behind, upgrading");

        // Writes must be refused until the store is upgraded.
        let refused = ctx.call(&user_request(POST_USER))?;
        if refused.is_success() {
            return Err(HarnessError::fatal(
                "created a user before the security store was upgraded",
            ));
        }
        if !refused.body.contains(NOT_UPGRADED_ERROR) {
            return Err(HarnessError::fatal(format!(
                "user creation on an old security store failed with an unexpected error ({}): {}",
                refused.status, refused.body
            )));
        }

        let outcome = ctx
            .trigger()
            .migrate(&ResourceRef::index(store.concrete_index.clone()))?;
        tracing::info!(index = %store.concrete_index, ?outcome, "security store upgraded");
        Ok(())
    }
}

impl Scenario for SecurityStoreScenario {
    fn name(&self) -> &str {
        "security_store"
    }

    fn description(&self) -> &str {
        "native users and roles survive and the security store is upgraded"
    }

    fn pre_upgrade(&self, ctx: &ScenarioContext<'_>) -> HarnessResult<()> {
        create_user(ctx, PRE_USER)?;
        create_role(ctx, PRE_ROLE)?;
        assert_user(ctx, PRE_USER)?;
        assert_role(ctx, PRE_ROLE)
    }

    fn post_upgrade(&self, ctx: &ScenarioContext<'_>) -> HarnessResult<()> {
        ctx.wait_for_health(Some(SECURITY_INDEX))?;

        let settings = call_json(
            ctx,
            &ServiceRequest::get(format!("/{}/_settings/index.format", SECURITY_INDEX)),
            "security store settings",
        )?;
        let store = StoreFormat::from_settings(&settings)?;
        tracing::debug!(?store, "security store format");
        if store.needs_upgrade {
            self.upgrade_store(ctx, &store)?;
        }

        create_user(ctx, POST_USER)?;
        create_role(ctx, POST_ROLE)?;

        assert_user(ctx, PRE_USER)?;
        assert_role(ctx, PRE_ROLE)?;
        assert_user(ctx, POST_USER)?;
        assert_role(ctx, POST_ROLE)
    }
}
