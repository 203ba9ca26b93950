//! Watches stored before the restart survive it; the watcher stores are
//! migrated when the new version asks for it and the watcher can be started
//! and stopped afterwards.
//!
//! Three watches are stored on the old cluster: a plain one, one with long
//! throttle periods and one whose email attachment carries a fractional read
//! timeout and basic auth credentials. After the upgrade their time values
//! must read back as the same number of milliseconds.

use std::time::Duration;

use rollcheck_harness::{
    json, HarnessError, HarnessResult, MigrationLedger, MigrationOutcome, Poll, ResourceRef,
    Scenario, ScenarioContext, ServiceRequest,
};
use serde_json::{json, Value};

use crate::checks::{call_json, expect_flag, hits_at_least};

pub const WATCH_ID: &str = "bwc_watch";
pub const THROTTLE_WATCH_ID: &str = "bwc_throttle_period";
pub const FUNNY_TIMEOUT_WATCH_ID: &str = "bwc_funny_timeout";
pub const NEW_WATCH_ID: &str = "new_watch";
pub const WATCH_INDEX: &str = "bwc_watch_index";
pub const HISTORY_INDEX: &str = ".watcher-history*";
pub const WATCHES_INDEX: &str = ".watches";
pub const TRIGGERED_WATCHES_INDEX: &str = ".triggered_watches";
/// Watches stored before the restart; monitoring may add more.
pub const STORED_WATCHES: u64 = 3;
/// `100s`, the timeout every stored watch uses in one spelling or another.
pub const TIMEOUT_MILLIS: u64 = 100_000;
pub const ATTACHMENT: &str = "test_report.pdf";
const HEALTH_TARGET: &str = ".watches,bwc_watch_index,.watcher-history*";
const MIN_HITS: u64 = 2;

/// Templates the old watcher installed; the upgrade replaces them.
const OLD_TEMPLATES: [&str; 2] = ["watches", "triggered_watches"];
const OLD_HISTORY_TEMPLATE_PREFIX: &str = "watch-history";

pub fn watch_body() -> Value {
    json!({
        "trigger": {"schedule": {"interval": "1s"}},
        "input": {
            "search": {
                "timeout": "100s",
                "request": {
                    "indices": [".watches"],
                    "body": {"query": {"match_all": {}}}
                }
            }
        },
        "condition": {"always": {}},
        "throttle_period": "1s",
        "actions": {
            "index_payload": {
                "transform": {
                    "search": {
                        "request": {"body": {"size": 0, "query": {"match_all": {}}}},
                        "timeout": "100s"
                    }
                },
                "index": {
                    "index": WATCH_INDEX,
                    "doc_type": "bwc_watch_type",
                    "timeout": "100s"
                }
            }
        }
    })
}

pub fn throttle_period_watch_body() -> Value {
    json!({
        "trigger": {"schedule": {"interval": "1s"}},
        "input": {"simple": {}},
        "condition": {"always": {}},
        "throttle_period": "100s",
        "actions": {
            "index_payload": {
                "throttle_period": "100s",
                "index": {"index": "bwc_watch_throttle_index", "doc_type": "bwc_watch_type"}
            }
        }
    })
}

pub fn funny_timeout_watch_body() -> Value {
    json!({
        "trigger": {"schedule": {"interval": "100s"}},
        "input": {"simple": {}},
        "condition": {"never": {}},
        "actions": {
            "work": {
                "email": {
                    "to": "email@domain.com",
                    "subject": "Test Kibana PDF report",
                    "attachments": {
                        ATTACHMENT: {
                            "http": {
                                "content_type": "application/pdf",
                                "request": {
                                    "read_timeout": "1.6666666666666667m",
                                    "scheme": "https",
                                    "host": "example.com",
                                    "path": "{{ctx.metadata.report_url}}",
                                    "port": 8443,
                                    "auth": {"basic": {"username": "Aladdin", "password": "open sesame"}}
                                }
                            }
                        }
                    }
                }
            }
        }
    })
}

pub fn logging_watch_body() -> Value {
    json!({
        "trigger": {"schedule": {"interval": "1s"}},
        "input": {"none": {}},
        "condition": {"always": {}},
        "actions": {"awesome": {"logging": {"text": "test"}}}
    })
}

fn stored_watches() -> [(&'static str, Value); 3] {
    [
        (WATCH_ID, watch_body()),
        (THROTTLE_WATCH_ID, throttle_period_watch_body()),
        (FUNNY_TIMEOUT_WATCH_ID, funny_timeout_watch_body()),
    ]
}

fn watcher_stores() -> [ResourceRef; 2] {
    [
        ResourceRef::index(WATCHES_INDEX),
        ResourceRef::index(TRIGGERED_WATCHES_INDEX),
    ]
}

/// Items an upgrade of `store` must at least convert.
fn minimum_converted(store: &ResourceRef) -> u64 {
    if store.name == WATCHES_INDEX {
        STORED_WATCHES
    } else {
        0
    }
}

fn put_watch(ctx: &ScenarioContext<'_>, id: &str, body: &Value) -> HarnessResult<Value> {
    call_json(
        ctx,
        &ServiceRequest::put(format!("/_xpack/watcher/watch/{}", id)).json(body),
        "put watch",
    )
}

/// The stored source of watch `id`.
fn get_watch(ctx: &ScenarioContext<'_>, id: &str) -> HarnessResult<Value> {
    let body = call_json(
        ctx,
        &ServiceRequest::get(format!("/_xpack/watcher/watch/{}", id)),
        "get watch",
    )?;
    expect_flag(&body, "found", "get watch")?;
    Ok(json::require(&body, "watch")?.clone())
}

fn expect_value(source: &Value, path: &str, expected: Value, watch: &str) -> HarnessResult<()> {
    let actual = json::require(source, path)?;
    if *actual == expected {
        Ok(())
    } else {
        Err(HarnessError::fatal(format!(
            "{}: expected {} to be {}, found {}",
            watch, path, expected, actual
        )))
    }
}

fn assert_old_templates_deleted(ctx: &ScenarioContext<'_>) -> HarnessResult<()> {
    let templates = call_json(ctx, &ServiceRequest::get("/_template"), "templates")?;
    let names = templates
        .as_object()
        .ok_or_else(|| HarnessError::fatal("template listing is not an object"))?;
    let leftover: Vec<&str> = names
        .keys()
        .map(String::as_str)
        .filter(|name| {
            OLD_TEMPLATES.contains(name) || name.starts_with(OLD_HISTORY_TEMPLATE_PREFIX)
        })
        .collect();
    if leftover.is_empty() {
        Ok(())
    } else {
        Err(HarnessError::fatal(format!(
            "old watcher templates still installed: {}",
            leftover.join(", ")
        )))
    }
}

fn assert_watch_contents(ctx: &ScenarioContext<'_>) -> HarnessResult<()> {
    let timeout = json!(TIMEOUT_MILLIS);

    let source = get_watch(ctx, WATCH_ID)?;
    expect_value(&source, "throttle_period_in_millis", json!(1000), WATCH_ID)?;
    expect_value(&source, "input.search.timeout_in_millis", timeout.clone(), WATCH_ID)?;
    expect_value(
        &source,
        "actions.index_payload.transform.search.timeout_in_millis",
        timeout.clone(),
        WATCH_ID,
    )?;
    expect_value(&source, "actions.index_payload.index.index", json!(WATCH_INDEX), WATCH_ID)?;
    expect_value(
        &source,
        "actions.index_payload.index.doc_type",
        json!("bwc_watch_type"),
        WATCH_ID,
    )?;
    expect_value(
        &source,
        "actions.index_payload.index.timeout_in_millis",
        timeout.clone(),
        WATCH_ID,
    )?;

    let source = get_watch(ctx, THROTTLE_WATCH_ID)?;
    expect_value(&source, "throttle_period_in_millis", timeout.clone(), THROTTLE_WATCH_ID)?;
    expect_value(
        &source,
        "actions.index_payload.throttle_period_in_millis",
        timeout.clone(),
        THROTTLE_WATCH_ID,
    )?;

    // The attachment name contains a dot, so it cannot be part of a path.
    let source = get_watch(ctx, FUNNY_TIMEOUT_WATCH_ID)?;
    let attachment = json::require(&source, "actions.work.email.attachments")?
        .get(ATTACHMENT)
        .ok_or_else(|| {
            HarnessError::fatal(format!("{}: attachment {} is missing", FUNNY_TIMEOUT_WATCH_ID, ATTACHMENT))
        })?;
    let request = json::require(attachment, "http.request")?;
    expect_value(request, "read_timeout_millis", timeout, FUNNY_TIMEOUT_WATCH_ID)?;
    expect_value(request, "scheme", json!("https"), FUNNY_TIMEOUT_WATCH_ID)?;
    expect_value(request, "host", json!("example.com"), FUNNY_TIMEOUT_WATCH_ID)?;
    expect_value(request, "path", json!("{{ctx.metadata.report_url}}"), FUNNY_TIMEOUT_WATCH_ID)?;
    expect_value(request, "port", json!(8443), FUNNY_TIMEOUT_WATCH_ID)?;
    expect_value(request, "auth.basic.username", json!("Aladdin"), FUNNY_TIMEOUT_WATCH_ID)?;
    // The password never comes back in clear text.
    let password = json::require_str(request, "auth.basic.password")?;
    if !(password.starts_with("::es_encrypted::") || password == "::es_redacted::") {
        return Err(HarnessError::fatal(format!(
            "{}: basic auth password is exposed as '{}'",
            FUNNY_TIMEOUT_WATCH_ID, password
        )));
    }

    match hits_at_least(ctx, HISTORY_INDEX, MIN_HITS)? {
        Poll::Converged(_) => Ok(()),
        Poll::NotYetConverged(observed) => Err(HarnessError::fatal(format!(
            "watch history lost records: {}",
            observed
        ))),
        Poll::Fatal(e) => Err(e),
    }
}

/// A watch written on the new version is created once, then updated.
fn assert_basic_watch_interactions(ctx: &ScenarioContext<'_>) -> HarnessResult<()> {
    let path = format!("/_xpack/watcher/watch/{}", NEW_WATCH_ID);
    // Leftover from an earlier post-upgrade run.
    let removed = ctx.call(&ServiceRequest::delete(path.as_str()))?;
    if !removed.is_success() && removed.status != 404 {
        removed.ensure_success("delete watch")?;
    }

    let body = logging_watch_body();
    let first = put_watch(ctx, NEW_WATCH_ID, &body)?;
    expect_flag(&first, "created", "create watch")?;
    let version = json::require_u64(&first, "_version")?;

    let second = put_watch(ctx, NEW_WATCH_ID, &body)?;
    if json::require_bool(&second, "created")? {
        return Err(HarnessError::fatal(format!(
            "second put of {} created it again: {}",
            NEW_WATCH_ID, second
        )));
    }
    let updated = json::require_u64(&second, "_version")?;
    if updated != version + 1 {
        return Err(HarnessError::fatal(format!(
            "{} went from version {} to {} on update",
            NEW_WATCH_ID, version, updated
        )));
    }

    let source = get_watch(ctx, NEW_WATCH_ID)?;
    expect_value(&source, "actions.awesome.logging.level", json!("info"), NEW_WATCH_ID)?;
    expect_value(&source, "actions.awesome.logging.text", json!("test"), NEW_WATCH_ID)
}

pub struct WatcherScenario {
    interval: Duration,
    timeout: Duration,
}

impl WatcherScenario {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        WatcherScenario { interval, timeout }
    }

    fn migrate_stores(&self, ctx: &ScenarioContext<'_>) -> HarnessResult<()> {
        let stores = watcher_stores();
        let mut ledger = MigrationLedger::new();
        let before = ctx.detector().detect(&stores)?;
        ledger.record_all(&before)?;

        for store in &stores {
            let status = before[store];
            if !status.needs_migration() {
                tracing::info!(resource = %store, %status, "no migration needed");
                continue;
            }
            let converted = match ctx.trigger().migrate(store)? {
                MigrationOutcome::PerformedWork(total) => {
                    tracing::info!(resource = %store, total, "migrated");
                    total
                }
                MigrationOutcome::NoOpAlreadyCurrent => {
                    tracing::info!(resource = %store, "already current");
                    0
                }
            };
            let expected = minimum_converted(store);
            if converted < expected {
                return Err(HarnessError::MigrationFailed {
                    resource: store.to_string(),
                    message: format!(
                        "converted {} items but {} watches were stored",
                        converted, expected
                    ),
                });
            }
        }

        let after = ctx.detector().detect(&stores)?;
        ledger.record_all(&after)?;
        if let Some((store, status)) = after.iter().find(|(_, s)| !s.is_current()) {
            return Err(HarnessError::MigrationFailed {
                resource: store.to_string(),
                message: format!("still {} after the upgrade command", status),
            });
        }
        Ok(())
    }

    /// Toggle the watcher and wait until every node reports `target`.
    fn switch_watcher(&self, ctx: &ScenarioContext<'_>, command: &str, target: &str) -> HarnessResult<()> {
        let body = call_json(
            ctx,
            &ServiceRequest::post(format!("/_xpack/watcher/{}", command)),
            command,
        )?;
        expect_flag(&body, "acknowledged", command)?;

        ctx.poller(&format!("watcher {}", target), self.interval, self.timeout)
            .await_convergence(|| {
                let response = ctx.call(&ServiceRequest::get("/_xpack/watcher/stats"))?;
                if response.is_unavailable() {
                    return Ok(Poll::pending("watcher stats unavailable"));
                }
                let stats = response.success_json("watcher stats")?;
                let nodes = json::require(&stats, "stats")?
                    .as_array()
                    .ok_or_else(|| HarnessError::fatal("watcher stats is not an array"))?;
                let states = nodes
                    .iter()
                    .map(|n| json::require_str(n, "watcher_state"))
                    .collect::<HarnessResult<Vec<_>>>()?;
                Ok(if !states.is_empty() && states.iter().all(|s| *s == target) {
                    Poll::Converged(())
                } else {
                    Poll::pending(format!("watcher states {:?}", states))
                })
            })
    }

    fn check_started_watcher(&self, ctx: &ScenarioContext<'_>) -> HarnessResult<()> {
        assert_old_templates_deleted(ctx)?;
        assert_watch_contents(ctx)?;
        assert_basic_watch_interactions(ctx)
    }
}

impl Scenario for WatcherScenario {
    fn name(&self) -> &str {
        "watcher"
    }

    fn description(&self) -> &str {
        "watches survive and the watcher stores are migrated"
    }

    fn pre_upgrade(&self, ctx: &ScenarioContext<'_>) -> HarnessResult<()> {
        for (id, body) in stored_watches() {
            tracing::info!(origin = %ctx.origin_version(), watch = id, "adding watch");
            put_watch(ctx, id, &body)?;
        }

        ctx.wait_for_health(Some(HEALTH_TARGET))?;
        for index in [WATCH_INDEX, HISTORY_INDEX] {
            let hits = ctx
                .poller(&format!("{} hits", index), self.interval, self.timeout)
                .await_convergence(|| hits_at_least(ctx, index, MIN_HITS))?;
            tracing::info!(index, hits, "watch results are in");
        }
        Ok(())
    }

    fn post_upgrade(&self, ctx: &ScenarioContext<'_>) -> HarnessResult<()> {
        ctx.wait_for_health(Some(HEALTH_TARGET))?;
        self.migrate_stores(ctx)?;

        self.switch_watcher(ctx, "_start", "started")?;
        let checked = self.check_started_watcher(ctx);
        // Stop even when the checks failed so the next run starts clean.
        let stopped = self.switch_watcher(ctx, "_stop", "stopped");
        checked.and(stopped)
    }
}
