//! An in-memory stand-in for the cluster under test.
//!
//! It answers the endpoints the standard scenarios use, remembers what was
//! written, and can be "restarted" onto a newer version. Stores written by a
//! pre-6.0 cluster come back needing an upgrade, and the rollup job takes a
//! few polls to report itself running again after a restart. Watches are
//! stored the way the service reports them: time values in milliseconds,
//! passwords redacted.
//!
//! `respond_with` replaces the answer to one endpoint, for failure cases.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use rollcheck_harness::{
    HarnessConfig, HarnessError, HarnessResult, Method, Phase, RunReport, ServiceClient,
    ServiceRequest, ServiceResponse, ServiceVersion,
};
use rollcheck_scenarios::ScenarioSettings;
use serde_json::{json, Value};

/// Version the simulated cluster is restarted onto.
pub const UPGRADED_VERSION: &str = "6.4.0";

const SECURITY: &str = ".security";
const WATCHES: &str = ".watches";
const TRIGGERED_WATCHES: &str = ".triggered_watches";
const REDACTED: &str = "::es_redacted::";
const OLD_WATCHER_TEMPLATES: [&str; 3] = ["watches", "triggered_watches", "watch-history-6"];
const NEW_WATCHER_TEMPLATES: [&str; 3] = [".watches", ".triggered_watches", ".watch-history-7"];
const NOT_UPGRADED: &str = "Security index is not on the current version. Security features relying \
on the index will not be available until the upgrade API is run on the security index";

pub fn v(s: &str) -> ServiceVersion {
    s.parse().unwrap()
}

/// Short polls so end-to-end runs stay fast.
pub fn fast_settings() -> ScenarioSettings {
    ScenarioSettings {
        poll_interval: Duration::from_millis(10),
        poll_timeout: Duration::from_secs(2),
        ..ScenarioSettings::default()
    }
}

pub fn config(phase: Phase, origin: &str) -> HarnessConfig {
    HarnessConfig::new(phase, v(origin))
}

pub fn assert_all_passed(report: &RunReport) {
    assert!(report.is_success(), "run failed:\n{}", report);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Watcher {
    Starting(u32),
    Started,
    Stopping(u32),
    Stopped,
}

impl Watcher {
    fn observe(&mut self) -> &'static str {
        match self {
            Watcher::Starting(0) => *self = Watcher::Started,
            Watcher::Stopping(0) => *self = Watcher::Stopped,
            Watcher::Starting(n) | Watcher::Stopping(n) => *n -= 1,
            _ => {}
        }
        match self {
            Watcher::Starting(_) => "starting",
            Watcher::Started => "started",
            Watcher::Stopping(_) => "stopping",
            Watcher::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone)]
struct RollupJob {
    config: Value,
    running: bool,
    /// Polls left before a restarted job reports itself running again.
    recovering: u32,
    indexed_once: bool,
}

impl RollupJob {
    fn state(&self) -> &'static str {
        if !self.running || self.recovering > 0 {
            "stopped"
        } else if self.indexed_once {
            "started"
        } else {
            "indexing"
        }
    }
}

struct Cluster {
    version: ServiceVersion,
    reachable: bool,
    docs: BTreeMap<String, Value>,
    types: BTreeMap<String, BTreeSet<String>>,
    next_id: u64,
    users: BTreeMap<String, Value>,
    roles: BTreeMap<String, Value>,
    security_format: Option<u64>,
    outdated: BTreeSet<String>,
    watches: BTreeMap<String, (Value, u64)>,
    watch_hits: u64,
    history_hits: u64,
    watcher: Watcher,
    templates: BTreeSet<String>,
    keep_old_templates: bool,
    injected: Vec<(Method, String, u16, Value)>,
    rollup_docs: usize,
    job: Option<RollupJob>,
    recovery_polls: u32,
    lost_on_restart: Vec<String>,
    requests: Vec<ServiceRequest>,
}

pub struct SimulatedCluster {
    state: RefCell<Cluster>,
}

impl SimulatedCluster {
    pub fn new(version: &str) -> Self {
        let templates = if v(version).major < 6 {
            OLD_WATCHER_TEMPLATES
        } else {
            NEW_WATCHER_TEMPLATES
        };
        SimulatedCluster {
            state: RefCell::new(Cluster {
                version: v(version),
                reachable: true,
                docs: BTreeMap::new(),
                types: BTreeMap::new(),
                next_id: 0,
                users: BTreeMap::new(),
                roles: BTreeMap::new(),
                security_format: None,
                outdated: BTreeSet::new(),
                watches: BTreeMap::new(),
                watch_hits: 0,
                history_hits: 0,
                watcher: Watcher::Started,
                templates: templates.iter().map(|t| t.to_string()).collect(),
                keep_old_templates: false,
                injected: Vec::new(),
                rollup_docs: 0,
                job: None,
                recovery_polls: 2,
                lost_on_restart: Vec::new(),
                requests: Vec::new(),
            }),
        }
    }

    /// Stop the cluster and bring it back on `version`.
    pub fn restart_on(&self, version: &str) {
        let mut c = self.state.borrow_mut();
        let from = c.version.clone();
        let to = v(version);
        let crosses_six = from.major < 6 && to.major >= 6;

        if crosses_six && c.security_format != Some(6) && !(c.users.is_empty() && c.roles.is_empty()) {
            c.outdated.insert(SECURITY.to_string());
        }
        if crosses_six && !c.watches.is_empty() {
            c.outdated.insert(WATCHES.to_string());
            c.outdated.insert(TRIGGERED_WATCHES.to_string());
        }
        if crosses_six {
            c.templates
                .extend(NEW_WATCHER_TEMPLATES.iter().map(|t| t.to_string()));
        }
        let recovery = c.recovery_polls;
        if let Some(job) = c.job.as_mut() {
            job.recovering = recovery;
        }
        for key in std::mem::take(&mut c.lost_on_restart) {
            c.docs.remove(&key);
        }
        c.watcher = Watcher::Started;
        c.version = to;
    }

    /// Answer `method path` with `status` and `body` instead of simulating it.
    pub fn respond_with(&self, method: Method, path: &str, status: u16, body: Value) {
        self.state
            .borrow_mut()
            .injected
            .push((method, path.to_string(), status, body));
    }

    /// The watcher upgrade leaves the pre-6.0 templates installed.
    pub fn keep_old_templates(&self) {
        self.state.borrow_mut().keep_old_templates = true;
    }

    /// Replace a stored watch behind the service's back.
    pub fn overwrite_watch(&self, id: &str, watch: Value) {
        let mut c = self.state.borrow_mut();
        let version = c.watches.get(id).map_or(1, |(_, v)| *v);
        c.watches.insert(id.to_string(), (watch, version));
    }

    pub fn templates(&self) -> Vec<String> {
        self.state.borrow().templates.iter().cloned().collect()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.state.borrow_mut().reachable = reachable;
    }

    /// Number of job API polls a restarted job reports `stopped` for.
    pub fn set_job_recovery_polls(&self, polls: u32) {
        self.state.borrow_mut().recovery_polls = polls;
    }

    /// Drop a document when the cluster next restarts.
    pub fn lose_on_restart(&self, path: &str) {
        self.state
            .borrow_mut()
            .lost_on_restart
            .push(path.trim_start_matches('/').to_string());
    }

    pub fn is_outdated(&self, store: &str) -> bool {
        self.state.borrow().outdated.contains(store)
    }

    pub fn security_format(&self) -> Option<u64> {
        self.state.borrow().security_format
    }

    pub fn rollup_docs(&self) -> usize {
        self.state.borrow().rollup_docs
    }

    pub fn requests(&self) -> Vec<ServiceRequest> {
        self.state.borrow().requests.clone()
    }

    pub fn clear_requests(&self) {
        self.state.borrow_mut().requests.clear();
    }

    /// Requests matching `method` and `path`.
    pub fn count(&self, method: Method, path: &str) -> usize {
        self.state
            .borrow()
            .requests
            .iter()
            .filter(|r| r.method == method && r.path == path)
            .count()
    }
}

impl ServiceClient for SimulatedCluster {
    fn call(&self, request: &ServiceRequest) -> HarnessResult<ServiceResponse> {
        let mut c = self.state.borrow_mut();
        if !c.reachable {
            return Err(HarnessError::unreachable("connection refused"));
        }
        c.requests.push(request.clone());
        let injected = c
            .injected
            .iter()
            .find(|(method, path, _, _)| *method == request.method && *path == request.path)
            .map(|(_, _, status, body)| reply(*status, body.clone()));
        Ok(injected.unwrap_or_else(|| c.handle(request)))
    }
}

fn reply(status: u16, body: Value) -> ServiceResponse {
    ServiceResponse::new(status, body.to_string())
}

fn error(status: u16, reason: &str) -> ServiceResponse {
    reply(
        status,
        json!({
            "error": {"root_cause": [{"reason": reason}], "reason": reason},
            "status": status
        }),
    )
}

fn body_of(request: &ServiceRequest) -> Value {
    request
        .body
        .as_deref()
        .and_then(|b| serde_json::from_str(b).ok())
        .unwrap_or(Value::Null)
}

impl Cluster {
    fn handle(&mut self, request: &ServiceRequest) -> ServiceResponse {
        let segments: Vec<&str> = request
            .path
            .trim_start_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .collect();

        match (&request.method, segments.as_slice()) {
            (Method::Get, ["_cluster", "health"]) | (Method::Get, ["_cluster", "health", _]) => {
                self.health(request)
            }
            (Method::Get, ["_cluster", "state", "metadata"]) => self.cluster_state(),
            (Method::Get, ["_tasks"]) => self.tasks(),
            (Method::Post, ["_bulk"]) => self.bulk(request),
            (Method::Get, ["_xpack", "migration", "assistance"]) => self.assistance(),
            (Method::Post, ["_xpack", "migration", "upgrade", name]) => self.upgrade(name),
            (Method::Put, ["_xpack", "security", "user", id]) => {
                self.put_security(id, body_of(request), true)
            }
            (Method::Put, ["_xpack", "security", "role", id]) => {
                self.put_security(id, body_of(request), false)
            }
            (Method::Get, ["_xpack", "security", "user", id]) => match self.users.get(*id) {
                Some(user) => reply(200, json!({ *id: user })),
                None => reply(404, json!({})),
            },
            (Method::Get, ["_xpack", "security", "role", id]) => match self.roles.get(*id) {
                Some(role) => reply(200, json!({ *id: role })),
                None => reply(404, json!({})),
            },
            (Method::Get, [".security", "_settings", "index.format"]) => self.security_settings(),
            (Method::Put, ["_xpack", "watcher", "watch", id]) => self.put_watch(id, body_of(request)),
            (Method::Delete, ["_xpack", "watcher", "watch", id]) => match self.watches.remove(*id) {
                Some((_, version)) => reply(200, json!({"found": true, "_id": id, "_version": version + 1})),
                None => reply(404, json!({"found": false, "_id": id})),
            },
            (Method::Get, ["_template"]) => {
                let templates: serde_json::Map<String, Value> = self
                    .templates
                    .iter()
                    .map(|name| (name.clone(), json!({"order": 0})))
                    .collect();
                reply(200, Value::Object(templates))
            }
            (Method::Get, ["_xpack", "watcher", "watch", id]) => match self.watches.get(*id) {
                Some((watch, version)) => reply(
                    200,
                    json!({"found": true, "_id": id, "_version": version, "watch": watch}),
                ),
                None => reply(404, json!({"found": false, "_id": id})),
            },
            (Method::Post, ["_xpack", "watcher", "_start"]) => {
                self.watcher = Watcher::Starting(1);
                reply(200, json!({"acknowledged": true}))
            }
            (Method::Post, ["_xpack", "watcher", "_stop"]) => {
                self.watcher = Watcher::Stopping(1);
                reply(200, json!({"acknowledged": true}))
            }
            (Method::Get, ["_xpack", "watcher", "stats"]) => {
                let state = self.watcher.observe();
                reply(
                    200,
                    json!({"stats": [
                        {"node_id": "node-0", "watcher_state": state},
                        {"node_id": "node-1", "watcher_state": state}
                    ]}),
                )
            }
            (Method::Put, ["_xpack", "rollup", "job", id]) => self.put_job(id, body_of(request)),
            (Method::Post, ["_xpack", "rollup", "job", _, "_start"]) => match self.job.as_mut() {
                Some(job) => {
                    job.running = true;
                    reply(200, json!({"started": true}))
                }
                None => error(404, "the task with id [rollup-job-test] doesn't exist"),
            },
            (Method::Get, ["_xpack", "rollup", "job", id]) => self.get_job(id),
            (Method::Post, ["_xpack", "sql"]) => self.sql(request),
            (Method::Get, [index, "_search"]) => self.search(index),
            (Method::Put, [index, ty, id]) => self.put_doc(index, ty, id, body_of(request)),
            (Method::Get, [index, ty, id]) => {
                let key = format!("{}/{}/{}", index, ty, id);
                match self.docs.get(&key) {
                    Some(source) => reply(
                        200,
                        json!({"_index": index, "_type": ty, "_id": id, "found": true, "_source": source}),
                    ),
                    None => reply(404, json!({"_index": index, "_id": id, "found": false})),
                }
            }
            (Method::Post, [index, ty]) => {
                self.next_id += 1;
                let id = format!("auto-{}", self.next_id);
                self.put_doc(index, ty, &id, body_of(request))
            }
            _ => error(404, &format!("no handler found for {} {}", request.method, request.path)),
        }
    }

    fn health(&self, request: &ServiceRequest) -> ServiceResponse {
        if request.param_value("wait_for_no_initializing_shards").is_some()
            && self.version < v("6.2.0")
        {
            return error(
                400,
                "request [/_cluster/health] contains unrecognized parameter: [wait_for_no_initializing_shards]",
            );
        }
        reply(200, json!({"cluster_name": "sim", "status": "yellow", "timed_out": false}))
    }

    fn put_doc(&mut self, index: &str, ty: &str, id: &str, source: Value) -> ServiceResponse {
        let types = self.types.entry(index.to_string()).or_default();
        if self.version >= v("6.0.0-alpha1") && !types.is_empty() && !types.contains(ty) {
            return error(
                400,
                &format!(
                    "Rejecting mapping update to [{}] as the final mapping would have more than 1 type",
                    index
                ),
            );
        }
        types.insert(ty.to_string());
        self.docs.insert(format!("{}/{}/{}", index, ty, id), source);
        reply(201, json!({"_index": index, "_type": ty, "_id": id, "result": "created"}))
    }

    fn search(&mut self, index: &str) -> ServiceResponse {
        let firing = self.watcher == Watcher::Started && !self.watches.is_empty();
        let total = if index == "bwc_watch_index" {
            if firing {
                self.watch_hits += 1;
            }
            self.watch_hits
        } else if index == ".watcher-history*" {
            if firing {
                self.history_hits += 1;
            }
            self.history_hits
        } else {
            let prefix = format!("{}/", index);
            self.docs.keys().filter(|k| k.starts_with(&prefix)).count() as u64
        };
        reply(200, json!({"hits": {"total": total, "hits": []}}))
    }

    fn sql(&self, request: &ServiceRequest) -> ServiceResponse {
        let query = body_of(request);
        let Some(index) = query["query"]
            .as_str()
            .and_then(|q| q.strip_prefix("SELECT * FROM "))
        else {
            return error(400, "unsupported query");
        };
        match self.types.get(index) {
            Some(types) if types.len() > 1 => {
                let names: Vec<&str> = types.iter().map(String::as_str).collect();
                error(
                    400,
                    &format!(
                        "[{}] contains more than one type [{}] so it is incompatible with sql",
                        index,
                        names.join(", ")
                    ),
                )
            }
            Some(_) => reply(200, json!({"columns": [], "rows": []})),
            None => error(400, &format!("Unknown index [{}]", index)),
        }
    }

    fn put_security(&mut self, id: &str, body: Value, user: bool) -> ServiceResponse {
        if self.outdated.contains(SECURITY) {
            return error(500, NOT_UPGRADED);
        }
        if self.users.is_empty() && self.roles.is_empty() && self.security_format.is_none() {
            // New stores get the current format from 6.0 on.
            if self.version.major >= 6 {
                self.security_format = Some(6);
            }
        }
        if user {
            let stored = json!({
                "username": id,
                "roles": body["roles"],
                "full_name": body["full_name"],
                "email": body["email"],
                "enabled": body["enabled"],
            });
            let created = self.users.insert(id.to_string(), stored).is_none();
            reply(200, json!({"user": {"created": created}}))
        } else {
            let created = self.roles.insert(id.to_string(), body).is_none();
            reply(200, json!({"role": {"created": created}}))
        }
    }

    fn security_settings(&self) -> ServiceResponse {
        match self.security_format {
            None => reply(200, json!({})),
            Some(format) => reply(
                200,
                json!({".security-6": {"settings": {"index": {"format": format.to_string()}}}}),
            ),
        }
    }

    fn assistance(&self) -> ServiceResponse {
        if self.version < v("5.6.0") {
            return error(404, "no handler found for uri [/_xpack/migration/assistance]");
        }
        let indices: serde_json::Map<String, Value> = self
            .outdated
            .iter()
            .map(|name| (name.clone(), json!({"action_required": "upgrade"})))
            .collect();
        reply(200, json!({ "indices": indices }))
    }

    fn upgrade(&mut self, name: &str) -> ServiceResponse {
        if !self.outdated.remove(name) {
            return error(
                400,
                &format!("index [{}] cannot be upgraded, it is already on the current version", name),
            );
        }
        let total = match name {
            SECURITY => {
                self.security_format = Some(6);
                (self.users.len() + self.roles.len()) as u64
            }
            WATCHES => {
                if !self.keep_old_templates {
                    self.templates
                        .retain(|t| t != "watches" && !t.starts_with("watch-history"));
                }
                self.watches.len() as u64
            }
            TRIGGERED_WATCHES => {
                if !self.keep_old_templates {
                    self.templates.remove("triggered_watches");
                }
                0
            }
            _ => 0,
        };
        reply(
            200,
            json!({"took": 12, "timed_out": false, "total": total, "created": total, "updated": 0, "failures": []}),
        )
    }

    fn put_watch(&mut self, id: &str, watch: Value) -> ServiceResponse {
        let version = self.watches.get(id).map(|(_, v)| v + 1).unwrap_or(1);
        self.watches.insert(id.to_string(), (stored_watch(watch), version));
        reply(
            200,
            json!({"_id": id, "_version": version, "created": version == 1}),
        )
    }

    fn bulk(&mut self, request: &ServiceRequest) -> ServiceResponse {
        let body = request.body.as_deref().unwrap_or_default();
        let lines: Vec<&str> = body.lines().filter(|l| !l.trim().is_empty()).collect();
        if lines.len() % 2 != 0 {
            return error(400, "The bulk request must be terminated by a newline");
        }
        let items = lines.len() / 2;
        self.rollup_docs += items;
        reply(200, json!({"took": 3, "errors": false, "items": vec![json!({"index": {"status": 201}}); items]}))
    }

    fn put_job(&mut self, id: &str, config: Value) -> ServiceResponse {
        if self.version < v("6.3.0") {
            return error(400, &format!("no handler found for uri [/_xpack/rollup/job/{}]", id));
        }
        let mut config = config;
        config["id"] = json!(id);
        self.job = Some(RollupJob {
            config,
            running: false,
            recovering: 0,
            indexed_once: false,
        });
        reply(200, json!({"acknowledged": true}))
    }

    fn get_job(&mut self, id: &str) -> ServiceResponse {
        let Some(job) = self.job.as_mut() else {
            return reply(200, json!({"jobs": []}));
        };
        if job.config["id"] != json!(id) {
            return reply(200, json!({"jobs": []}));
        }
        let state = job.state();
        if job.recovering > 0 {
            job.recovering -= 1;
        } else if job.running {
            job.indexed_once = true;
        }
        reply(
            200,
            json!({"jobs": [{"config": job.config, "status": {"job_state": state}, "stats": {}}]}),
        )
    }

    fn tasks(&self) -> ServiceResponse {
        let tasks = match &self.job {
            Some(job) if job.running => json!({
                "node-0:17": {"action": "xpack/rollup/job[c]", "status": {"job_state": job.state()}}
            }),
            _ => json!({}),
        };
        reply(200, json!({"nodes": {"node-0": {"name": "node-0", "tasks": tasks}}}))
    }

    fn cluster_state(&self) -> ServiceResponse {
        let field = if self.version < v("6.4.0") { "status" } else { "state" };
        let tasks: Vec<Value> = self
            .job
            .iter()
            .map(|job| {
                json!({
                    "id": job.config["id"],
                    "task": {"xpack/rollup/job": {
                        "params": job.config,
                        field: {"job_state": job.state()}
                    }}
                })
            })
            .collect();
        reply(200, json!({"metadata": {"persistent_tasks": {"tasks": tasks}}}))
    }
}

/// Milliseconds of a time value such as `100s` or `1.5m`.
fn millis(raw: &str) -> Option<u64> {
    const UNITS: [(&str, f64); 5] = [
        ("ms", 1.0),
        ("s", 1_000.0),
        ("m", 60_000.0),
        ("h", 3_600_000.0),
        ("d", 86_400_000.0),
    ];
    UNITS.iter().find_map(|(suffix, factor)| {
        raw.strip_suffix(suffix)
            .and_then(|n| n.parse::<f64>().ok())
            .map(|n| (n * factor).round() as u64)
    })
}

/// A watch as the service returns it after storing `watch`.
fn stored_watch(watch: Value) -> Value {
    match watch {
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (key, value) in map {
                let renamed = match key.as_str() {
                    "timeout" | "throttle_period" => Some(format!("{}_in_millis", key)),
                    "read_timeout" | "connection_timeout" => Some(format!("{}_millis", key)),
                    _ => None,
                };
                match (renamed, value.as_str().and_then(millis)) {
                    (Some(name), Some(ms)) => {
                        out.insert(name, json!(ms));
                    }
                    _ if key == "password" => {
                        out.insert(key, json!(REDACTED));
                    }
                    _ if key == "logging" => {
                        let mut logging = stored_watch(value);
                        if let Some(fields) = logging.as_object_mut() {
                            fields.entry("level").or_insert_with(|| json!("info"));
                        }
                        out.insert(key, logging);
                    }
                    _ => {
                        out.insert(key, stored_watch(value));
                    }
                }
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(stored_watch).collect()),
        other => other,
    }
}
