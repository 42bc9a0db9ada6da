//! In-process api server
//!
//! Backs clusters whose api server URL uses the `memory://` scheme. It keeps
//! objects as JSON, honours namespaces, resource versions, label and field
//! selectors and merge patches, and can simulate controllers: deployments
//! get a ready status and pods, run-once pods finish with a scripted outcome.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::client::KubeError;
use super::resources::LabelSelector;
use super::transport::{ApiRequest, ApiResponse, Method, Transport};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct ObjKey {
    plural: String,
    namespace: String,
    name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Collection {
        plural: String,
        namespace: Option<String>,
    },
    Object {
        plural: String,
        namespace: Option<String>,
        name: String,
    },
    Log {
        namespace: String,
        name: String,
    },
}

/// Outcome of a run-once pod
#[derive(Debug, Clone)]
pub struct PodScript {
    pub succeeded: bool,
    pub exit_code: i32,
    pub logs: Vec<String>,
}

impl PodScript {
    pub fn success(logs: &[&str]) -> Self {
        Self {
            succeeded: true,
            exit_code: 0,
            logs: logs.iter().map(|l| l.to_string()).collect(),
        }
    }

    pub fn failure(exit_code: i32, logs: &[&str]) -> Self {
        Self {
            succeeded: false,
            exit_code,
            logs: logs.iter().map(|l| l.to_string()).collect(),
        }
    }
}

pub struct MemoryApiServer {
    name: String,
    objects: DashMap<ObjKey, Value>,
    resource_version: AtomicU64,
    writes: AtomicUsize,
    auto_ready: AtomicBool,
    faults: DashMap<String, VecDeque<u16>>,
    pod_scripts: DashMap<String, PodScript>,
    pod_logs: DashMap<ObjKey, String>,
}

impl std::fmt::Debug for MemoryApiServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryApiServer")
            .field("name", &self.name)
            .field("objects", &self.objects.len())
            .finish()
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

fn parse_path(path: &str) -> Option<Route> {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    let rest = match segments.first()? {
        &"api" if segments.len() >= 2 => &segments[2..],
        &"apis" if segments.len() >= 3 => &segments[3..],
        _ => return None,
    };
    let owned = |s: &str| s.to_string();
    match rest {
        ["namespaces"] => Some(Route::Collection {
            plural: owned("namespaces"),
            namespace: None,
        }),
        ["namespaces", name] => Some(Route::Object {
            plural: owned("namespaces"),
            namespace: None,
            name: owned(name),
        }),
        ["namespaces", ns, plural] => Some(Route::Collection {
            plural: owned(plural),
            namespace: Some(owned(ns)),
        }),
        ["namespaces", ns, plural, name] => Some(Route::Object {
            plural: owned(plural),
            namespace: Some(owned(ns)),
            name: owned(name),
        }),
        ["namespaces", ns, "pods", name, "log"] => Some(Route::Log {
            namespace: owned(ns),
            name: owned(name),
        }),
        [plural] => Some(Route::Collection {
            plural: owned(plural),
            namespace: None,
        }),
        _ => None,
    }
}

/// RFC 7386 JSON merge patch
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Some(target_map) = target.as_object_mut() {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                merge_patch(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

fn labels_of(obj: &Value) -> BTreeMap<String, String> {
    obj.pointer("/metadata/labels")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Evaluate `a.b=c,d=e` against an object
fn fields_match(obj: &Value, selector: &str) -> bool {
    selector
        .split(',')
        .filter(|t| !t.trim().is_empty())
        .all(|term| match term.split_once('=') {
            Some((path, expected)) => {
                let pointer = format!("/{}", path.trim().replace('.', "/"));
                obj.pointer(&pointer).and_then(Value::as_str) == Some(expected.trim())
            }
            None => false,
        })
}

fn status_body(code: u16, reason: &str, message: &str) -> ApiResponse {
    ApiResponse {
        status: code,
        body: json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": if code < 300 { "Success" } else { "Failure" },
            "reason": reason,
            "message": message,
            "code": code,
        })
        .to_string(),
    }
}

fn ok(value: &Value) -> ApiResponse {
    ApiResponse {
        status: 200,
        body: value.to_string(),
    }
}

fn template_hash(template: &Value) -> String {
    let digest = Sha256::digest(template.to_string().as_bytes());
    digest.iter().take(5).map(|b| format!("{:02x}", b)).collect()
}

// ============================================================================
// SBIO: I/O boundary
// ============================================================================

impl MemoryApiServer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            objects: DashMap::new(),
            resource_version: AtomicU64::new(1),
            writes: AtomicUsize::new(0),
            auto_ready: AtomicBool::new(true),
            faults: DashMap::new(),
            pod_scripts: DashMap::new(),
            pod_logs: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of mutating requests served
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn reset_writes(&self) {
        self.writes.store(0, Ordering::SeqCst);
    }

    /// Toggle simulated deployment readiness
    pub fn set_auto_ready(&self, enabled: bool) {
        self.auto_ready.store(enabled, Ordering::SeqCst);
    }

    /// Fail the next `times` requests of `method` on `plural` with `status`
    pub fn inject_failure(&self, method: Method, plural: &str, status: u16, times: usize) {
        let mut queue = self
            .faults
            .entry(format!("{:?} {}", method, plural))
            .or_default();
        queue.extend(std::iter::repeat(status).take(times));
    }

    /// Outcome for run-once pods whose name starts with `prefix`
    pub fn set_pod_script(&self, prefix: &str, script: PodScript) {
        self.pod_scripts.insert(prefix.to_string(), script);
    }

    pub fn objects(&self, plural: &str, namespace: &str) -> Vec<Value> {
        let mut items: Vec<(ObjKey, Value)> = self
            .objects
            .iter()
            .filter(|e| e.key().plural == plural && e.key().namespace == namespace)
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));
        items.into_iter().map(|(_, v)| v).collect()
    }

    pub fn object(&self, plural: &str, namespace: &str, name: &str) -> Option<Value> {
        self.objects
            .get(&ObjKey {
                plural: plural.to_string(),
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
            .map(|v| v.clone())
    }

    /// Seed an object without counting it as a write
    pub fn seed(&self, plural: &str, namespace: &str, mut obj: Value) {
        let name = obj
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        self.stamp_new(&mut obj, namespace);
        self.objects.insert(
            ObjKey {
                plural: plural.to_string(),
                namespace: namespace.to_string(),
                name,
            },
            obj,
        );
    }

    fn next_rv(&self) -> String {
        self.resource_version
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
    }

    fn stamp_new(&self, obj: &mut Value, namespace: &str) {
        let rv = self.next_rv();
        merge_patch(
            obj,
            &json!({
                "metadata": {
                    "uid": Uuid::new_v4().to_string(),
                    "resourceVersion": rv,
                    "creationTimestamp": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
                    "generation": 1,
                }
            }),
        );
        if !namespace.is_empty() {
            merge_patch(obj, &json!({"metadata": {"namespace": namespace}}));
        }
    }

    fn take_fault(&self, method: Method, plural: &str) -> Option<u16> {
        self.faults
            .get_mut(&format!("{:?} {}", method, plural))
            .and_then(|mut q| q.pop_front())
    }

    fn namespace_exists(&self, namespace: &str) -> bool {
        self.objects.contains_key(&ObjKey {
            plural: "namespaces".to_string(),
            namespace: String::new(),
            name: namespace.to_string(),
        })
    }

    fn handle(&self, request: ApiRequest) -> ApiResponse {
        let Some(route) = parse_path(&request.path) else {
            return status_body(404, "NotFound", &format!("no route for {}", request.path));
        };

        let plural = match &route {
            Route::Collection { plural, .. } | Route::Object { plural, .. } => plural.clone(),
            Route::Log { .. } => "pods".to_string(),
        };
        if let Some(code) = self.take_fault(request.method, &plural) {
            return status_body(code, "InjectedFault", "injected failure");
        }

        let query: BTreeMap<String, String> = request.query.iter().cloned().collect();
        let response = match (request.method, route) {
            (Method::Get, Route::Collection { plural, namespace }) => {
                self.list(&plural, namespace.as_deref(), &query)
            }
            (Method::Post, Route::Collection { plural, namespace }) => {
                self.create(&plural, namespace.unwrap_or_default(), request.body)
            }
            (Method::Delete, Route::Collection { plural, namespace }) => {
                self.delete_collection(&plural, namespace.as_deref(), &query)
            }
            (Method::Get, Route::Object { plural, namespace, name }) => {
                match self.object(&plural, namespace.as_deref().unwrap_or_default(), &name) {
                    Some(obj) => ok(&obj),
                    None => self.not_found(&plural, &name),
                }
            }
            (Method::Put, Route::Object { plural, namespace, name }) => {
                self.replace(&plural, namespace.unwrap_or_default(), &name, request.body)
            }
            (Method::Patch, Route::Object { plural, namespace, name }) => {
                self.patch(&plural, namespace.unwrap_or_default(), &name, request.body)
            }
            (Method::Delete, Route::Object { plural, namespace, name }) => {
                self.delete(&plural, namespace.unwrap_or_default(), &name)
            }
            (Method::Get, Route::Log { namespace, name }) => {
                let key = ObjKey {
                    plural: "pods".to_string(),
                    namespace,
                    name: name.clone(),
                };
                if !self.objects.contains_key(&key) {
                    return self.not_found("pods", &name);
                }
                let logs = self.pod_logs.get(&key).map(|l| l.clone()).unwrap_or_default();
                let logs = match query.get("tailLines").and_then(|n| n.parse::<usize>().ok()) {
                    Some(n) => {
                        let lines: Vec<&str> = logs.lines().collect();
                        lines[lines.len().saturating_sub(n)..].join("\n")
                    }
                    None => logs,
                };
                ApiResponse {
                    status: 200,
                    body: logs,
                }
            }
            (method, route) => status_body(
                405,
                "MethodNotAllowed",
                &format!("{:?} not supported on {:?}", method, route),
            ),
        };

        if request.method.is_write() && response.status < 300 {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        response
    }

    fn not_found(&self, plural: &str, name: &str) -> ApiResponse {
        status_body(404, "NotFound", &format!("{} \"{}\" not found", plural, name))
    }

    fn namespace_missing(&self, namespace: &str) -> ApiResponse {
        status_body(
            404,
            "NotFound",
            &format!("namespaces \"{}\" not found", namespace),
        )
    }

    fn list(
        &self,
        plural: &str,
        namespace: Option<&str>,
        query: &BTreeMap<String, String>,
    ) -> ApiResponse {
        let selector = match query.get("labelSelector").map(|s| LabelSelector::parse(s)) {
            Some(Ok(s)) => Some(s),
            Some(Err(e)) => return status_body(400, "BadRequest", &e),
            None => None,
        };
        let fields = query.get("fieldSelector");

        let mut items: Vec<(ObjKey, Value)> = self
            .objects
            .iter()
            .filter(|e| e.key().plural == plural)
            .filter(|e| namespace.map_or(true, |ns| e.key().namespace == ns))
            .filter(|e| {
                selector
                    .as_ref()
                    .map_or(true, |s| s.matches(&labels_of(e.value())))
            })
            .filter(|e| fields.map_or(true, |f| fields_match(e.value(), f)))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        items.sort_by(|a, b| a.0.cmp(&b.0));

        ok(&json!({
            "apiVersion": "v1",
            "kind": "List",
            "metadata": {"resourceVersion": self.resource_version.load(Ordering::SeqCst).to_string()},
            "items": items.into_iter().map(|(_, v)| v).collect::<Vec<_>>(),
        }))
    }

    fn create(&self, plural: &str, namespace: String, body: Option<Value>) -> ApiResponse {
        let Some(mut obj) = body else {
            return status_body(400, "BadRequest", "missing body");
        };
        let name = match obj.pointer("/metadata/name").and_then(Value::as_str) {
            Some(n) if !n.is_empty() => n.to_string(),
            _ => return status_body(422, "Invalid", "metadata.name: Required value"),
        };
        if !namespace.is_empty() && !self.namespace_exists(&namespace) {
            return self.namespace_missing(&namespace);
        }
        let key = ObjKey {
            plural: plural.to_string(),
            namespace: namespace.clone(),
            name: name.clone(),
        };
        if self.objects.contains_key(&key) {
            return status_body(
                409,
                "AlreadyExists",
                &format!("{} \"{}\" already exists", plural, name),
            );
        }

        self.stamp_new(&mut obj, &namespace);
        self.objects.insert(key.clone(), obj);
        self.after_write(&key);
        match self.objects.get(&key) {
            Some(stored) => ApiResponse {
                status: 201,
                body: stored.to_string(),
            },
            None => self.not_found(plural, &name),
        }
    }

    fn replace(&self, plural: &str, namespace: String, name: &str, body: Option<Value>) -> ApiResponse {
        let Some(mut obj) = body else {
            return status_body(400, "BadRequest", "missing body");
        };
        let key = ObjKey {
            plural: plural.to_string(),
            namespace,
            name: name.to_string(),
        };
        let Some(live) = self.objects.get(&key).map(|v| v.clone()) else {
            return self.not_found(plural, name);
        };

        let live_rv = live.pointer("/metadata/resourceVersion").cloned();
        if let Some(sent) = obj.pointer("/metadata/resourceVersion") {
            if Some(sent) != live_rv.as_ref() {
                return status_body(
                    409,
                    "Conflict",
                    &format!(
                        "Operation cannot be fulfilled on {} \"{}\": the object has been modified",
                        plural, name
                    ),
                );
            }
        }

        let spec_changed = live.get("spec") != obj.get("spec");
        let generation = live
            .pointer("/metadata/generation")
            .and_then(Value::as_i64)
            .unwrap_or(1)
            + i64::from(spec_changed);
        merge_patch(
            &mut obj,
            &json!({
                "metadata": {
                    "uid": live.pointer("/metadata/uid"),
                    "creationTimestamp": live.pointer("/metadata/creationTimestamp"),
                    "namespace": live.pointer("/metadata/namespace"),
                    "resourceVersion": self.next_rv(),
                    "generation": generation,
                }
            }),
        );
        self.objects.insert(key.clone(), obj);
        self.after_write(&key);
        match self.objects.get(&key) {
            Some(stored) => ok(&stored),
            None => self.not_found(plural, name),
        }
    }

    fn patch(&self, plural: &str, namespace: String, name: &str, body: Option<Value>) -> ApiResponse {
        let Some(patch) = body else {
            return status_body(400, "BadRequest", "missing body");
        };
        let key = ObjKey {
            plural: plural.to_string(),
            namespace,
            name: name.to_string(),
        };
        {
            let Some(mut live) = self.objects.get_mut(&key) else {
                return self.not_found(plural, name);
            };
            let spec_before = live.get("spec").cloned();
            merge_patch(&mut live, &patch);
            let spec_changed = live.get("spec").cloned() != spec_before;
            let generation = live
                .pointer("/metadata/generation")
                .and_then(Value::as_i64)
                .unwrap_or(1)
                + i64::from(spec_changed);
            let rv = self.next_rv();
            merge_patch(
                &mut live,
                &json!({"metadata": {"resourceVersion": rv, "generation": generation}}),
            );
        }
        self.after_write(&key);
        match self.objects.get(&key) {
            Some(stored) => ok(&stored),
            None => self.not_found(plural, name),
        }
    }

    fn delete(&self, plural: &str, namespace: String, name: &str) -> ApiResponse {
        let key = ObjKey {
            plural: plural.to_string(),
            namespace: namespace.clone(),
            name: name.to_string(),
        };
        if self.objects.remove(&key).is_none() {
            return self.not_found(plural, name);
        }
        match plural {
            "namespaces" => self.objects.retain(|k, _| k.namespace != name),
            "deployments" => self.remove_owned_pods(&namespace, name, None),
            "pods" => {
                self.pod_logs.remove(&key);
            }
            _ => {}
        }
        status_body(200, "", "deleted")
    }

    fn delete_collection(
        &self,
        plural: &str,
        namespace: Option<&str>,
        query: &BTreeMap<String, String>,
    ) -> ApiResponse {
        let selector = match query.get("labelSelector").map(|s| LabelSelector::parse(s)) {
            Some(Ok(s)) => s,
            Some(Err(e)) => return status_body(400, "BadRequest", &e),
            None => LabelSelector::default(),
        };
        let doomed: Vec<ObjKey> = self
            .objects
            .iter()
            .filter(|e| e.key().plural == plural)
            .filter(|e| namespace.map_or(true, |ns| e.key().namespace == ns))
            .filter(|e| selector.matches(&labels_of(e.value())))
            .map(|e| e.key().clone())
            .collect();
        for key in doomed {
            let (ns, name) = (key.namespace.clone(), key.name.clone());
            self.objects.remove(&key);
            if plural == "deployments" {
                self.remove_owned_pods(&ns, &name, None);
            }
        }
        status_body(200, "", "deleted")
    }

    // =========================================================================
    // Simulated controllers
    // =========================================================================

    fn after_write(&self, key: &ObjKey) {
        match key.plural.as_str() {
            "deployments" => self.reconcile_deployment(key),
            "pods" => self.run_pod(key),
            _ => {}
        }
    }

    fn remove_owned_pods(&self, namespace: &str, deployment: &str, keep_hash: Option<&str>) {
        self.objects.retain(|k, v| {
            if k.plural != "pods" || k.namespace != namespace {
                return true;
            }
            let owned = v
                .pointer("/metadata/ownerReferences/0/name")
                .and_then(Value::as_str)
                == Some(deployment);
            let same_template = keep_hash.is_some()
                && v.pointer("/metadata/labels/pod-template-hash")
                    .and_then(Value::as_str)
                    == keep_hash;
            !owned || same_template
        });
    }

    fn reconcile_deployment(&self, key: &ObjKey) {
        let Some(deployment) = self.objects.get(key).map(|v| v.clone()) else {
            return;
        };
        let replicas = deployment
            .pointer("/spec/replicas")
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let generation = deployment
            .pointer("/metadata/generation")
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let template = deployment
            .pointer("/spec/template")
            .cloned()
            .unwrap_or(Value::Null);
        let hash = template_hash(&template);

        if !self.auto_ready.load(Ordering::SeqCst) {
            if let Some(mut live) = self.objects.get_mut(key) {
                merge_patch(
                    &mut live,
                    &json!({"status": {
                        "observedGeneration": generation,
                        "replicas": replicas,
                        "updatedReplicas": 0,
                        "readyReplicas": 0,
                        "availableReplicas": 0,
                        "conditions": [{"type": "Available", "status": "False", "reason": "MinimumReplicasUnavailable"}],
                    }}),
                );
            }
            return;
        }

        self.remove_owned_pods(&key.namespace, &key.name, Some(&hash));
        let mut current: Vec<ObjKey> = self
            .objects
            .iter()
            .filter(|e| {
                e.key().plural == "pods"
                    && e.key().namespace == key.namespace
                    && e.value()
                        .pointer("/metadata/ownerReferences/0/name")
                        .and_then(Value::as_str)
                        == Some(key.name.as_str())
            })
            .map(|e| e.key().clone())
            .collect();
        current.sort();

        while current.len() as i64 > replicas {
            if let Some(extra) = current.pop() {
                self.objects.remove(&extra);
            }
        }
        let mut index = 0;
        while (current.len() as i64) < replicas {
            let pod_name = format!("{}-{}-{}", key.name, hash, index);
            index += 1;
            let pod_key = ObjKey {
                plural: "pods".to_string(),
                namespace: key.namespace.clone(),
                name: pod_name.clone(),
            };
            if self.objects.contains_key(&pod_key) {
                continue;
            }
            let mut pod = self.ready_pod(&pod_name, &key.name, &hash, &template);
            self.stamp_new(&mut pod, &key.namespace);
            self.objects.insert(pod_key.clone(), pod);
            current.push(pod_key);
        }

        if let Some(mut live) = self.objects.get_mut(key) {
            merge_patch(
                &mut live,
                &json!({"status": {
                    "observedGeneration": generation,
                    "replicas": replicas,
                    "updatedReplicas": replicas,
                    "readyReplicas": replicas,
                    "availableReplicas": replicas,
                    "conditions": [
                        {"type": "Available", "status": "True", "reason": "MinimumReplicasAvailable"},
                        {"type": "Progressing", "status": "True", "reason": "NewReplicaSetAvailable"},
                    ],
                }}),
            );
        }
    }

    fn ready_pod(&self, name: &str, owner: &str, hash: &str, template: &Value) -> Value {
        let mut labels = template
            .pointer("/metadata/labels")
            .cloned()
            .unwrap_or_else(|| json!({}));
        merge_patch(&mut labels, &json!({"pod-template-hash": hash}));
        let spec = template.get("spec").cloned().unwrap_or_else(|| json!({}));
        let now = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let container_statuses: Vec<Value> = spec
            .get("containers")
            .and_then(Value::as_array)
            .map(|containers| {
                containers
                    .iter()
                    .map(|c| {
                        json!({
                            "name": c.get("name").cloned().unwrap_or(Value::Null),
                            "image": c.get("image").cloned().unwrap_or(Value::Null),
                            "imageID": "",
                            "ready": true,
                            "started": true,
                            "restartCount": 0,
                            "state": {"running": {"startedAt": now}},
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "labels": labels,
                "ownerReferences": [{
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "name": owner,
                    "uid": "",
                }],
            },
            "spec": spec,
            "status": {
                "phase": "Running",
                "startTime": now,
                "conditions": [{"type": "Ready", "status": "True"}],
                "containerStatuses": container_statuses,
            },
        })
    }

    fn run_pod(&self, key: &ObjKey) {
        let Some(pod) = self.objects.get(key).map(|v| v.clone()) else {
            return;
        };
        let run_once = pod.pointer("/spec/restartPolicy").and_then(Value::as_str) == Some("Never");
        if !run_once || pod.pointer("/status/phase").is_some() {
            return;
        }

        let script = self
            .pod_scripts
            .iter()
            .filter(|s| key.name.starts_with(s.key().as_str()))
            .max_by_key(|s| s.key().len())
            .map(|s| s.value().clone())
            .unwrap_or_else(|| PodScript::success(&["done"]));

        let now = Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let container = pod
            .pointer("/spec/containers/0/name")
            .cloned()
            .unwrap_or_else(|| json!("main"));
        let image = pod
            .pointer("/spec/containers/0/image")
            .cloned()
            .unwrap_or(Value::Null);
        let phase = if script.succeeded { "Succeeded" } else { "Failed" };
        if let Some(mut live) = self.objects.get_mut(key) {
            merge_patch(
                &mut live,
                &json!({"status": {
                    "phase": phase,
                    "startTime": now,
                    "containerStatuses": [{
                        "name": container,
                        "image": image,
                        "imageID": "",
                        "ready": false,
                        "restartCount": 0,
                        "state": {"terminated": {
                            "exitCode": script.exit_code,
                            "reason": if script.succeeded { "Completed" } else { "Error" },
                            "finishedAt": now,
                        }},
                    }],
                }}),
            );
        }
        self.pod_logs.insert(key.clone(), script.logs.join("\n"));
    }
}

#[async_trait]
impl Transport for MemoryApiServer {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, KubeError> {
        Ok(self.handle(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::client::KubeClient;
    use crate::cluster::resources::{object_meta, ListParams};
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
    use k8s_openapi::api::core::v1::{Container, Namespace, Pod, PodSpec, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector as K8sSelector, ObjectMeta};
    use std::sync::Arc;

    fn client() -> (Arc<MemoryApiServer>, KubeClient) {
        let server = Arc::new(MemoryApiServer::new("mem"));
        let client = KubeClient::new("mem", server.clone());
        (server, client)
    }

    async fn namespace(client: &KubeClient, name: &str) {
        let ns = Namespace {
            metadata: object_meta(name, None, BTreeMap::new()),
            ..Default::default()
        };
        client.create("", &ns).await.unwrap();
    }

    fn deployment(name: &str, replicas: i32) -> Deployment {
        let labels: BTreeMap<String, String> =
            [("process_type".to_string(), "web".to_string())].into();
        Deployment {
            metadata: object_meta(name, Some("ns1"), labels.clone()),
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                selector: K8sSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "web".into(),
                            image: Some("registry/example/foo:1".into()),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            status: None,
        }
    }

    #[test]
    fn test_parse_path() {
        assert_eq!(
            parse_path("/apis/apps/v1/namespaces/ns1/deployments/web"),
            Some(Route::Object {
                plural: "deployments".into(),
                namespace: Some("ns1".into()),
                name: "web".into()
            })
        );
        assert_eq!(
            parse_path("/api/v1/namespaces/ns1/pods/p1/log"),
            Some(Route::Log {
                namespace: "ns1".into(),
                name: "p1".into()
            })
        );
        assert_eq!(
            parse_path("/api/v1/namespaces"),
            Some(Route::Collection {
                plural: "namespaces".into(),
                namespace: None
            })
        );
        assert!(parse_path("/healthz").is_none());
    }

    #[test]
    fn test_merge_patch() {
        let mut target = json!({"a": 1, "b": {"c": 2, "d": 3}});
        merge_patch(&mut target, &json!({"b": {"c": null, "e": 4}, "f": [1]}));
        assert_eq!(target, json!({"a": 1, "b": {"d": 3, "e": 4}, "f": [1]}));
    }

    #[tokio::test]
    async fn test_create_requires_namespace() {
        let (_, client) = client();
        let err = client.create("ns1", &deployment("web", 1)).await.unwrap_err();
        assert!(matches!(err, KubeError::NamespaceMissing(ns) if ns == "ns1"));
    }

    #[tokio::test]
    async fn test_deployment_gets_ready_pods() {
        let (server, client) = client();
        namespace(&client, "ns1").await;
        let created = client.create("ns1", &deployment("web", 2)).await.unwrap();
        let status = created.status.unwrap();
        assert_eq!(status.ready_replicas, Some(2));

        let pods: Vec<Pod> = client
            .list("ns1", &ListParams::labels(LabelSelector::matching("process_type", "web")))
            .await
            .unwrap();
        assert_eq!(pods.len(), 2);

        let _: Deployment = client
            .patch_merge("ns1", "web", &json!({"spec": {"replicas": 0}}))
            .await
            .unwrap();
        assert!(server.objects("pods", "ns1").is_empty());
    }

    #[tokio::test]
    async fn test_stale_replace_conflicts() {
        let (_, client) = client();
        namespace(&client, "ns1").await;
        let mut created = client.create("ns1", &deployment("web", 1)).await.unwrap();
        created.metadata.resource_version = Some("0".into());
        assert!(matches!(
            client.replace("ns1", &created).await,
            Err(KubeError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_writes_and_faults() {
        let (server, client) = client();
        namespace(&client, "ns1").await;
        assert_eq!(server.writes(), 1);

        server.inject_failure(Method::Post, "deployments", 503, 1);
        assert!(matches!(
            client.create("ns1", &deployment("web", 1)).await,
            Err(KubeError::Transient(_))
        ));
        client.create("ns1", &deployment("web", 1)).await.unwrap();
        assert_eq!(server.writes(), 2);
    }

    #[tokio::test]
    async fn test_run_once_pod_script_and_logs() {
        let (server, client) = client();
        namespace(&client, "ns1").await;
        server.set_pod_script("hook-", PodScript::failure(3, &["migrating", "boom"]));

        let pod = Pod {
            metadata: object_meta("hook-1", Some("ns1"), BTreeMap::new()),
            spec: Some(PodSpec {
                restart_policy: Some("Never".into()),
                containers: vec![Container {
                    name: "hook".into(),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: None,
        };
        let created = client.create("ns1", &pod).await.unwrap();
        assert_eq!(created.status.unwrap().phase.as_deref(), Some("Failed"));
        let logs = client.read_pod_log("ns1", "hook-1", Some(1)).await.unwrap();
        assert_eq!(logs, "boom");
    }
}
