//! In-process stand-in for the Kubernetes API server.
//!
//! Objects are kept as JSON keyed by their URL path. Supports get, list,
//! watch (replaying from `resourceVersion`), create, replace with
//! `resourceVersion` preconditions, merge patches of `/status` and delete,
//! which covers what the client, the Lease elector and the controller use.
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct WatchEvent {
    revision: u64,
    key: String,
    line: String,
}

#[derive(Default)]
struct Store {
    objects: BTreeMap<String, Value>,
    log: Vec<WatchEvent>,
    revision: u64,
    requests: Vec<String>,
    fail_next: BTreeMap<String, u16>,
}

#[derive(Clone)]
struct Shared {
    store: Arc<Mutex<Store>>,
    events: broadcast::Sender<WatchEvent>,
    stop: CancellationToken,
}

enum Target {
    Collection(String),
    Object(String),
    Status(String),
}

impl Target {
    fn parse(path: &str) -> Option<Self> {
        let segs: Vec<&str> = path.trim_matches('/').split('/').collect();
        let prefix = match segs.first() {
            Some(&"api") => 2,
            Some(&"apis") => 3,
            _ => return None,
        };
        if segs.len() <= prefix {
            return None;
        }
        let mut rest = &segs[prefix..];
        if rest.len() >= 3 && rest[0] == "namespaces" {
            rest = &rest[2..];
        }
        let full = format!("/{}", segs.join("/"));
        match rest.len() {
            1 => Some(Self::Collection(full)),
            2 => Some(Self::Object(full)),
            3 if rest[2] == "status" => Some(Self::Status(full.trim_end_matches("/status").to_string())),
            _ => None,
        }
    }
}

/// True when the object at `key` is listed by `collection`, including
/// all-namespace collections such as `/apis/g/v/plural`.
fn in_collection(key: &str, collection: &str) -> bool {
    let Some((parent, _)) = key.rsplit_once('/') else { return false };
    if parent == collection {
        return true;
    }
    let Some((prefix, plural)) = collection.rsplit_once('/') else { return false };
    parent
        .strip_prefix(prefix)
        .and_then(|r| r.strip_prefix("/namespaces/"))
        .and_then(|r| r.split_once('/'))
        .is_some_and(|(_, p)| p == plural)
}

fn namespace_of(path: &str) -> Option<&str> {
    let (_, rest) = path.split_once("/namespaces/")?;
    rest.split('/').next()
}

fn query_param<'a>(query: &'a str, key: &str) -> Option<&'a str> {
    query.split('&').filter_map(|kv| kv.split_once('=')).find(|(k, _)| *k == key).map(|(_, v)| v)
}

fn status_error(code: u16, reason: &str, message: &str) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": message,
        "reason": reason,
        "code": code,
    });
    (status, Json(body)).into_response()
}

fn merge(target: &mut Value, patch: &Value) {
    let Value::Object(fields) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = json!({});
    }
    if let Value::Object(existing) = target {
        for (k, v) in fields {
            if v.is_null() {
                existing.remove(k);
            } else {
                merge(existing.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stamps a new resourceVersion on `obj` and publishes the event.
    fn record(&self, store: &mut Store, key: &str, kind: &str, obj: &mut Value) {
        store.revision += 1;
        obj["metadata"]["resourceVersion"] = json!(store.revision.to_string());
        let line = format!("{}\n", json!({ "type": kind, "object": obj }));
        let event = WatchEvent { revision: store.revision, key: key.to_string(), line };
        store.log.push(event.clone());
        let _ = self.events.send(event);
    }

    fn put(&self, store: &mut Store, key: String, mut obj: Value) -> Value {
        let kind = if store.objects.contains_key(&key) { "MODIFIED" } else { "ADDED" };
        if obj["metadata"]["uid"].is_null() {
            obj["metadata"]["uid"] = json!(uuid::Uuid::new_v4().to_string());
        }
        if obj["metadata"]["generation"].is_null() {
            obj["metadata"]["generation"] = json!(1);
        }
        if let Some(ns) = namespace_of(&key).filter(|_| obj["metadata"]["namespace"].is_null()) {
            obj["metadata"]["namespace"] = json!(ns);
        }
        self.record(store, &key, kind, &mut obj);
        store.objects.insert(key, obj.clone());
        obj
    }

    fn get(&self, key: &str) -> Response {
        match self.lock().objects.get(key) {
            Some(obj) => Json(obj.clone()).into_response(),
            None => status_error(404, "NotFound", &format!("{key} not found")),
        }
    }

    fn list(&self, collection: &str) -> Response {
        let store = self.lock();
        let items: Vec<Value> = store.objects.iter().filter(|(k, _)| in_collection(k, collection)).map(|(_, v)| v.clone()).collect();
        Json(json!({
            "apiVersion": "v1",
            "kind": "List",
            "metadata": { "resourceVersion": store.revision.to_string() },
            "items": items,
        }))
        .into_response()
    }

    fn watch(&self, collection: String, since: u64) -> Response {
        let (backlog, rx) = {
            let store = self.lock();
            let backlog: Vec<String> = store
                .log
                .iter()
                .filter(|e| e.revision > since && in_collection(&e.key, &collection))
                .map(|e| e.line.clone())
                .collect();
            (backlog, self.events.subscribe())
        };
        let live = futures_util::stream::unfold((rx, collection), |(mut rx, collection)| async move {
            loop {
                match rx.recv().await {
                    Ok(e) if in_collection(&e.key, &collection) => return Some((e.line, (rx, collection))),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        let lines = futures_util::stream::iter(backlog)
            .chain(live)
            .take_until(self.stop.clone().cancelled_owned())
            .map(|line| Ok::<_, Infallible>(Bytes::from(line)));
        (StatusCode::OK, [(header::CONTENT_TYPE, "application/json")], Body::from_stream(lines)).into_response()
    }

    fn create(&self, collection: &str, body: &[u8]) -> Response {
        let obj: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => return status_error(400, "BadRequest", &e.to_string()),
        };
        let Some(name) = obj["metadata"]["name"].as_str().map(str::to_string) else {
            return status_error(422, "Invalid", "metadata.name is required");
        };
        let key = format!("{collection}/{name}");
        let mut store = self.lock();
        if store.objects.contains_key(&key) {
            return status_error(409, "AlreadyExists", &format!("{name} already exists"));
        }
        let created = self.put(&mut store, key, obj);
        (StatusCode::CREATED, Json(created)).into_response()
    }

    fn replace(&self, key: &str, body: &[u8]) -> Response {
        let mut obj: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => return status_error(400, "BadRequest", &e.to_string()),
        };
        let mut store = self.lock();
        let Some(current) = store.objects.get(key).cloned() else {
            return status_error(404, "NotFound", &format!("{key} not found"));
        };
        let sent = obj["metadata"]["resourceVersion"].as_str();
        if sent.is_some() && sent != current["metadata"]["resourceVersion"].as_str() {
            return status_error(409, "Conflict", "the object has been modified");
        }
        let generation = current["metadata"]["generation"].as_i64().unwrap_or(1);
        let generation = if obj["spec"] == current["spec"] { generation } else { generation + 1 };
        obj["metadata"]["generation"] = json!(generation);
        obj["metadata"]["uid"] = current["metadata"]["uid"].clone();
        if !current["status"].is_null() {
            obj["status"] = current["status"].clone();
        }
        let replaced = self.put(&mut store, key.to_string(), obj);
        Json(replaced).into_response()
    }

    fn patch_status(&self, key: &str, body: &[u8]) -> Response {
        let patch: Value = match serde_json::from_slice(body) {
            Ok(v) => v,
            Err(e) => return status_error(400, "BadRequest", &e.to_string()),
        };
        let mut store = self.lock();
        let Some(mut obj) = store.objects.get(key).cloned() else {
            return status_error(404, "NotFound", &format!("{key} not found"));
        };
        if !patch["status"].is_null() {
            merge(&mut obj["status"], &patch["status"]);
        }
        let patched = self.put(&mut store, key.to_string(), obj);
        Json(patched).into_response()
    }

    fn delete(&self, key: &str) -> Response {
        let mut store = self.lock();
        let Some(mut obj) = store.objects.remove(key) else {
            return status_error(404, "NotFound", &format!("{key} not found"));
        };
        self.record(&mut store, key, "DELETED", &mut obj);
        Json(obj).into_response()
    }
}

async fn handle(State(shared): State<Shared>, method: Method, uri: Uri, body: Bytes) -> Response {
    let path = uri.path().to_string();
    let query = uri.query().unwrap_or_default().to_string();
    let injected = {
        let mut store = shared.lock();
        store.requests.push(format!("{method} {path}"));
        store.fail_next.remove(method.as_str())
    };
    if let Some(code) = injected {
        let reason = match (code, &method) {
            (409, &Method::POST) => "AlreadyExists",
            (409, _) => "Conflict",
            (404, _) => "NotFound",
            _ => "InternalError",
        };
        return status_error(code, reason, "injected failure");
    }
    let Some(target) = Target::parse(&path) else {
        return status_error(404, "NotFound", &format!("no route for {path}"));
    };
    match (&method, target) {
        (&Method::GET, Target::Collection(c)) if matches!(query_param(&query, "watch"), Some("true" | "1")) => {
            let since = query_param(&query, "resourceVersion").and_then(|v| v.parse().ok()).unwrap_or(0);
            shared.watch(c, since)
        }
        (&Method::GET, Target::Collection(c)) => shared.list(&c),
        (&Method::GET, Target::Object(k)) => shared.get(&k),
        (&Method::POST, Target::Collection(c)) => shared.create(&c, &body),
        (&Method::PUT, Target::Object(k)) => shared.replace(&k, &body),
        (&Method::PATCH, Target::Status(k)) => shared.patch_status(&k, &body),
        (&Method::DELETE, Target::Object(k)) => shared.delete(&k),
        _ => status_error(405, "MethodNotAllowed", &format!("{method} {path} is not supported")),
    }
}

/// API server bound to an ephemeral local port. Stops when dropped.
pub struct FakeApiServer {
    addr: SocketAddr,
    shared: Shared,
}

impl FakeApiServer {
    pub async fn start() -> Result<Self> {
        let (events, _) = broadcast::channel(1024);
        let shared = Shared { store: Arc::default(), events, stop: CancellationToken::new() };
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let router = Router::new().fallback(handle).with_state(shared.clone());
        let stop = shared.stop.clone();
        tokio::spawn(async move {
            let _ = axum::serve(listener, router).with_graceful_shutdown(stop.cancelled_owned()).await;
        });
        Ok(Self { addr, shared })
    }

    /// Client whose default namespace is `default`.
    pub fn client(&self) -> Result<kube::Client> {
        let url = format!("http://{}", self.addr).parse().map_err(|_| Error::Connection(format!("bad server address {}", self.addr)))?;
        kube::Client::try_from(kube::Config::new(url)).map_err(|e| Error::Connection(e.to_string()))
    }

    /// Stores `obj` under `collection`, replacing any object of the same name.
    pub fn seed(&self, collection: &str, obj: Value) -> Value {
        let name = obj["metadata"]["name"].as_str().unwrap_or_default().to_string();
        let mut store = self.shared.lock();
        self.shared.put(&mut store, format!("{collection}/{name}"), obj)
    }

    pub fn object(&self, path: &str) -> Option<Value> { self.shared.lock().objects.get(path).cloned() }

    /// Number of requests with `method` whose path ends with `suffix`.
    pub fn requests(&self, method: &str, suffix: &str) -> usize {
        let prefix = format!("{method} ");
        self.shared.lock().requests.iter().filter(|r| r.starts_with(&prefix) && r.ends_with(suffix)).count()
    }

    /// Answers the next `method` request with `code` instead of serving it.
    pub fn fail_next(&self, method: &str, code: u16) { self.shared.lock().fail_next.insert(method.to_string(), code); }
}

impl Drop for FakeApiServer {
    fn drop(&mut self) { self.shared.stop.cancel(); }
}
