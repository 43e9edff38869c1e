//! Common test utilities for registration client integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use register_client::transport::{Body, HttpRequest, HttpResponse, HttpTransport};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

type Handler = Box<dyn Fn(&HttpRequest) -> register_client::Result<HttpResponse> + Send + Sync>;

/// Transport answering from a closure and recording every request
pub struct ScriptedTransport {
    requests: Mutex<Vec<HttpRequest>>,
    handler: Handler,
}

impl ScriptedTransport {
    /// Transport answering every request with `handler`
    pub fn new<F>(handler: F) -> Arc<Self>
    where
        F: Fn(&HttpRequest) -> register_client::Result<HttpResponse> + Send + Sync + 'static,
    {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            handler: Box::new(handler),
        })
    }

    /// Every request sent so far
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    /// Requests whose URL ends with `suffix`
    pub fn requests_to(&self, suffix: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url.ends_with(suffix))
            .collect()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> register_client::Result<HttpResponse> {
        self.requests.lock().expect("requests lock").push(request.clone());
        (self.handler)(&request)
    }
}

/// JSON body of a request
pub fn json_body(request: &HttpRequest) -> Value {
    match &request.body {
        Body::Json(value) => value.clone(),
        other => panic!("expected a JSON body, got {:?}", other),
    }
}

#[derive(Default)]
struct EtcdState {
    kv: BTreeMap<String, (String, Option<i64>)>,
    leases: BTreeSet<i64>,
    next_lease: i64,
}

/// Minimal etcd JSON gateway: leases, put, range, deleterange
#[derive(Clone, Default)]
pub struct FakeEtcd {
    state: Arc<Mutex<EtcdState>>,
}

fn decode(value: &Value) -> String {
    let raw = STANDARD
        .decode(value.as_str().expect("base64 string"))
        .expect("valid base64");
    String::from_utf8(raw).expect("utf-8")
}

impl FakeEtcd {
    /// Value stored under `key`
    pub fn value(&self, key: &str) -> Option<String> {
        self.state.lock().expect("etcd lock").kv.get(key).map(|(v, _)| v.clone())
    }

    /// Lease attached to `key`
    pub fn lease_of(&self, key: &str) -> Option<i64> {
        self.state.lock().expect("etcd lock").kv.get(key).and_then(|(_, l)| *l)
    }

    /// Live leases
    pub fn leases(&self) -> Vec<i64> {
        self.state.lock().expect("etcd lock").leases.iter().copied().collect()
    }

    /// Drop a lease and its keys
    pub fn expire(&self, lease: i64) {
        let mut state = self.state.lock().expect("etcd lock");
        state.leases.remove(&lease);
        state.kv.retain(|_, (_, l)| *l != Some(lease));
    }

    /// Answer one gateway request
    pub fn handle(&self, request: &HttpRequest) -> HttpResponse {
        let body = json_body(request);
        let mut state = self.state.lock().expect("etcd lock");
        let path = request.url.rsplit_once("/v3/").map(|(_, p)| p).unwrap_or("");
        let lease_not_found = || {
            HttpResponse::new(
                404,
                json!({"error": "etcdserver: requested lease not found", "code": 5}).to_string(),
            )
        };

        match path {
            "lease/grant" => {
                state.next_lease += 1;
                let id = state.next_lease;
                state.leases.insert(id);
                HttpResponse::new(200, json!({"ID": id.to_string(), "TTL": body["TTL"].to_string()}).to_string())
            }
            "lease/keepalive" => {
                let id: i64 = body["ID"].as_i64().expect("lease id");
                let ttl = if state.leases.contains(&id) { "30" } else { "0" };
                HttpResponse::new(200, json!({"result": {"ID": id.to_string(), "TTL": ttl}}).to_string())
            }
            "lease/revoke" => {
                let id: i64 = body["ID"].as_i64().expect("lease id");
                if !state.leases.remove(&id) {
                    return lease_not_found();
                }
                state.kv.retain(|_, (_, l)| *l != Some(id));
                HttpResponse::new(200, "{}")
            }
            "kv/put" => {
                let key = decode(&body["key"]);
                let value = decode(&body["value"]);
                let lease = if body["ignore_lease"].as_bool() == Some(true) {
                    state.kv.get(&key).and_then(|(_, l)| *l)
                } else {
                    body["lease"].as_i64()
                };
                if let Some(id) = lease {
                    if !state.leases.contains(&id) {
                        return lease_not_found();
                    }
                }
                state.kv.insert(key, (value, lease));
                HttpResponse::new(200, "{}")
            }
            "kv/range" => {
                let key = decode(&body["key"]);
                let kvs: Vec<Value> = if body.get("range_end").is_some() {
                    state
                        .kv
                        .iter()
                        .filter(|(k, _)| k.starts_with(&key))
                        .map(|(k, _)| json!({"key": STANDARD.encode(k)}))
                        .collect()
                } else {
                    state
                        .kv
                        .get(&key)
                        .map(|(v, _)| json!({"key": STANDARD.encode(&key), "value": STANDARD.encode(v)}))
                        .into_iter()
                        .collect()
                };
                HttpResponse::new(200, json!({"kvs": kvs, "count": kvs.len().to_string()}).to_string())
            }
            "kv/deleterange" => {
                let key = decode(&body["key"]);
                let deleted = usize::from(state.kv.remove(&key).is_some());
                HttpResponse::new(200, json!({"deleted": deleted.to_string()}).to_string())
            }
            other => HttpResponse::new(404, format!("unknown endpoint {}", other)),
        }
    }
}
