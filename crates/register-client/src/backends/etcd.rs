//! etcd v3 over its JSON gateway
//!
//! Keys and values travel base64 encoded; 64-bit integers come back as
//! strings.

use crate::error::{Error, Result};
use crate::transport::{HttpRequest, HttpTransport, base_url};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use coordination::backend::lease::{KvStore, LeaseId};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// [`KvStore`] speaking to an etcd cluster through its JSON gateway
pub struct EtcdKvStore {
    servers: Vec<String>,
    current: AtomicUsize,
    credentials: Option<(String, String)>,
    token: Mutex<Option<String>>,
    transport: Arc<dyn HttpTransport>,
}

impl EtcdKvStore {
    /// Store over the given member addresses
    pub fn new(servers: Vec<String>, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        if servers.is_empty() {
            return Err(Error::InvalidConfiguration("no etcd servers".to_string()));
        }
        Ok(Self {
            servers: servers.iter().map(|s| base_url(s)).collect(),
            current: AtomicUsize::new(0),
            credentials: None,
            token: Mutex::new(None),
            transport,
        })
    }

    /// Authenticate as `username` before the first call
    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.credentials = match username {
            Some(user) if !user.is_empty() => Some((user, password.unwrap_or_default())),
            _ => None,
        };
        self
    }

    fn server(&self) -> &str {
        let index = self.current.load(Ordering::SeqCst) % self.servers.len();
        &self.servers[index]
    }

    fn rotate(&self) {
        if self.servers.len() > 1 {
            let next = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            debug!("Switching to etcd member {}", self.servers[next % self.servers.len()]);
        }
    }

    fn cached_token(&self) -> Option<String> {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn store_token(&self, token: Option<String>) {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = token;
    }

    async fn authenticate(&self) -> Result<Option<String>> {
        let Some((user, password)) = &self.credentials else {
            return Ok(None);
        };
        if let Some(token) = self.cached_token() {
            return Ok(Some(token));
        }

        let url = format!("{}/v3/auth/authenticate", self.server());
        let response = self
            .transport
            .send(HttpRequest::post(&url).json(json!({ "name": user, "password": password })))
            .await
            .inspect_err(|_| self.rotate())?;
        if !response.is_success() {
            return Err(Error::AuthenticationFailed(format!(
                "etcd rejected user '{}': {}",
                user, response.body
            )));
        }
        let body: Value = response.json()?;
        let token = body
            .get("token")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Protocol("authenticate response without token".to_string()))?
            .to_string();
        info!("Authenticated with etcd as '{}'", user);
        self.store_token(Some(token.clone()));
        Ok(Some(token))
    }

    /// POST `body` to `path`, authenticating first when configured. A
    /// rejected token is refreshed once.
    async fn call(&self, path: &str, body: Value) -> Result<Value> {
        let mut refreshed = false;
        loop {
            let token = self.authenticate().await?;
            let url = format!("{}{}", self.server(), path);
            let mut request = HttpRequest::post(&url).json(body.clone());
            if let Some(token) = &token {
                request = request.header("Authorization", token.clone());
            }

            let response = self
                .transport
                .send(request)
                .await
                .inspect_err(|_| self.rotate())?;
            if response.is_success() {
                return response.json();
            }

            if response.body.contains("lease not found") {
                return Err(coordination::Error::SessionExpired.into());
            }
            let token_rejected = response.is_auth_failure() || response.body.contains("invalid auth token");
            if token_rejected && token.is_some() && !refreshed {
                warn!("etcd rejected the auth token, authenticating again");
                self.store_token(None);
                refreshed = true;
                continue;
            }
            if response.status >= 500 {
                self.rotate();
            }
            return Err(response.error_for_status(&url).err().unwrap_or_else(|| {
                Error::Protocol(format!("unexpected response from {}", url))
            }));
        }
    }

    async fn range(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let body = self.call("/v3/kv/range", json!({ "key": encode(key) })).await?;
        let kvs = body.get("kvs").and_then(Value::as_array);
        match kvs.and_then(|kvs| kvs.first()) {
            None => Ok(None),
            Some(kv) => {
                let value = kv.get("value").and_then(Value::as_str).unwrap_or("");
                Ok(Some(decode(value)?))
            }
        }
    }
}

fn encode(data: impl AsRef<[u8]>) -> String {
    STANDARD.encode(data)
}

fn decode(data: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(data)
        .map_err(|e| Error::Protocol(format!("invalid base64 from etcd: {}", e)))
}

/// int64 fields arrive as strings, sometimes as numbers
fn int_field(value: &Value, field: &str) -> Option<i64> {
    match value.get(field)? {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

/// Smallest key greater than every key starting with `prefix`
fn prefix_range_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    // Every byte was 0xff: range to the end of the keyspace
    vec![0]
}

#[async_trait]
impl KvStore for EtcdKvStore {
    async fn grant(&self, ttl: Duration) -> coordination::Result<LeaseId> {
        let body = self
            .call("/v3/lease/grant", json!({ "TTL": ttl.as_secs().max(1) }))
            .await?;
        let id = int_field(&body, "ID")
            .ok_or_else(|| Error::Protocol(format!("lease grant without ID: {}", body)))?;
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> coordination::Result<bool> {
        let body = self.call("/v3/lease/keepalive", json!({ "ID": lease })).await?;
        let result = body.get("result").unwrap_or(&body);
        // An unknown lease comes back without a positive TTL
        Ok(int_field(result, "TTL").is_some_and(|ttl| ttl > 0))
    }

    async fn revoke(&self, lease: LeaseId) -> coordination::Result<()> {
        self.call("/v3/lease/revoke", json!({ "ID": lease })).await?;
        Ok(())
    }

    async fn put(&self, key: &str, value: &[u8], lease: Option<LeaseId>) -> coordination::Result<()> {
        let mut body = json!({ "key": encode(key), "value": encode(value) });
        if let Some(lease) = lease {
            body["lease"] = json!(lease);
        }
        self.call("/v3/kv/put", body).await?;
        Ok(())
    }

    async fn update(&self, key: &str, value: &[u8]) -> coordination::Result<bool> {
        if self.range(key).await?.is_none() {
            return Ok(false);
        }
        let body = json!({ "key": encode(key), "value": encode(value), "ignore_lease": true });
        match self.call("/v3/kv/put", body).await {
            Ok(_) => Ok(true),
            // Deleted between the read and the write
            Err(Error::Http { body, .. }) if body.contains("key not found") => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, key: &str) -> coordination::Result<Option<Vec<u8>>> {
        Ok(self.range(key).await?)
    }

    async fn delete(&self, key: &str) -> coordination::Result<bool> {
        let body = self
            .call("/v3/kv/deleterange", json!({ "key": encode(key) }))
            .await?;
        Ok(int_field(&body, "deleted").unwrap_or(0) > 0)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> coordination::Result<Vec<String>> {
        let body = self
            .call(
                "/v3/kv/range",
                json!({
                    "key": encode(prefix),
                    "range_end": encode(prefix_range_end(prefix)),
                    "keys_only": true,
                }),
            )
            .await?;
        let mut keys = Vec::new();
        for kv in body.get("kvs").and_then(Value::as_array).into_iter().flatten() {
            let raw = decode(kv.get("key").and_then(Value::as_str).unwrap_or(""))?;
            let key = String::from_utf8(raw)
                .map_err(|e| Error::Protocol(format!("non UTF-8 key from etcd: {}", e)))?;
            keys.push(key);
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_range_end() {
        assert_eq!(prefix_range_end("/shenyu/"), b"/shenyu0".to_vec());
        assert_eq!(prefix_range_end("a"), b"b".to_vec());
        assert_eq!(prefix_range_end(""), vec![0]);
    }

    #[test]
    fn test_int_fields_accept_strings_and_numbers() {
        let body = json!({ "ID": "7587862073641826859", "TTL": 30, "bad": true });
        assert_eq!(int_field(&body, "ID"), Some(7587862073641826859));
        assert_eq!(int_field(&body, "TTL"), Some(30));
        assert_eq!(int_field(&body, "bad"), None);
        assert_eq!(int_field(&body, "missing"), None);
    }

    #[test]
    fn test_base64_round_trip() {
        let encoded = encode("/shenyu/register/uri/http/orders/10.0.0.1:8080");
        assert_eq!(
            decode(&encoded).unwrap(),
            b"/shenyu/register/uri/http/orders/10.0.0.1:8080".to_vec()
        );
        assert!(decode("***").is_err());
    }
}
