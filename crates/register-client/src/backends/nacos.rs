//! Nacos open API (v1)

use super::{NamingApi, ServiceInstance, send_with_failover};
use crate::error::{Error, Result};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, Method, base_url};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{info, warn};

const LOGIN_PATH: &str = "/nacos/v1/auth/login";
const INSTANCE_PATH: &str = "/nacos/v1/ns/instance";
const BEAT_PATH: &str = "/nacos/v1/ns/instance/beat";
const CONFIG_PATH: &str = "/nacos/v1/cs/configs";

/// Beat answer code for an instance the server does not know
const RESOURCE_NOT_FOUND: i64 = 20404;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    access_token: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BeatResponse {
    code: i64,
}

/// Nacos naming and configuration client
pub struct NacosClient {
    servers: Vec<String>,
    namespace: String,
    group: String,
    heartbeat_interval: Duration,
    credentials: Option<(String, String)>,
    token: Mutex<Option<String>>,
    transport: Arc<dyn HttpTransport>,
}

impl NacosClient {
    /// Client for the given server addresses
    pub fn new(servers: Vec<String>, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        if servers.is_empty() {
            return Err(Error::InvalidConfiguration("no Nacos servers".to_string()));
        }
        Ok(Self {
            servers: servers.iter().map(|s| base_url(s)).collect(),
            namespace: String::new(),
            group: "DEFAULT_GROUP".to_string(),
            heartbeat_interval: Duration::from_secs(5),
            credentials: None,
            token: Mutex::new(None),
            transport,
        })
    }

    /// Namespace (tenant) id; empty for the public namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Group of services and configurations
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Heartbeat interval of ephemeral instances
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Log in with these credentials before calling the API
    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.credentials = match username {
            Some(user) if !user.is_empty() => Some((user, password.unwrap_or_default())),
            _ => None,
        };
        self
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

    async fn access_token(&self) -> Result<Option<String>> {
        if self.credentials.is_none() {
            return Ok(None);
        }
        if let Some(token) = self.cached_token() {
            return Ok(Some(token));
        }
        self.login().await?;
        Ok(self.cached_token())
    }

    fn common_params(&self, instance: &ServiceInstance) -> Vec<(String, String)> {
        let mut params = vec![
            ("serviceName".to_string(), instance.service_name.clone()),
            ("groupName".to_string(), self.group.clone()),
            ("ip".to_string(), instance.ip.clone()),
            ("port".to_string(), instance.port.to_string()),
            ("ephemeral".to_string(), instance.ephemeral.to_string()),
        ];
        if !self.namespace.is_empty() {
            params.push(("namespaceId".to_string(), self.namespace.clone()));
        }
        params
    }

    /// Call the API on the first answering server; a rejected token is
    /// refreshed once
    async fn call(
        &self,
        method: Method,
        path: &str,
        params: Vec<(String, String)>,
        form: bool,
    ) -> Result<HttpResponse> {
        let mut refreshed = false;
        loop {
            let token = self.access_token().await?;
            let response = send_with_failover(self.transport.as_ref(), &self.servers, |server| {
                let mut request = HttpRequest::new(method, format!("{}{}", server, path));
                if form {
                    request = request.form(params.clone());
                } else {
                    request.query = params.clone();
                }
                match &token {
                    Some(token) => request.query("accessToken", token.clone()),
                    None => request,
                }
            })
            .await?;

            if response.is_auth_failure() && token.is_some() && !refreshed {
                warn!("Nacos rejected the access token, logging in again");
                self.store_token(None);
                refreshed = true;
                continue;
            }
            if response.is_auth_failure() {
                return Err(Error::AuthenticationFailed(format!(
                    "Nacos answered {} on {}",
                    response.status, path
                )));
            }
            return Ok(response);
        }
    }
}

#[async_trait]
impl NamingApi for NacosClient {
    fn name(&self) -> &'static str {
        "nacos"
    }

    async fn login(&self) -> Result<()> {
        let Some((user, password)) = &self.credentials else {
            return Ok(());
        };
        let fields = vec![
            ("username".to_string(), user.clone()),
            ("password".to_string(), password.clone()),
        ];
        let response = send_with_failover(self.transport.as_ref(), &self.servers, |server| {
            HttpRequest::post(format!("{}{}", server, LOGIN_PATH)).form(fields.clone())
        })
        .await?;
        if !response.is_success() {
            return Err(Error::AuthenticationFailed(format!(
                "Nacos login as '{}' answered {}",
                user, response.status
            )));
        }
        let login: LoginResponse = response.json()?;
        info!("Logged in to Nacos as '{}'", user);
        self.store_token(Some(login.access_token));
        Ok(())
    }

    async fn register_instance(&self, instance: &ServiceInstance) -> Result<()> {
        let mut params = self.common_params(instance);
        params.extend([
            ("enabled".to_string(), "true".to_string()),
            ("healthy".to_string(), "true".to_string()),
            ("weight".to_string(), "1.0".to_string()),
            ("metadata".to_string(), serde_json::to_string(&instance.metadata)?),
        ]);
        self.call(Method::Post, INSTANCE_PATH, params, false)
            .await?
            .error_for_status(INSTANCE_PATH)?;
        info!(
            "Registered {}:{} as {} with Nacos",
            instance.ip, instance.port, instance.service_name
        );
        Ok(())
    }

    async fn deregister_instance(&self, instance: &ServiceInstance) -> Result<()> {
        let params = self.common_params(instance);
        self.call(Method::Delete, INSTANCE_PATH, params, false)
            .await?
            .error_for_status(INSTANCE_PATH)?;
        info!(
            "Deregistered {}:{} from {}",
            instance.ip, instance.port, instance.service_name
        );
        Ok(())
    }

    fn heartbeat_interval(&self) -> Option<Duration> {
        Some(self.heartbeat_interval)
    }

    async fn heartbeat(&self, instance: &ServiceInstance) -> Result<bool> {
        let beat = json!({
            "serviceName": format!("{}@@{}", self.group, instance.service_name),
            "ip": instance.ip,
            "port": instance.port,
            "cluster": "DEFAULT",
            "weight": 1.0,
            "metadata": instance.metadata,
        });
        let mut params = self.common_params(instance);
        params.push(("beat".to_string(), beat.to_string()));

        let response = self.call(Method::Put, BEAT_PATH, params, false).await?;
        if response.status == 404 {
            return Ok(false);
        }
        let response = response.error_for_status(BEAT_PATH)?;
        let beat: BeatResponse = response.json().unwrap_or_default();
        Ok(beat.code != RESOURCE_NOT_FOUND)
    }

    async fn publish_config(&self, name: &str, content: &str) -> Result<()> {
        let mut fields = vec![
            ("dataId".to_string(), name.to_string()),
            ("group".to_string(), self.group.clone()),
            ("content".to_string(), content.to_string()),
            ("type".to_string(), "json".to_string()),
        ];
        if !self.namespace.is_empty() {
            fields.push(("tenant".to_string(), self.namespace.clone()));
        }
        let response = self
            .call(Method::Post, CONFIG_PATH, fields, true)
            .await?
            .error_for_status(CONFIG_PATH)?;
        if response.body.trim() != "true" {
            return Err(Error::Protocol(format!(
                "Nacos refused config '{}': {}",
                name, response.body
            )));
        }
        Ok(())
    }
}
