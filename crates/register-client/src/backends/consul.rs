//! Consul agent and KV API

use super::{NamingApi, ServiceInstance, send_with_failover};
use crate::error::{Error, Result};
use crate::path::normalize_for_dns;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, base_url};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

const TOKEN_HEADER: &str = "X-Consul-Token";

/// Consul agent client
pub struct ConsulClient {
    servers: Vec<String>,
    token: Option<String>,
    transport: Arc<dyn HttpTransport>,
}

impl ConsulClient {
    /// Client for the given agent addresses
    pub fn new(servers: Vec<String>, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        if servers.is_empty() {
            return Err(Error::InvalidConfiguration("no Consul agents".to_string()));
        }
        Ok(Self {
            servers: servers.iter().map(|s| base_url(s)).collect(),
            token: None,
            transport,
        })
    }

    /// ACL token sent with every request
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    async fn send<F>(&self, path: &str, build: F) -> Result<HttpResponse>
    where
        F: Fn(String) -> HttpRequest,
    {
        let response = send_with_failover(self.transport.as_ref(), &self.servers, |server| {
            let request = build(format!("{}{}", server, path));
            match &self.token {
                Some(token) => request.header(TOKEN_HEADER, token.clone()),
                None => request,
            }
        })
        .await?;
        if response.is_auth_failure() {
            return Err(Error::AuthenticationFailed(format!(
                "Consul answered {} on {}: {}",
                response.status, path, response.body
            )));
        }
        response.error_for_status(path)
    }
}

#[async_trait]
impl NamingApi for ConsulClient {
    fn name(&self) -> &'static str {
        "consul"
    }

    async fn register_instance(&self, instance: &ServiceInstance) -> Result<()> {
        let body = json!({
            "ID": normalize_for_dns(&instance.instance_id)?,
            "Name": normalize_for_dns(&instance.service_name)?,
            "Tags": instance.tags,
            "Address": instance.ip,
            "Port": instance.port,
            "Meta": instance.metadata,
            "EnableTagOverride": instance.enable_tag_override,
        });
        self.send("/v1/agent/service/register", |url| {
            HttpRequest::put(url).json(body.clone())
        })
        .await?;
        info!(
            "Registered {}:{} as {} with Consul",
            instance.ip, instance.port, instance.instance_id
        );
        Ok(())
    }

    async fn deregister_instance(&self, instance: &ServiceInstance) -> Result<()> {
        let id = normalize_for_dns(&instance.instance_id)?;
        let path = format!("/v1/agent/service/deregister/{}", id);
        self.send(&path, |url| HttpRequest::put(url)).await?;
        info!("Deregistered {} from Consul", id);
        Ok(())
    }

    async fn publish_config(&self, name: &str, content: &str) -> Result<()> {
        let path = format!("/v1/kv/{}", name);
        let response = self
            .send(&path, |url| HttpRequest::put(url).text(content))
            .await?;
        if response.body.trim() != "true" {
            return Err(Error::Protocol(format!(
                "Consul refused key '{}': {}",
                name, response.body
            )));
        }
        Ok(())
    }
}
