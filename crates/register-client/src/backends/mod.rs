//! Concrete store and naming service clients
//!
//! [`etcd`] plugs into the coordination client as a leased key-value store.
//! [`nacos`] and [`consul`] implement [`NamingApi`] for the
//! service-registry adapter.

pub mod consul;
pub mod etcd;
pub mod nacos;

use crate::error::{Error, Result};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// One instance registered with a naming service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    /// Service the instance belongs to
    pub service_name: String,
    /// Unique id (Consul service id)
    pub instance_id: String,
    /// Address
    pub ip: String,
    /// Port
    pub port: u16,
    /// Whether the instance disappears without heartbeats
    pub ephemeral: bool,
    /// Free-form metadata
    pub metadata: BTreeMap<String, String>,
    /// Tags (Consul)
    pub tags: Vec<String>,
    /// Consul `EnableTagOverride`
    pub enable_tag_override: bool,
}

/// Naming and configuration operations of a service registry
#[async_trait]
pub trait NamingApi: Send + Sync {
    /// Registry name for logs
    fn name(&self) -> &'static str;

    /// Acquire credentials; a no-op without configured credentials
    async fn login(&self) -> Result<()> {
        Ok(())
    }

    /// Register (or re-register) an instance
    async fn register_instance(&self, instance: &ServiceInstance) -> Result<()>;

    /// Remove an instance
    async fn deregister_instance(&self, instance: &ServiceInstance) -> Result<()>;

    /// How often [`heartbeat`](Self::heartbeat) must be called, if at all
    fn heartbeat_interval(&self) -> Option<Duration> {
        None
    }

    /// Refresh an ephemeral instance; `false` if the registry no longer
    /// knows it and it must be registered again
    async fn heartbeat(&self, _instance: &ServiceInstance) -> Result<bool> {
        Ok(true)
    }

    /// Store a configuration blob under `name`
    async fn publish_config(&self, name: &str, content: &str) -> Result<()>;
}

/// Send a request to each server in turn until one answers.
///
/// Transport failures and 5xx answers move on to the next server; the last
/// failure is returned when none answers. Any other response is returned
/// as is.
pub(crate) async fn send_with_failover<F>(
    transport: &dyn HttpTransport,
    servers: &[String],
    build: F,
) -> Result<HttpResponse>
where
    F: Fn(&str) -> HttpRequest,
{
    let mut last_error = Error::InvalidConfiguration("no servers configured".to_string());
    for server in servers {
        let request = build(server);
        let url = request.url.clone();
        match transport.send(request).await {
            Ok(response) if response.status >= 500 => {
                debug!("{} answered {}, trying next server", url, response.status);
                last_error = Error::Http {
                    status: response.status,
                    url,
                    body: response.body,
                };
            }
            Ok(response) => return Ok(response),
            Err(e) => {
                debug!("{} unreachable, trying next server: {}", url, e);
                last_error = e;
            }
        }
    }
    Err(last_error)
}
