//! Registration client configuration

use crate::error::{Error, Result};
use crate::path::{DEFAULT_ROOT, PathBuilder};
use coordination::RegistryEndpoint;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Backend family to register with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RegisterType {
    /// ZooKeeper-like hierarchical store
    Tree,
    /// Leased key-value store (etcd)
    KvLease,
    /// Naming/configuration service (Nacos, Consul)
    ServiceRegistry,
    /// Gateway admin HTTP API
    Http,
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterConfig {
    /// Backend family
    pub register_type: RegisterType,
    /// Comma separated server addresses
    pub server_list: String,
    /// Optional user name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Optional password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Root segment of every key
    #[serde(default = "default_root")]
    pub root: String,
    /// Timeouts
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Lease settings (kv-lease)
    #[serde(default)]
    pub lease: LeaseConfig,
    /// Naming service settings (service-registry)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_registry: Option<ServiceRegistryConfig>,
    /// Control-plane settings (http)
    #[serde(default)]
    pub http: HttpConfig,
    /// Extra key/value pairs attached to registered instances
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
}

fn default_root() -> String {
    DEFAULT_ROOT.to_string()
}

/// Timeouts in milliseconds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutConfig {
    /// Budget for establishing a session
    pub connection_ms: u64,
    /// Session timeout requested from the store
    pub session_ms: u64,
    /// Budget for one operation across all retries
    pub operation_ms: u64,
    /// Pause between retries
    pub retry_interval_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connection_ms: 3000,
            session_ms: 3000,
            operation_ms: 1000,
            retry_interval_ms: 100,
        }
    }
}

/// Lease settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeaseConfig {
    /// Lease time to live in seconds
    pub ttl_secs: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self { ttl_secs: 30 }
    }
}

/// Naming service flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistryFlavor {
    /// Nacos open API
    Nacos,
    /// Consul agent API
    Consul,
}

/// Naming service settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRegistryConfig {
    /// Which naming service
    pub flavor: RegistryFlavor,
    /// Nacos namespace
    #[serde(default)]
    pub namespace: String,
    /// Nacos group
    #[serde(default = "default_group")]
    pub group: String,
    /// Instance id (Consul service id); generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    /// Service name (Consul)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,
    /// Nacos heartbeat interval
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    /// Consul `EnableTagOverride`
    #[serde(default)]
    pub enable_tag_override: bool,
    /// Consul ACL token
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

fn default_group() -> String {
    "DEFAULT_GROUP".to_string()
}

fn default_heartbeat_ms() -> u64 {
    5000
}

/// Control-plane settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpConfig {
    /// Token endpoint
    pub login_path: String,
    /// Metadata registration endpoint
    pub metadata_path: String,
    /// URI registration endpoint
    pub uri_path: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            login_path: "/platform/login".to_string(),
            metadata_path: "/register/metadata".to_string(),
            uri_path: "/register/uri".to_string(),
        }
    }
}

pub(crate) fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    )
}

impl RegisterConfig {
    /// Minimal configuration for `register_type` against `server_list`
    pub fn new(register_type: RegisterType, server_list: impl Into<String>) -> Self {
        Self {
            register_type,
            server_list: server_list.into(),
            username: None,
            password: None,
            root: default_root(),
            timeouts: TimeoutConfig::default(),
            lease: LeaseConfig::default(),
            service_registry: None,
            http: HttpConfig::default(),
            tags: BTreeMap::new(),
        }
    }

    /// Load configuration from file
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = async_fs::read_to_string(path.as_ref()).await?;

        // YAML by extension, JSON otherwise
        let config: Self = if is_yaml(path.as_ref()) {
            serde_yaml::from_str(&contents)?
        } else {
            serde_json::from_str(&contents)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.servers().is_empty() {
            return Err(Error::InvalidConfiguration("serverList is empty".to_string()));
        }
        if self.password.is_some() && self.username.as_deref().unwrap_or("").is_empty() {
            return Err(Error::InvalidConfiguration(
                "password given without username".to_string(),
            ));
        }
        PathBuilder::new(&self.root)?;

        let t = &self.timeouts;
        if t.connection_ms == 0 || t.operation_ms == 0 || t.retry_interval_ms == 0 {
            return Err(Error::InvalidConfiguration(
                "timeouts must be positive".to_string(),
            ));
        }

        match self.register_type {
            RegisterType::KvLease if self.lease.ttl_secs == 0 => Err(Error::InvalidConfiguration(
                "lease.ttlSecs must be positive".to_string(),
            )),
            RegisterType::ServiceRegistry => match &self.service_registry {
                None => Err(Error::InvalidConfiguration(
                    "serviceRegistry section is required".to_string(),
                )),
                Some(registry) if registry.heartbeat_ms == 0 => Err(Error::InvalidConfiguration(
                    "serviceRegistry.heartbeatMs must be positive".to_string(),
                )),
                Some(_) => Ok(()),
            },
            RegisterType::Http => {
                for path in [&self.http.login_path, &self.http.metadata_path, &self.http.uri_path] {
                    if !path.starts_with('/') {
                        return Err(Error::InvalidConfiguration(format!(
                            "http paths must start with '/': {}",
                            path
                        )));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Server addresses, trimmed, empty entries dropped
    pub fn servers(&self) -> Vec<String> {
        self.server_list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Key builder for the configured root
    pub fn path_builder(&self) -> Result<PathBuilder> {
        PathBuilder::new(&self.root)
    }

    /// Coordination endpoint for session-based backends
    pub fn endpoint(&self) -> Result<RegistryEndpoint> {
        Ok(RegistryEndpoint::new(&self.server_list)?
            .with_credentials(self.username.clone(), self.password.clone())
            .with_connection_timeout(Duration::from_millis(self.timeouts.connection_ms))
            .with_session_timeout(Duration::from_millis(self.timeouts.session_ms))
            .with_operation_timeout(Duration::from_millis(self.timeouts.operation_ms))
            .with_retry_interval(Duration::from_millis(self.timeouts.retry_interval_ms)))
    }

    /// Lease time to live
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease.ttl_secs)
    }
}
