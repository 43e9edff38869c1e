//! Registration records produced by route discovery

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// RPC type of plain HTTP services
pub const RPC_TYPE_HTTP: &str = "http";
/// RPC type of Spring Cloud services
pub const RPC_TYPE_SPRING_CLOUD: &str = "springCloud";

/// Whether routes of this RPC type are addressed by path rather than by
/// service and method
pub fn is_http_style(rpc_type: &str) -> bool {
    rpc_type == RPC_TYPE_HTTP || rpc_type == RPC_TYPE_SPRING_CLOUD
}

fn is_zero(port: &u16) -> bool {
    *port == 0
}

fn is_zero_millis(millis: &i64) -> bool {
    *millis == 0
}

/// Metadata of one routable endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetadataRecord {
    /// Application name, used when there is no context path
    #[serde(skip_serializing_if = "String::is_empty")]
    pub app_name: String,
    /// Context path the application is mounted on
    #[serde(skip_serializing_if = "String::is_empty")]
    pub context_path: String,
    /// Full route path
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path: String,
    /// Human readable description
    #[serde(skip_serializing_if = "String::is_empty")]
    pub path_desc: String,
    /// RPC type (`http`, `springCloud`, `dubbo`, `grpc`, ...)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub rpc_type: String,
    /// Service name (RPC-style types)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub service_name: String,
    /// Method name (RPC-style types)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub method_name: String,
    /// Rule name (HTTP-style types)
    #[serde(skip_serializing_if = "String::is_empty")]
    pub rule_name: String,
    /// Parameter types of the method
    #[serde(skip_serializing_if = "String::is_empty")]
    pub parameter_types: String,
    /// Extra RPC information
    #[serde(skip_serializing_if = "String::is_empty")]
    pub rpc_ext: String,
    /// Whether the route is enabled
    pub enabled: bool,
    /// Host serving the route
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host: String,
    /// Port serving the route
    #[serde(skip_serializing_if = "is_zero")]
    pub port: u16,
    /// Gateway plugins the route needs
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub plugin_names: Vec<String>,
    /// Whether the gateway should store the metadata
    pub register_meta_data: bool,
    /// Registration time in milliseconds since the epoch
    #[serde(skip_serializing_if = "is_zero_millis")]
    pub time_millis: i64,
}

impl MetadataRecord {
    /// Stamp the record with the current time if it carries none
    pub fn stamped(mut self) -> Self {
        if self.time_millis == 0 {
            self.time_millis = chrono::Utc::now().timestamp_millis();
        }
        self
    }

    /// Compact JSON with empty fields omitted
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Address of one listening service instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UriRecord {
    /// Application name, used when there is no context path
    #[serde(skip_serializing_if = "String::is_empty")]
    pub app_name: String,
    /// Context path the application is mounted on
    #[serde(skip_serializing_if = "String::is_empty")]
    pub context_path: String,
    /// RPC type
    #[serde(skip_serializing_if = "String::is_empty")]
    pub rpc_type: String,
    /// Protocol prefix, e.g. `http://`
    #[serde(skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    /// Host name or address
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host: String,
    /// Port
    #[serde(skip_serializing_if = "is_zero")]
    pub port: u16,
}

impl UriRecord {
    /// Record for an HTTP instance
    pub fn http(
        app_name: impl Into<String>,
        context_path: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            context_path: context_path.into(),
            rpc_type: RPC_TYPE_HTTP.to_string(),
            protocol: "http://".to_string(),
            host: host.into(),
            port,
        }
    }

    /// Compact JSON with empty fields omitted
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Routes of one application, as handed over by route discovery
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteSet {
    /// One record per route
    pub metadata: Vec<MetadataRecord>,
    /// One record per listening address
    pub uris: Vec<UriRecord>,
}

impl RouteSet {
    /// Load a route set from file (YAML by extension, JSON otherwise)
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = async_fs::read_to_string(path.as_ref()).await?;
        if crate::config::is_yaml(path.as_ref()) {
            Ok(serde_yaml::from_str(&contents)?)
        } else {
            Ok(serde_json::from_str(&contents)?)
        }
    }
}
