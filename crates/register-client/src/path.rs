//! Canonical registry key and node name construction
//!
//! Layout:
//!
//! ```text
//! /<root>/register/metadata/<rpcType>/<contextSegment>/<nodeName>
//! /<root>/register/uri/<rpcType>/<contextSegment>/<host>:<port>
//! ```
//!
//! Everything here is pure; invalid input is rejected with
//! [`Error::InvalidArgument`].

use crate::error::{Error, Result};
use crate::records::{MetadataRecord, UriRecord, is_http_style};
use coordination::CanonicalKey;
use std::fmt;

/// Joins the context and rule name of HTTP-style node names
pub const JOIN_TOKEN: char = '-';
/// Joins service and method of RPC-style node names
pub const DOT: char = '.';
/// Path separator
pub const SEPARATOR: char = '/';
/// Default root segment
pub const DEFAULT_ROOT: &str = "shenyu";

/// Which registration tree an entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Route metadata
    Metadata,
    /// Instance addresses
    Uri,
}

impl EntryKind {
    /// Path segment of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Metadata => "metadata",
            EntryKind::Uri => "uri",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds canonical keys under a configurable root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathBuilder {
    root: String,
}

impl Default for PathBuilder {
    fn default() -> Self {
        Self {
            root: DEFAULT_ROOT.to_string(),
        }
    }
}

impl PathBuilder {
    /// Builder rooted at `root` (surrounding separators are ignored)
    pub fn new(root: &str) -> Result<Self> {
        let root = root.trim_matches(SEPARATOR);
        if root.is_empty() || root.contains(SEPARATOR) {
            return Err(Error::InvalidConfiguration(format!(
                "root must be a single non-empty segment, got '{}'",
                root
            )));
        }
        Ok(Self {
            root: root.to_string(),
        })
    }

    /// Root segment
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Context as exactly one segment: the context path (or the application
    /// name when it is empty) without surrounding separators, encoded like
    /// rule names so distinct contexts never share a segment.
    pub fn build_context_segment(&self, context_path: &str, app_name: &str) -> Result<String> {
        let source = if context_path.is_empty() {
            app_name
        } else {
            context_path
        };
        let segment = encode_segment(source.trim_matches(SEPARATOR));
        if segment.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "no context: contextPath '{}', appName '{}'",
                context_path, app_name
            )));
        }
        Ok(segment)
    }

    /// Leaf name of a metadata entry.
    ///
    /// HTTP-style records join the context segment and the encoded rule
    /// name; RPC-style records join service and method with a dot.
    pub fn build_metadata_node_name(&self, record: &MetadataRecord) -> Result<String> {
        let name = if is_http_style(&record.rpc_type) {
            if record.rule_name.is_empty() {
                return Err(Error::InvalidArgument(format!(
                    "{} route without ruleName (path '{}')",
                    record.rpc_type, record.path
                )));
            }
            let context = self.build_context_segment(&record.context_path, &record.app_name)?;
            format!("{}{}{}", context, JOIN_TOKEN, encode_rule_name(&record.rule_name))
        } else {
            rpc_node_name(&record.service_name, &record.method_name)?
        };

        Ok(name
            .strip_prefix(SEPARATOR)
            .map(str::to_string)
            .unwrap_or(name))
    }

    /// `/<root>/register/<kind>/<rpcType>/<contextSegment>`
    pub fn build_parent_path(
        &self,
        kind: EntryKind,
        rpc_type: &str,
        context_segment: &str,
    ) -> Result<CanonicalKey> {
        if rpc_type.is_empty() {
            return Err(Error::InvalidArgument("empty rpcType".to_string()));
        }
        Ok(CanonicalKey::from_segments([
            self.root.as_str(),
            "register",
            kind.as_str(),
            rpc_type,
            context_segment,
        ])?)
    }

    /// Parent plus exactly one separator plus the node name
    pub fn build_real_node(&self, parent: &CanonicalKey, node_name: &str) -> Result<CanonicalKey> {
        Ok(parent.child(node_name)?)
    }

    /// `host:port`
    pub fn build_uri_node_name(&self, host: &str, port: u16) -> Result<String> {
        if host.is_empty() || host.contains(SEPARATOR) {
            return Err(Error::InvalidArgument(format!("invalid host '{}'", host)));
        }
        Ok(format!("{}:{}", host, port))
    }

    /// Full key of a metadata entry
    pub fn metadata_key(&self, record: &MetadataRecord) -> Result<CanonicalKey> {
        let context = self.build_context_segment(&record.context_path, &record.app_name)?;
        let parent = self.build_parent_path(EntryKind::Metadata, &record.rpc_type, &context)?;
        self.build_real_node(&parent, &self.build_metadata_node_name(record)?)
    }

    /// Full key of a URI entry
    pub fn uri_key(&self, record: &UriRecord) -> Result<CanonicalKey> {
        let context = self.build_context_segment(&record.context_path, &record.app_name)?;
        let parent = self.build_parent_path(EntryKind::Uri, &record.rpc_type, &context)?;
        self.build_real_node(&parent, &self.build_uri_node_name(&record.host, record.port)?)
    }

    /// Naming service name: `<root>.register.service.<rpcType>`
    pub fn build_service_instance_name(&self, rpc_type: &str) -> Result<String> {
        if rpc_type.is_empty() {
            return Err(Error::InvalidArgument("empty rpcType".to_string()));
        }
        Ok(format!("{}.register.service.{}", self.root, rpc_type))
    }

    /// Configuration name of a context's metadata set:
    /// `<root>.register.service.<rpcType>.<context>` with separators turned
    /// into dots, wildcards removed and no trailing dot
    pub fn build_service_config_name(&self, rpc_type: &str, context_path: &str) -> Result<String> {
        let base = self.build_service_instance_name(rpc_type)?;
        let context = context_path
            .trim_matches(SEPARATOR)
            .replace(SEPARATOR, &DOT.to_string())
            .replace('*', "");
        let name = format!("{}{}{}", base, DOT, context);
        Ok(name.trim_end_matches(DOT).to_string())
    }
}

/// Strip one leading separator, escape `%` and the join token, then turn
/// separators into the join token. Escaping keeps distinct rule names
/// distinct.
fn encode_rule_name(rule_name: &str) -> String {
    encode_segment(rule_name.strip_prefix(SEPARATOR).unwrap_or(rule_name))
}

// `%` and the join token are escaped first, so mapping separators onto the
// join token stays injective.
fn encode_segment(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => encoded.push_str("%25"),
            JOIN_TOKEN => encoded.push_str("%2D"),
            SEPARATOR => encoded.push(JOIN_TOKEN),
            other => encoded.push(other),
        }
    }
    encoded
}

fn rpc_node_name(service_name: &str, method_name: &str) -> Result<String> {
    if service_name.is_empty() || method_name.is_empty() {
        return Err(Error::InvalidArgument(format!(
            "RPC route needs serviceName and methodName, got '{}' / '{}'",
            service_name, method_name
        )));
    }
    if service_name.contains(SEPARATOR) || method_name.contains(SEPARATOR) {
        return Err(Error::InvalidArgument(format!(
            "'{}' in serviceName or methodName: {}.{}",
            SEPARATOR, service_name, method_name
        )));
    }
    if method_name.contains(DOT) {
        return Err(Error::InvalidArgument(format!(
            "'{}' in methodName '{}'",
            DOT, method_name
        )));
    }
    Ok(format!("{}{}{}", service_name, DOT, method_name))
}

/// Normalize a name for DNS-based registries (Consul service ids).
///
/// The name must start with an ASCII letter and end with an ASCII letter or
/// digit; every run of other characters becomes a single `-`.
pub fn normalize_for_dns(name: &str) -> Result<String> {
    let starts_ok = name.chars().next().is_some_and(|c| c.is_ascii_alphabetic());
    let ends_ok = name.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
    if !starts_ok || !ends_ok {
        return Err(Error::InvalidArgument(format!(
            "service ids must start with a letter and end with a letter or digit: '{}'",
            name
        )));
    }

    let mut normalized = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            normalized.push(c);
        } else if !normalized.ends_with(JOIN_TOKEN) {
            normalized.push(JOIN_TOKEN);
        }
    }
    Ok(normalized)
}
