//! Adapter posting records to the gateway admin HTTP API

use super::RegistrationAdapter;
use crate::config::{HttpConfig, RegisterType};
use crate::error::{Error, Result};
use crate::records::{MetadataRecord, UriRecord};
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, base_url};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

const TOKEN_HEADER: &str = "X-Access-Token";

/// Posts every record to every configured admin server.
///
/// Tokens are cached per server. A request rejected with 401/403 gets one
/// fresh token and one retry.
pub struct HttpAdapter {
    servers: Vec<String>,
    paths: HttpConfig,
    credentials: Option<(String, String)>,
    tokens: Mutex<HashMap<String, String>>,
    transport: Arc<dyn HttpTransport>,
    closed: AtomicBool,
}

impl HttpAdapter {
    /// Adapter for the given admin servers
    pub fn new(servers: Vec<String>, paths: HttpConfig, transport: Arc<dyn HttpTransport>) -> Result<Self> {
        if servers.is_empty() {
            return Err(Error::InvalidConfiguration("no admin servers".to_string()));
        }
        Ok(Self {
            servers: servers.iter().map(|s| base_url(s)).collect(),
            paths,
            credentials: None,
            tokens: Mutex::new(HashMap::new()),
            transport,
            closed: AtomicBool::new(false),
        })
    }

    /// Authenticate with these credentials
    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.credentials = match username {
            Some(user) if !user.is_empty() => Some((user, password.unwrap_or_default())),
            _ => None,
        };
        self
    }

    /// Acquire a token from every server. Failures are logged; the token is
    /// requested again on first use.
    pub async fn login_all(&self) {
        if self.credentials.is_none() {
            return;
        }
        for server in &self.servers {
            if let Err(e) = self.login(server).await {
                warn!("Login to {} failed: {}", server, e);
            }
        }
    }

    /// Cached token of a server (as configured, without scheme defaults
    /// applied)
    pub fn cached_token(&self, server: &str) -> Option<String> {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&base_url(server))
            .cloned()
    }

    fn forget_token(&self, server: &str) {
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(server);
    }

    async fn login(&self, server: &str) -> Result<Option<String>> {
        let Some((user, password)) = &self.credentials else {
            return Ok(None);
        };
        let url = format!("{}{}", server, self.paths.login_path);
        let response = self
            .transport
            .send(
                HttpRequest::get(&url)
                    .query("userName", user.clone())
                    .query("password", password.clone()),
            )
            .await?;
        if !response.is_success() {
            return Err(Error::AuthenticationFailed(format!(
                "{} answered {} for user '{}'",
                url, response.status, user
            )));
        }
        let token = extract_token(&response.json()?).ok_or_else(|| {
            Error::AuthenticationFailed(format!("{} returned no token for user '{}'", url, user))
        })?;
        info!("Logged in to {} as '{}'", server, user);
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(server.to_string(), token.clone());
        Ok(Some(token))
    }

    async fn token(&self, server: &str) -> Result<Option<String>> {
        if self.credentials.is_none() {
            return Ok(None);
        }
        match self.cached_token(server) {
            Some(token) => Ok(Some(token)),
            None => self.login(server).await,
        }
    }

    async fn send(&self, url: &str, body: &Value, token: Option<String>) -> Result<HttpResponse> {
        let mut request = HttpRequest::post(url).json(body.clone());
        if let Some(token) = token {
            request = request.header(TOKEN_HEADER, token);
        }
        self.transport.send(request).await
    }

    async fn post(&self, server: &str, path: &str, body: &Value) -> Result<()> {
        let url = format!("{}{}", server, path);
        let mut response = self.send(&url, body, self.token(server).await?).await?;

        if response.is_auth_failure() && self.credentials.is_some() {
            warn!("{} rejected the token ({}), logging in again", url, response.status);
            self.forget_token(server);
            let token = self.login(server).await?;
            response = self.send(&url, body, token).await?;
        }
        if response.is_auth_failure() {
            return Err(Error::AuthenticationFailed(format!(
                "{} answered {}",
                url, response.status
            )));
        }
        response.error_for_status(&url)?;
        debug!("Posted to {}", url);
        Ok(())
    }

    /// Post to every server; the first failure is returned once all were
    /// attempted
    async fn publish(&self, path: &str, body: Value) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        let mut first_error = None;
        for server in &self.servers {
            if let Err(e) = self.post(server, path, &body).await {
                warn!("Registration at {}{} failed: {}", server, path, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// `{"data": {"token": ...}}`
fn extract_token(body: &Value) -> Option<String> {
    body.get("data")?
        .get("token")?
        .as_str()
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

#[async_trait]
impl RegistrationAdapter for HttpAdapter {
    fn register_type(&self) -> RegisterType {
        RegisterType::Http
    }

    async fn persist_interface(&self, record: &MetadataRecord) -> Result<()> {
        let body = serde_json::to_value(record.clone().stamped())?;
        self.publish(&self.paths.metadata_path, body).await?;
        info!("Registered metadata {} ({})", record.path, record.rpc_type);
        Ok(())
    }

    async fn persist_uri(&self, record: &UriRecord) -> Result<()> {
        let body = serde_json::to_value(record)?;
        self.publish(&self.paths.uri_path, body).await?;
        info!("Registered uri {}:{}", record.host, record.port);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_token() {
        let body = json!({"code": 200, "message": "login success", "data": {"token": "abc"}});
        assert_eq!(extract_token(&body), Some("abc".to_string()));
        assert_eq!(extract_token(&json!({"data": {"token": ""}})), None);
        assert_eq!(extract_token(&json!({"code": 500})), None);
    }
}
