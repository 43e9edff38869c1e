//! Adapter over the session-aware coordination client (tree and kv-lease)

use super::RegistrationAdapter;
use crate::config::RegisterType;
use crate::error::{Error, Result};
use crate::path::PathBuilder;
use crate::records::{MetadataRecord, UriRecord};
use async_trait::async_trait;
use coordination::{CanonicalKey, CoordinationClient, Durability};
use std::sync::Arc;
use tracing::{debug, info};

/// Writes records as ephemeral entries at their canonical keys.
///
/// Entries live as long as the session; the coordination client replays
/// them onto a replacement session after expiry.
pub struct CoordinatedAdapter {
    register_type: RegisterType,
    client: Arc<CoordinationClient>,
    paths: PathBuilder,
}

impl CoordinatedAdapter {
    /// Adapter writing through `client`
    pub fn new(register_type: RegisterType, client: Arc<CoordinationClient>, paths: PathBuilder) -> Self {
        Self {
            register_type,
            client,
            paths,
        }
    }

    /// Underlying coordination client
    pub fn client(&self) -> &Arc<CoordinationClient> {
        &self.client
    }

    async fn write(&self, key: &CanonicalKey, payload: String) -> Result<()> {
        if self.client.is_closed() {
            return Err(Error::Closed);
        }
        debug!("Writing {} ({} bytes)", key, payload.len());
        self.client
            .upsert(key, payload.as_bytes(), Durability::Ephemeral)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl RegistrationAdapter for CoordinatedAdapter {
    fn register_type(&self) -> RegisterType {
        self.register_type
    }

    async fn persist_interface(&self, record: &MetadataRecord) -> Result<()> {
        let key = self.paths.metadata_key(record)?;
        self.write(&key, record.clone().stamped().to_json()?).await?;
        info!("Registered metadata {}", key);
        Ok(())
    }

    async fn persist_uri(&self, record: &UriRecord) -> Result<()> {
        let key = self.paths.uri_key(record)?;
        self.write(&key, record.to_json()?).await?;
        info!("Registered uri {}", key);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.client.close().await?;
        Ok(())
    }
}
