//! Registration adapters, one per backend family

mod coordinated;
mod http;
mod service_registry;

pub use coordinated::CoordinatedAdapter;
pub use http::HttpAdapter;
pub use service_registry::ServiceRegistryAdapter;

use crate::config::RegisterType;
use crate::error::Result;
use crate::records::{MetadataRecord, UriRecord};
use async_trait::async_trait;

/// Publishes registration records to one backend family.
///
/// Both persist calls are idempotent: persisting a record whose logical key
/// was already written overwrites the payload.
#[async_trait]
pub trait RegistrationAdapter: Send + Sync {
    /// Backend family this adapter talks to
    fn register_type(&self) -> RegisterType;

    /// Publish route metadata
    async fn persist_interface(&self, record: &MetadataRecord) -> Result<()>;

    /// Publish an instance address
    async fn persist_uri(&self, record: &UriRecord) -> Result<()>;

    /// Release every backend resource; further persist calls fail with
    /// `Closed`
    async fn close(&self) -> Result<()>;
}
