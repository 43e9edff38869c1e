//! Publishes a route set through an adapter

use crate::adapter::RegistrationAdapter;
use crate::error::Error;
use crate::records::{MetadataRecord, UriRecord};
use tracing::{error, info};

/// A record that could not be published
#[derive(Debug)]
pub struct FailedRecord {
    /// What was being published, e.g. `metadata /orders/list`
    pub description: String,
    /// Why it failed
    pub error: Error,
}

/// Outcome of [`register_routes`]
#[derive(Debug, Default)]
pub struct RegistrationReport {
    /// Metadata records published
    pub metadata_published: usize,
    /// URI records published
    pub uris_published: usize,
    /// Records that failed
    pub failures: Vec<FailedRecord>,
}

impl RegistrationReport {
    /// Whether every record was published
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Publish all metadata records, then all URI records.
///
/// A failing record is logged and recorded; the remaining records are
/// still published.
pub async fn register_routes(
    adapter: &dyn RegistrationAdapter,
    metadata: &[MetadataRecord],
    uris: &[UriRecord],
) -> RegistrationReport {
    let mut report = RegistrationReport::default();

    for record in metadata {
        match adapter.persist_interface(record).await {
            Ok(()) => report.metadata_published += 1,
            Err(e) => {
                let description = format!("metadata {} ({})", record.path, record.rpc_type);
                error!("Failed to register {}: {}", description, e);
                report.failures.push(FailedRecord { description, error: e });
            }
        }
    }

    for record in uris {
        match adapter.persist_uri(record).await {
            Ok(()) => report.uris_published += 1,
            Err(e) => {
                let description = format!("uri {}:{}", record.host, record.port);
                error!("Failed to register {}: {}", description, e);
                report.failures.push(FailedRecord { description, error: e });
            }
        }
    }

    info!(
        "Registered {} metadata and {} uri records ({} failed)",
        report.metadata_published,
        report.uris_published,
        report.failures.len()
    );
    report
}
