//! Gateway registration client
//!
//! Publishes route metadata and instance addresses of an application to the
//! gateway's registration backend. The backend family is chosen by
//! configuration:
//!
//! - `tree`: ephemeral entries in a ZooKeeper-like tree
//! - `kv-lease`: leased entries in etcd
//! - `service-registry`: instances and configuration blobs in Nacos or Consul
//! - `http`: authenticated posts to the gateway admin API
//!
//! Every entry is addressed by the canonical layout built by
//! [`PathBuilder`].
//!
//! # Example
//!
//! ```no_run
//! use register_client::{RegisterConfig, RouteSet, register_routes};
//!
//! # async fn example() -> register_client::Result<()> {
//! let config = RegisterConfig::from_file("register.yaml").await?;
//! let routes = RouteSet::from_file("routes.yaml").await?;
//!
//! let adapter = register_client::init(config).await?;
//! let report = register_routes(adapter.as_ref(), &routes.metadata, &routes.uris).await;
//! assert!(report.is_complete());
//! adapter.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod adapter;
pub mod backends;
pub mod config;
pub mod driver;
pub mod error;
pub mod factory;
pub mod path;
pub mod records;
pub mod transport;

pub use adapter::RegistrationAdapter;
pub use config::{RegisterConfig, RegisterType, RegistryFlavor};
pub use driver::{RegistrationReport, register_routes};
pub use error::{Error, Result};
pub use factory::{AdapterFactory, init};
pub use path::{EntryKind, PathBuilder};
pub use records::{MetadataRecord, RouteSet, UriRecord};
pub use transport::{HttpTransport, ReqwestTransport};
