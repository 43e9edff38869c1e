//! Builds the adapter selected by configuration

use crate::adapter::{CoordinatedAdapter, HttpAdapter, RegistrationAdapter, ServiceRegistryAdapter};
use crate::backends::consul::ConsulClient;
use crate::backends::etcd::EtcdKvStore;
use crate::backends::nacos::NacosClient;
use crate::backends::NamingApi;
use crate::config::{RegisterConfig, RegisterType, RegistryFlavor};
use crate::error::{Error, Result};
use crate::transport::{HttpTransport, ReqwestTransport};
use coordination::backend::lease::{KvStore, LeaseKvConnector, MemoryKvStore};
use coordination::backend::memory::MemoryTree;
use coordination::{Connector, CoordinationClient, Spawner};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Server list scheme selecting the in-process stores
pub const MEMORY_SCHEME: &str = "memory://";

/// Builds a [`RegistrationAdapter`] from a [`RegisterConfig`].
///
/// Collaborators (connector, store, transport, naming client, spawner) are
/// derived from the configuration unless supplied explicitly.
pub struct AdapterFactory {
    config: RegisterConfig,
    connector: Option<Arc<dyn Connector>>,
    kv_store: Option<Arc<dyn KvStore>>,
    transport: Option<Arc<dyn HttpTransport>>,
    naming: Option<Arc<dyn NamingApi>>,
    spawner: Option<Arc<dyn Spawner>>,
}

impl AdapterFactory {
    /// Factory for `config`
    pub fn new(config: RegisterConfig) -> Self {
        Self {
            config,
            connector: None,
            kv_store: None,
            transport: None,
            naming: None,
            spawner: None,
        }
    }

    /// Open tree sessions through `connector`
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Use `store` for kv-lease sessions
    pub fn with_kv_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.kv_store = Some(store);
        self
    }

    /// Send HTTP requests through `transport`
    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Talk to the naming service through `naming`
    pub fn with_naming_api(mut self, naming: Arc<dyn NamingApi>) -> Self {
        self.naming = Some(naming);
        self
    }

    /// Run background loops on `spawner`
    pub fn with_spawner(mut self, spawner: Arc<dyn Spawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    fn in_memory(&self) -> bool {
        self.config
            .servers()
            .iter()
            .all(|server| server.starts_with(MEMORY_SCHEME))
    }

    fn spawner(&self) -> Result<Arc<dyn Spawner>> {
        self.spawner.clone().or_else(default_spawner).ok_or_else(|| {
            Error::InvalidConfiguration(
                "no spawner: supply one or enable the smol or tokio feature".to_string(),
            )
        })
    }

    fn transport(&self) -> Result<Arc<dyn HttpTransport>> {
        match &self.transport {
            Some(transport) => Ok(Arc::clone(transport)),
            None => {
                let timeout = Duration::from_millis(self.config.timeouts.operation_ms);
                Ok(Arc::new(ReqwestTransport::new(timeout)?))
            }
        }
    }

    fn tree_connector(&self) -> Result<Arc<dyn Connector>> {
        if let Some(connector) = &self.connector {
            return Ok(Arc::clone(connector));
        }
        if self.in_memory() {
            return Ok(Arc::new(MemoryTree::new().connector()));
        }
        Err(Error::InvalidConfiguration(format!(
            "no tree connector for '{}': use a memory:// server list or supply one with \
             AdapterFactory::with_connector",
            self.config.server_list
        )))
    }

    fn kv_store(&self) -> Result<Arc<dyn KvStore>> {
        if let Some(store) = &self.kv_store {
            return Ok(Arc::clone(store));
        }
        if self.in_memory() {
            return Ok(Arc::new(MemoryKvStore::new()));
        }
        let store = EtcdKvStore::new(self.config.servers(), self.transport()?)?
            .with_credentials(self.config.username.clone(), self.config.password.clone());
        Ok(Arc::new(store))
    }

    fn naming_api(&self) -> Result<Arc<dyn NamingApi>> {
        if let Some(naming) = &self.naming {
            return Ok(Arc::clone(naming));
        }
        let settings = self.registry_settings()?;
        let servers = self.config.servers();
        let api: Arc<dyn NamingApi> = match settings.flavor {
            RegistryFlavor::Nacos => Arc::new(
                NacosClient::new(servers, self.transport()?)?
                    .with_namespace(settings.namespace.clone())
                    .with_group(settings.group.clone())
                    .with_heartbeat_interval(Duration::from_millis(settings.heartbeat_ms))
                    .with_credentials(self.config.username.clone(), self.config.password.clone()),
            ),
            RegistryFlavor::Consul => Arc::new(
                ConsulClient::new(servers, self.transport()?)?.with_token(settings.token.clone()),
            ),
        };
        Ok(api)
    }

    fn registry_settings(&self) -> Result<&crate::config::ServiceRegistryConfig> {
        self.config.service_registry.as_ref().ok_or_else(|| {
            Error::InvalidConfiguration("serviceRegistry section is required".to_string())
        })
    }

    async fn coordinated(&self, connector: Arc<dyn Connector>) -> Result<Arc<dyn RegistrationAdapter>> {
        let spawner = self.spawner()?;
        let client = CoordinationClient::start(self.config.endpoint()?, connector, spawner.as_ref()).await?;
        Ok(Arc::new(CoordinatedAdapter::new(
            self.config.register_type,
            Arc::new(client),
            self.config.path_builder()?,
        )))
    }

    /// Validate the configuration and build the adapter
    pub async fn build(self) -> Result<Arc<dyn RegistrationAdapter>> {
        self.config.validate()?;
        info!(
            "Initializing {:?} registration against {}",
            self.config.register_type, self.config.server_list
        );

        match self.config.register_type {
            RegisterType::Tree => self.coordinated(self.tree_connector()?).await,
            RegisterType::KvLease => {
                let connector = LeaseKvConnector::new(self.kv_store()?, self.config.lease_ttl(), self.spawner()?);
                self.coordinated(Arc::new(connector)).await
            }
            RegisterType::ServiceRegistry => {
                let adapter = ServiceRegistryAdapter::new(
                    self.naming_api()?,
                    self.config.path_builder()?,
                    self.registry_settings()?,
                    self.config.tags.clone(),
                );
                adapter.start(self.spawner()?.as_ref()).await?;
                Ok(Arc::new(adapter))
            }
            RegisterType::Http => {
                let adapter = HttpAdapter::new(self.config.servers(), self.config.http.clone(), self.transport()?)?
                    .with_credentials(self.config.username.clone(), self.config.password.clone());
                adapter.login_all().await;
                Ok(Arc::new(adapter))
            }
        }
    }
}

#[cfg(feature = "tokio")]
fn default_spawner() -> Option<Arc<dyn Spawner>> {
    Some(Arc::new(coordination::TokioSpawner))
}

#[cfg(all(feature = "smol", not(feature = "tokio")))]
fn default_spawner() -> Option<Arc<dyn Spawner>> {
    Some(Arc::new(coordination::SmolSpawner))
}

#[cfg(not(any(feature = "smol", feature = "tokio")))]
fn default_spawner() -> Option<Arc<dyn Spawner>> {
    None
}

/// Build the adapter selected by `config` with default collaborators
pub async fn init(config: RegisterConfig) -> Result<Arc<dyn RegistrationAdapter>> {
    AdapterFactory::new(config).build().await
}
