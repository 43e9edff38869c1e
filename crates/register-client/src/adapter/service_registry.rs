//! Adapter over a naming/configuration service (Nacos, Consul)

use super::RegistrationAdapter;
use crate::backends::{NamingApi, ServiceInstance};
use crate::config::{RegisterType, ServiceRegistryConfig};
use crate::error::{Error, Result};
use crate::path::PathBuilder;
use crate::records::{MetadataRecord, UriRecord};
use async_trait::async_trait;
use coordination::runtime::{self, Spawner};
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Metadata of one context, published as a single JSON array
#[derive(Default)]
struct PublishedSet {
    entries: IndexMap<String, MetadataRecord>,
    version: u64,
}

type Instances = Arc<Mutex<IndexMap<String, ServiceInstance>>>;

fn lock_instances(instances: &Instances) -> MutexGuard<'_, IndexMap<String, ServiceInstance>> {
    instances.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registers URIs as ephemeral instances and publishes metadata as
/// accumulated configuration blobs
pub struct ServiceRegistryAdapter {
    api: Arc<dyn NamingApi>,
    paths: PathBuilder,
    service_name: Option<String>,
    instance_base: String,
    enable_tag_override: bool,
    tags: BTreeMap<String, String>,
    instances: Instances,
    sets: Mutex<HashMap<String, Arc<futures::lock::Mutex<PublishedSet>>>>,
    closed: Arc<AtomicBool>,
}

impl ServiceRegistryAdapter {
    /// Adapter over `api`; `tags` are attached to every instance
    pub fn new(
        api: Arc<dyn NamingApi>,
        paths: PathBuilder,
        settings: &ServiceRegistryConfig,
        tags: BTreeMap<String, String>,
    ) -> Self {
        let instance_base = settings
            .instance_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        Self {
            api,
            paths,
            service_name: settings.service_name.clone().filter(|s| !s.is_empty()),
            instance_base,
            enable_tag_override: settings.enable_tag_override,
            tags,
            instances: Arc::new(Mutex::new(IndexMap::new())),
            sets: Mutex::new(HashMap::new()),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Log in and, when the registry needs heartbeats, hand the heartbeat
    /// loop to `spawner`
    pub async fn start(&self, spawner: &dyn Spawner) -> Result<()> {
        self.api.login().await?;
        if let Some(interval) = self.api.heartbeat_interval() {
            debug!("Starting {} heartbeat every {:?}", self.api.name(), interval);
            spawner.spawn(Box::pin(heartbeat_loop(
                Arc::clone(&self.api),
                Arc::clone(&self.instances),
                Arc::clone(&self.closed),
                interval,
            )));
        }
        Ok(())
    }

    /// Records accumulated under a configuration name, in insertion order
    pub async fn accumulated(&self, config_name: &str) -> Vec<MetadataRecord> {
        match self.existing_set(config_name) {
            Some(set) => set.lock().await.entries.values().cloned().collect(),
            None => Vec::new(),
        }
    }

    /// Local version of the last publish of a configuration name
    pub async fn published_version(&self, config_name: &str) -> Option<u64> {
        match self.existing_set(config_name) {
            Some(set) => Some(set.lock().await.version),
            None => None,
        }
    }

    /// Ids of the instances currently registered
    pub fn instance_ids(&self) -> Vec<String> {
        lock_instances(&self.instances).keys().cloned().collect()
    }

    fn existing_set(&self, config_name: &str) -> Option<Arc<futures::lock::Mutex<PublishedSet>>> {
        self.sets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(config_name)
            .cloned()
    }

    fn set_for(&self, config_name: &str) -> Arc<futures::lock::Mutex<PublishedSet>> {
        let mut sets = self.sets.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(sets.entry(config_name.to_string()).or_default())
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn instance_for(&self, record: &UriRecord) -> Result<ServiceInstance> {
        let service_name = match &self.service_name {
            Some(name) => name.clone(),
            None => self.paths.build_service_instance_name(&record.rpc_type)?,
        };
        let node = self.paths.build_uri_node_name(&record.host, record.port)?;

        let mut metadata = self.tags.clone();
        metadata.insert(
            "contextPath".to_string(),
            record.context_path.trim_start_matches('/').to_string(),
        );
        metadata.insert("uriMetadata".to_string(), record.to_json()?);

        Ok(ServiceInstance {
            instance_id: format!("{}-{}-{}", service_name, self.instance_base, node),
            service_name,
            ip: record.host.clone(),
            port: record.port,
            ephemeral: true,
            metadata,
            tags: self.tags.iter().map(|(k, v)| format!("{}={}", k, v)).collect(),
            enable_tag_override: self.enable_tag_override,
        })
    }
}

async fn heartbeat_loop(
    api: Arc<dyn NamingApi>,
    instances: Instances,
    closed: Arc<AtomicBool>,
    interval: Duration,
) {
    loop {
        runtime::sleep(interval).await;
        if closed.load(Ordering::SeqCst) {
            break;
        }

        let snapshot: Vec<ServiceInstance> = lock_instances(&instances).values().cloned().collect();
        for instance in snapshot {
            match api.heartbeat(&instance).await {
                Ok(true) => {}
                Ok(false) if !closed.load(Ordering::SeqCst) => {
                    warn!(
                        "{} lost instance {}:{}, registering again",
                        api.name(),
                        instance.ip,
                        instance.port
                    );
                    if let Err(e) = api.register_instance(&instance).await {
                        warn!("Re-registering {}:{} failed: {}", instance.ip, instance.port, e);
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("Heartbeat for {}:{} failed: {}", instance.ip, instance.port, e),
            }
        }
    }
    debug!("{} heartbeat loop stopped", api.name());
}

#[async_trait]
impl RegistrationAdapter for ServiceRegistryAdapter {
    fn register_type(&self) -> RegisterType {
        RegisterType::ServiceRegistry
    }

    async fn persist_interface(&self, record: &MetadataRecord) -> Result<()> {
        self.check_open()?;
        let context = if record.context_path.is_empty() {
            &record.app_name
        } else {
            &record.context_path
        };
        let config_name = self.paths.build_service_config_name(&record.rpc_type, context)?;
        let node_name = self.paths.build_metadata_node_name(record)?;

        // Held across the publish so concurrent inserts land in one of the
        // published blobs
        let set = self.set_for(&config_name);
        let mut set = set.lock().await;
        set.entries.insert(node_name, record.clone().stamped());
        set.version += 1;
        let content = serde_json::to_string(&set.entries.values().collect::<Vec<_>>())?;

        self.api.publish_config(&config_name, &content).await?;
        info!(
            "Published {} ({} entries, version {})",
            config_name,
            set.entries.len(),
            set.version
        );
        Ok(())
    }

    async fn persist_uri(&self, record: &UriRecord) -> Result<()> {
        self.check_open()?;
        let instance = self.instance_for(record)?;
        self.api.register_instance(&instance).await?;
        lock_instances(&self.instances).insert(instance.instance_id.clone(), instance);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let instances: Vec<ServiceInstance> = lock_instances(&self.instances)
            .drain(..)
            .map(|(_, instance)| instance)
            .collect();

        let mut first_error = None;
        for instance in &instances {
            if let Err(e) = self.api.deregister_instance(instance).await {
                warn!("Deregistering {} failed: {}", instance.instance_id, e);
                first_error.get_or_insert(e);
            }
        }
        info!("Closed {} adapter ({} instances)", self.api.name(), instances.len());
        first_error.map_or(Ok(()), Err)
    }
}
