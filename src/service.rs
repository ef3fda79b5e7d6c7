//! The assembled lifecycle core.
//!
//! [`Hostlife`] wires registry, command queue, reconciler and publisher
//! together and is the only type the web layer needs to hold.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use log::{error, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{CommandError, EngineError, StoreError};
use crate::publisher::StatusPublisher;
use crate::queue::{CommandQueue, TransitionPolicy};
use crate::reconciler::{Reconciler, ReconcilerSettings};
use crate::registry::{container_name, HostRegistry};
use crate::runtime::ContainerEngine;
use crate::store::DesiredStateStore;
use crate::types::{
    image_reference, DesiredState, Host, HostId, HostSpec, HostStatus, ImageStatus, Ticket,
};

/// Knobs for [`Hostlife::new`]; [`Config`] is the usual source.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    pub container_prefix: String,
    pub default_registry: Option<String>,
    pub settings: ReconcilerSettings,
    pub policy: TransitionPolicy,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            container_prefix: "hostlife_generated_".into(),
            default_registry: None,
            settings: ReconcilerSettings::default(),
            policy: TransitionPolicy::default(),
        }
    }
}

impl From<&Config> for ServiceOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            container_prefix: cfg.container_prefix.clone(),
            default_registry: cfg.default_registry.clone(),
            settings: cfg.reconciler_settings(),
            policy: cfg.transition_policy(),
        }
    }
}

pub struct Hostlife {
    registry: Arc<HostRegistry>,
    queue: Arc<CommandQueue>,
    reconciler: Arc<Reconciler>,
    publisher: StatusPublisher,
    store: Arc<dyn DesiredStateStore>,
    engine: Arc<dyn ContainerEngine>,
    prefix: String,
    default_registry: Option<String>,
    intents: Mutex<Option<mpsc::UnboundedReceiver<HostId>>>,
}

impl Hostlife {
    pub fn new(
        engine: Arc<dyn ContainerEngine>,
        store: Arc<dyn DesiredStateStore>,
        options: ServiceOptions,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(HostRegistry::new());
        let queue = Arc::new(CommandQueue::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            options.policy,
            tx,
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&engine),
            options.settings,
            options.container_prefix.clone(),
        ));
        Self {
            publisher: StatusPublisher::new(Arc::clone(&registry)),
            registry,
            queue,
            reconciler,
            store,
            engine,
            prefix: options.container_prefix,
            default_registry: options.default_registry,
            intents: Mutex::new(Some(rx)),
        }
    }

    /// Load every persisted intent into the registry.
    ///
    /// Hydrated hosts start with an unknown observed state and are picked
    /// up by the reconciler's first tick.
    pub fn hydrate(&self) -> Result<usize, StoreError> {
        let records = self.store.load()?;
        let count = records.len();
        for record in records {
            self.registry.hydrate(record.id, record.desired, record.spec);
        }
        info!("Hydrated {} hosts from the store", count);
        Ok(count)
    }

    /// Start the reconciler.  Returns `None` when it was already started.
    pub fn spawn(&self) -> Option<JoinHandle<()>> {
        let intents = self.intents.lock().take()?;
        let reconciler = Arc::clone(&self.reconciler);
        Some(tokio::spawn(reconciler.run(intents)))
    }

    /// Submit a lifecycle intent.  Images without a registry get the
    /// configured default one.
    pub fn request_lifecycle_change(
        &self,
        id: &HostId,
        desired: DesiredState,
        spec: Option<HostSpec>,
    ) -> Result<Ticket, CommandError> {
        let spec = spec.map(|s| match &self.default_registry {
            Some(default) if s.registry.is_none() => s.registry(default.clone()),
            _ => s,
        });
        self.queue.enqueue(id, desired, spec)
    }

    pub fn list_hosts(&self) -> Vec<HostStatus> {
        self.publisher.list()
    }

    pub fn host(&self, id: &HostId) -> Option<HostStatus> {
        self.publisher.get(id)
    }

    pub fn purge(&self, id: &HostId) -> Result<Host, CommandError> {
        self.queue.purge(id)
    }

    pub fn publisher(&self) -> StatusPublisher {
        self.publisher.clone()
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    /// Request removal of managed containers no host claims.
    ///
    /// An orphan under the name the reconciler would give it becomes an
    /// Absent intent.  One under any other name (an older prefix, a
    /// manual rename) is out of the reconciler's reach and is removed
    /// right here.
    pub async fn sweep_orphans(&self) -> Result<usize, EngineError> {
        let mut swept = 0;
        for container in self.engine.list_managed().await? {
            if self.registry.contains(&container.host_id) {
                continue;
            }
            let handle = &container.handle;
            info!("Found orphaned container {} for {}", handle.name, container.host_id);
            if handle.name != container_name(&self.prefix, &container.host_id) {
                match self.engine.remove(handle).await {
                    Ok(()) => swept += 1,
                    Err(e) if e.is_not_found() => swept += 1,
                    Err(e) => warn!("Could not remove orphan {}: {}", handle.name, e),
                }
                continue;
            }
            match self.queue.enqueue(&container.host_id, DesiredState::Absent, None) {
                Ok(_) => swept += 1,
                Err(e) => warn!("Could not schedule removal of {}: {}", handle.name, e),
            }
        }
        Ok(swept)
    }

    /// Pull the image of every host that should exist.  Returns how many
    /// pulls succeeded; failures are logged only.
    pub async fn prefetch_images(&self) -> usize {
        let images: BTreeSet<String> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|h| h.desired != DesiredState::Absent)
            .filter_map(|h| h.spec.map(|s| s.image_ref()))
            .collect();

        let mut pulled = 0;
        for image in images {
            match self.engine.pull(&image).await {
                Ok(()) => pulled += 1,
                Err(e) => error!("Failed to pull {}: {}", image, e),
            }
        }
        pulled
    }

    /// Pull one image on demand.  `registry` is prefixed the same way as
    /// for host specs; without one the configured default applies.
    pub async fn pull_image(&self, registry: Option<&str>, image: &str) -> Result<String, EngineError> {
        let registry = registry.or(self.default_registry.as_deref());
        let reference = image_reference(registry, image);
        if image.trim().is_empty() || reference.is_empty() {
            return Err(EngineError::failed("image name cannot be empty"));
        }
        self.engine.pull(&reference).await?;
        Ok(reference)
    }

    /// Presence of each host's image in the engine, in host order.
    ///
    /// Each distinct image is looked up once.  A failed lookup is logged
    /// and reported as missing.
    pub async fn images_status(&self) -> Vec<ImageStatus> {
        let hosts: Vec<(HostId, String)> = self
            .registry
            .snapshot()
            .into_iter()
            .filter_map(|h| h.spec.map(|s| (h.id, s.image_ref())))
            .collect();

        let mut present: BTreeMap<&str, bool> = BTreeMap::new();
        for (_, image) in &hosts {
            if present.contains_key(image.as_str()) {
                continue;
            }
            let exists = match self.engine.image_exists(image).await {
                Ok(exists) => exists,
                Err(e) => {
                    error!("Failed to look up image {}: {}", image, e);
                    false
                }
            };
            present.insert(image, exists);
        }

        hosts
            .iter()
            .map(|(id, image)| ImageStatus {
                host_id: id.clone(),
                image: image.clone(),
                exists: present.get(image.as_str()).copied().unwrap_or(false),
            })
            .collect()
    }

    /// Engine version, logged; an unreachable engine is not fatal.
    pub async fn engine_version(&self) -> Option<String> {
        match self.engine.version().await {
            Ok(version) => {
                info!("Container engine version {}", version);
                Some(version)
            }
            Err(e) => {
                warn!("Container engine unreachable: {}", e);
                None
            }
        }
    }
}
