//! Shadow mesh base factory
//!
//! Creates a shadow the first time a partner contacts an unknown data source,
//! drives its probe on the schedule its dispatcher plans and removes it once it
//! has not been needed for the configured grace period.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::{debug, info, info_span, warn, Instrument};

use super::{dispatcher::ProbeDispatcher, probe::{ProbeDirectory, ProbeError}, ShadowMeshBase};
use crate::{
    config::ShadowConfig,
    endpoint::listeners::{ListenerSet, Subscription},
    error::{MeshError, MeshResult},
    identifier::MeshBaseIdentifier,
    meshbase::MeshBase,
    model::TypeRegistry,
    nameserver::{MeshBaseFactory, MeshBaseNameServer, NameServerTransportFactory},
    proxy::TransportFactory,
    store::NoopStore,
};

pub trait ShadowFactoryListener: Send + Sync {
    fn shadow_created(&self, _shadow: &MeshBaseIdentifier) {}

    fn shadow_removed(&self, _shadow: &MeshBaseIdentifier) {}
}

pub struct ShadowMeshBaseFactory {
    name_server: Arc<MeshBaseNameServer>,
    transport_factory: Arc<dyn TransportFactory>,
    directory: Arc<ProbeDirectory>,
    types: Arc<TypeRegistry>,
    config: ShadowConfig,
    shadows: DashMap<MeshBaseIdentifier, Arc<ShadowMeshBase>>,
    creating: AsyncMutex<()>,
    listeners: ListenerSet<dyn ShadowFactoryListener>,
    self_ref: Weak<ShadowMeshBaseFactory>,
    shutdown_tx: watch::Sender<bool>,
}

impl ShadowMeshBaseFactory {
    /// Creates the factory and installs it as the name server's fallback
    pub fn new(
        name_server: Arc<MeshBaseNameServer>,
        directory: ProbeDirectory,
        types: Arc<TypeRegistry>,
        config: ShadowConfig,
    ) -> MeshResult<Arc<Self>> {
        config.validate().map_err(MeshError::InvalidConfig)?;
        let transport_factory: Arc<dyn TransportFactory> = NameServerTransportFactory::new(name_server.clone());
        let (shutdown_tx, _) = watch::channel(false);
        let factory = Arc::new_cyclic(|weak: &Weak<Self>| Self {
            name_server,
            transport_factory,
            directory: Arc::new(directory),
            types,
            config,
            shadows: DashMap::new(),
            creating: AsyncMutex::new(()),
            listeners: ListenerSet::new(),
            self_ref: weak.clone(),
            shutdown_tx,
        });
        let fallback: Arc<dyn MeshBaseFactory> = factory.clone();
        factory.name_server.set_fallback_factory(&fallback);
        Ok(factory)
    }

    pub fn config(&self) -> &ShadowConfig {
        &self.config
    }

    pub fn add_listener(&self, listener: Arc<dyn ShadowFactoryListener>) -> Subscription {
        self.listeners.subscribe(listener)
    }

    pub fn get(&self, identifier: &MeshBaseIdentifier) -> Option<Arc<ShadowMeshBase>> {
        self.shadows.get(identifier).map(|entry| entry.value().clone())
    }

    pub fn shadows(&self) -> Vec<Arc<ShadowMeshBase>> {
        self.shadows.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.shadows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shadows.is_empty()
    }

    /// Finds or creates the shadow of `identifier`
    ///
    /// A new shadow has run its probe once and is registered with the name
    /// server before it is returned.
    pub async fn obtain_shadow(&self, identifier: &MeshBaseIdentifier) -> MeshResult<Arc<ShadowMeshBase>> {
        if let Some(shadow) = self.get(identifier) {
            return Ok(shadow);
        }
        let _creating = self.creating.lock().await;
        if let Some(shadow) = self.get(identifier) {
            return Ok(shadow);
        }
        if *self.shutdown_tx.borrow() {
            return Err(MeshError::NotPermitted("shadow factory is shut down".to_string()));
        }
        if !self.directory.handles(identifier) {
            return Err(ProbeError::NoProbe(identifier.to_string()).into());
        }

        let base = MeshBase::builder(identifier.clone(), self.transport_factory.clone())
            .config(self.config.mesh_base.clone())
            .store(Arc::new(NoopStore))
            .types(self.types.clone())
            .build()
            .await?;
        let dispatcher = Arc::new(ProbeDispatcher::new(
            identifier.clone(),
            self.directory.clone(),
            &self.config,
        ));
        let shadow = Arc::new(ShadowMeshBase::new(base, dispatcher));
        if let Err(error) = shadow.do_update_now().await {
            shadow.die();
            return Err(error);
        }
        let next = shadow.dispatcher().schedule_next(true);

        self.shadows.insert(identifier.clone(), shadow.clone());
        self.name_server.register(shadow.mesh_base());
        let span = info_span!("shadow_scheduler", shadow = %identifier);
        tokio::spawn(
            Self::run_scheduler(self.self_ref.clone(), identifier.clone(), self.shutdown_tx.subscribe())
                .instrument(span),
        );
        info!(shadow = %identifier, objects = shadow.mesh_base().size(), ?next, "Created shadow mesh base");
        self.listeners
            .fire("shadow_created", |l| l.shadow_created(identifier));
        Ok(shadow)
    }

    /// Ceases communications with every partner of the shadow and shuts it down
    pub async fn remove(&self, identifier: &MeshBaseIdentifier) -> bool {
        let Some((_, shadow)) = self.shadows.remove(identifier) else {
            return false;
        };
        let ceased = shadow.cease_all_communications().await;
        self.name_server.unregister(identifier);
        shadow.die();
        info!(shadow = %identifier, ceased, "Removed shadow mesh base");
        self.listeners
            .fire("shadow_removed", |l| l.shadow_removed(identifier));
        true
    }

    /// Stops every scheduler and shuts every shadow down
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let identifiers: Vec<MeshBaseIdentifier> =
            self.shadows.iter().map(|entry| entry.key().clone()).collect();
        for identifier in identifiers {
            if let Some((_, shadow)) = self.shadows.remove(&identifier) {
                self.name_server.unregister(&identifier);
                shadow.die();
            }
        }
        info!("Shadow factory shut down");
    }

    async fn run_scheduler(
        factory: Weak<Self>,
        identifier: MeshBaseIdentifier,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            let (delay, dispatcher) = {
                let Some(factory) = factory.upgrade() else { break };
                let Some(shadow) = factory.get(&identifier) else { break };
                let dispatcher = shadow.dispatcher().clone();
                let delay = dispatcher
                    .scheduled_delay()
                    .unwrap_or_else(|| factory.config.min_update_delay());
                (delay, dispatcher)
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = dispatcher.rescheduled() => {
                    debug!("Schedule changed");
                    continue;
                }
                _ = shutdown_rx.changed() => {
                    debug!("Shadow scheduler received shutdown signal");
                    break;
                }
            }

            let Some(factory) = factory.upgrade() else { break };
            let Some(shadow) = factory.get(&identifier) else { break };
            if shadow.may_be_deleted() {
                debug!("Shadow no longer needed");
                factory.remove(&identifier).await;
                break;
            }
            if shadow.dispatcher().scheduled_delay().is_none() {
                continue;
            }
            let changed = match shadow.do_update_now().await {
                Ok(changed) => changed,
                Err(error) => {
                    warn!(error = %error, "Scheduled probe run failed");
                    true
                }
            };
            shadow.dispatcher().schedule_next(changed);
        }
    }
}

#[async_trait]
impl MeshBaseFactory for ShadowMeshBaseFactory {
    async fn obtain_for(&self, identifier: &MeshBaseIdentifier) -> MeshResult<Arc<MeshBase>> {
        let shadow = self.obtain_shadow(identifier).await?;
        Ok(shadow.mesh_base().clone())
    }
}
