//! Shadow mesh bases
//!
//! A shadow mesh base mirrors one external data source. Its content is written
//! only by its `ProbeDispatcher`; partners replicate from it like from any other
//! mesh base. When nobody replicates from a shadow any more it is removed by
//! its `ShadowMeshBaseFactory`.

pub mod dispatcher;
pub mod factory;
pub mod probe;

use std::{fmt, sync::Arc};

use futures::future::join_all;
use tracing::debug;

use self::{dispatcher::ProbeDispatcher, probe::ProbeError};
use crate::{
    endpoint::listeners::Subscription,
    error::MeshResult,
    identifier::{CoherenceSpecification, MeshBaseIdentifier},
    meshbase::{MeshBase, MeshBaseListener},
};

/// Events of probe runs after the first one
pub trait ShadowListener: Send + Sync {
    fn update_started(&self, _shadow: &MeshBaseIdentifier) {}

    /// The run changed nothing
    fn update_skipped(&self, _shadow: &MeshBaseIdentifier) {}

    fn update_finished_successfully(&self, _shadow: &MeshBaseIdentifier) {}

    fn update_finished_unsuccessfully(&self, _shadow: &MeshBaseIdentifier, _error: &ProbeError) {}
}

/// Adopts the coherence partners ask for
struct CoherenceRelay {
    dispatcher: Arc<ProbeDispatcher>,
}

impl MeshBaseListener for CoherenceRelay {
    fn coherence_requested(&self, partner: &MeshBaseIdentifier, coherence: &CoherenceSpecification) {
        debug!(shadow = %self.dispatcher.source(), %partner, coherence = coherence.as_str(), "Coherence requested");
        self.dispatcher.set_coherence(coherence.clone());
    }
}

pub struct ShadowMeshBase {
    base: Arc<MeshBase>,
    dispatcher: Arc<ProbeDispatcher>,
    _coherence: Subscription,
}

impl ShadowMeshBase {
    pub(crate) fn new(base: Arc<MeshBase>, dispatcher: Arc<ProbeDispatcher>) -> Self {
        let coherence = base.add_listener(Arc::new(CoherenceRelay {
            dispatcher: dispatcher.clone(),
        }));
        Self {
            base,
            dispatcher,
            _coherence: coherence,
        }
    }

    pub fn identifier(&self) -> &MeshBaseIdentifier {
        self.base.identifier()
    }

    pub fn mesh_base(&self) -> &Arc<MeshBase> {
        &self.base
    }

    pub fn dispatcher(&self) -> &Arc<ProbeDispatcher> {
        &self.dispatcher
    }

    pub fn add_listener(&self, listener: Arc<dyn ShadowListener>) -> Subscription {
        self.dispatcher.listeners().subscribe(listener)
    }

    /// Runs the probe now; true if the shadow's content changed
    pub async fn do_update_now(&self) -> MeshResult<bool> {
        self.dispatcher.do_update_now(&self.base).await
    }

    pub fn is_needed(&self) -> bool {
        self.dispatcher.is_needed(&self.base)
    }

    pub fn may_be_deleted(&self) -> bool {
        self.dispatcher.may_be_deleted(&self.base)
    }

    /// Sends a cease notice over every proxy and removes them, all partners at once
    pub async fn cease_all_communications(&self) -> usize {
        let proxies = self.base.proxy_manager().proxies();
        let results = join_all(proxies.iter().map(|proxy| proxy.initiate_cease_communications())).await;
        let mut ceased = 0;
        for (proxy, result) in proxies.iter().zip(results) {
            match result {
                Ok(()) => ceased += 1,
                Err(error) => {
                    debug!(shadow = %self.identifier(), partner = %proxy.partner(), error = %error, "Cease failed")
                }
            }
        }
        ceased
    }

    pub fn die(&self) {
        self.base.die();
    }
}

impl fmt::Debug for ShadowMeshBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShadowMeshBase")
            .field("identifier", self.identifier())
            .field("objects", &self.base.size())
            .field("coherence", &self.dispatcher.coherence())
            .finish()
    }
}
