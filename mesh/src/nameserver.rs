//! Name server and in-process transport between mesh bases
//!
//! `MeshBaseNameServer` maps mesh base identifiers to the mesh bases living in
//! this process. It is an explicit object handed to whoever needs it. Unknown
//! identifiers can be resolved through a fallback `MeshBaseFactory`, which is
//! how shadow mesh bases come into existence on first contact.
//!
//! `NameServerTransport` delivers ping-pong tokens straight to the partner
//! mesh base's proxy manager.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::debug;

use crate::{
    endpoint::{pingpong::Token, MessageTransport, SendError},
    error::{MeshError, MeshResult},
    identifier::MeshBaseIdentifier,
    meshbase::MeshBase,
    proxy::TransportFactory,
    xpriso::XprisoMessage,
};

/// Creates or finds mesh bases on demand
#[async_trait]
pub trait MeshBaseFactory: Send + Sync {
    async fn obtain_for(&self, identifier: &MeshBaseIdentifier) -> MeshResult<Arc<MeshBase>>;
}

#[derive(Default)]
pub struct MeshBaseNameServer {
    bases: DashMap<MeshBaseIdentifier, Weak<MeshBase>>,
    fallback: RwLock<Option<Weak<dyn MeshBaseFactory>>>,
}

impl MeshBaseNameServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, base: &Arc<MeshBase>) {
        self.bases
            .insert(base.identifier().clone(), Arc::downgrade(base));
    }

    pub fn unregister(&self, identifier: &MeshBaseIdentifier) {
        self.bases.remove(identifier);
    }

    /// The live mesh base registered as `identifier`
    pub fn get(&self, identifier: &MeshBaseIdentifier) -> Option<Arc<MeshBase>> {
        let base = self.bases.get(identifier).and_then(|weak| weak.upgrade());
        match base {
            Some(base) if !base.is_dead() => Some(base),
            _ => {
                self.bases.remove_if(identifier, |_, weak| {
                    weak.upgrade().map_or(true, |base| base.is_dead())
                });
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.bases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
    }

    pub fn set_fallback_factory(&self, factory: &Arc<dyn MeshBaseFactory>) {
        *self.fallback.write() = Some(Arc::downgrade(factory));
    }

    /// Finds `identifier`, asking the fallback factory if `create` is set
    pub async fn resolve(&self, identifier: &MeshBaseIdentifier, create: bool) -> MeshResult<Arc<MeshBase>> {
        if let Some(base) = self.get(identifier) {
            return Ok(base);
        }
        if !create {
            return Err(MeshError::UnknownMeshBase(identifier.clone()));
        }
        let factory = self.fallback.read().as_ref().and_then(Weak::upgrade);
        let Some(factory) = factory else {
            return Err(MeshError::UnknownMeshBase(identifier.clone()));
        };
        debug!(base = %identifier, "Creating mesh base on demand");
        factory.obtain_for(identifier).await
    }
}

// ============================================================================
// Transport
// ============================================================================

pub struct NameServerTransportFactory {
    name_server: Arc<MeshBaseNameServer>,
}

impl NameServerTransportFactory {
    pub fn new(name_server: Arc<MeshBaseNameServer>) -> Arc<Self> {
        Arc::new(Self { name_server })
    }
}

impl TransportFactory for NameServerTransportFactory {
    fn transport_for(
        &self,
        local: &MeshBaseIdentifier,
        partner: &MeshBaseIdentifier,
    ) -> Arc<dyn MessageTransport<XprisoMessage>> {
        Arc::new(NameServerTransport {
            name_server: self.name_server.clone(),
            local: local.clone(),
            partner: partner.clone(),
        })
    }
}

/// Delivers tokens to the partner's proxy manager
pub struct NameServerTransport {
    name_server: Arc<MeshBaseNameServer>,
    local: MeshBaseIdentifier,
    partner: MeshBaseIdentifier,
}

#[async_trait]
impl MessageTransport<XprisoMessage> for NameServerTransport {
    async fn send_message(&self, token: Token, content: Vec<XprisoMessage>) -> Result<(), SendError> {
        // bare acknowledgments and cease notices never bring a mesh base to life
        let create = content
            .iter()
            .any(|message| !message.is_empty() && !message.cease_communications);
        let partner = self
            .name_server
            .resolve(&self.partner, create)
            .await
            .map_err(|e| SendError::Dead(e.to_string()))?;
        partner
            .proxy_manager()
            .deliver(&self.local, token, content)
            .map_err(|e| SendError::Dead(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counting(parking_lot::Mutex<Vec<MeshBaseIdentifier>>);

    #[async_trait]
    impl MeshBaseFactory for Counting {
        async fn obtain_for(&self, identifier: &MeshBaseIdentifier) -> MeshResult<Arc<MeshBase>> {
            self.0.lock().push(identifier.clone());
            Err(MeshError::UnknownMeshBase(identifier.clone()))
        }
    }

    #[tokio::test]
    async fn test_resolve_uses_fallback_only_when_creating() {
        let name_server = MeshBaseNameServer::new();
        let counting = Arc::new(Counting(parking_lot::Mutex::new(Vec::new())));
        let factory: Arc<dyn MeshBaseFactory> = counting.clone();
        name_server.set_fallback_factory(&factory);

        let x: MeshBaseIdentifier = "x".into();
        assert!(name_server.resolve(&x, false).await.is_err());
        assert!(counting.0.lock().is_empty());
        assert!(name_server.resolve(&x, true).await.is_err());
        assert_eq!(counting.0.lock().as_slice(), &[x]);
    }

    #[tokio::test]
    async fn test_dropped_fallback_is_not_used() {
        let name_server = MeshBaseNameServer::new();
        {
            let factory: Arc<dyn MeshBaseFactory> =
                Arc::new(Counting(parking_lot::Mutex::new(Vec::new())));
            name_server.set_fallback_factory(&factory);
        }
        assert!(matches!(
            name_server.resolve(&"x".into(), true).await,
            Err(MeshError::UnknownMeshBase(_))
        ));
    }
}
