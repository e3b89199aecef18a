//! Proxy manager
//!
//! Holds one proxy per partner mesh base. Proxies are created on first use,
//! either because we talk to a partner or because a partner talks to us, and
//! replaced when their endpoint has died.
//!
//! The manager also tracks which objects have a lock or home replica request
//! on the way out of this mesh base. A request for one of those that comes back
//! in is answered without forwarding it again.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use super::{ExternalizedProxy, Proxy, TransportFactory};
use crate::{
    endpoint::pingpong::Token,
    error::{EndpointError, MeshError, MeshResult},
    identifier::{MeshBaseIdentifier, MeshObjectIdentifier},
    meshbase::MeshBase,
    store::proxy_key,
    xpriso::XprisoMessage,
};

/// What an outgoing request asks the partner for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum RequestKind {
    Lock,
    HomeReplica,
}

/// Outgoing requests for a set of objects; released on drop
pub(crate) struct InFlight<'a> {
    requests: &'a DashMap<(RequestKind, MeshObjectIdentifier), usize>,
    kind: RequestKind,
    objects: Vec<MeshObjectIdentifier>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        for object in self.objects.drain(..) {
            self.requests
                .remove_if_mut(&(self.kind, object), |_, count| {
                    *count -= 1;
                    *count == 0
                });
        }
    }
}

pub struct ProxyManager {
    local: MeshBaseIdentifier,
    base: Weak<MeshBase>,
    factory: Arc<dyn TransportFactory>,
    proxies: DashMap<MeshBaseIdentifier, Arc<Proxy>>,
    in_flight: DashMap<(RequestKind, MeshObjectIdentifier), usize>,
}

impl ProxyManager {
    pub(crate) fn new(
        local: MeshBaseIdentifier,
        base: Weak<MeshBase>,
        factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            local,
            base,
            factory,
            proxies: DashMap::new(),
            in_flight: DashMap::new(),
        }
    }

    fn base(&self) -> MeshResult<Arc<MeshBase>> {
        self.base
            .upgrade()
            .ok_or_else(|| MeshError::MeshBaseIsDead(self.local.clone()))
    }

    /// Returns the live proxy to `partner`, creating it if needed
    pub fn obtain_for(&self, partner: &MeshBaseIdentifier) -> MeshResult<Arc<Proxy>> {
        if partner == &self.local {
            return Err(MeshError::NotPermitted(format!(
                "mesh base {partner} cannot have a proxy to itself"
            )));
        }
        if let Some(proxy) = self.proxies.get(partner) {
            if !proxy.is_dead() {
                return Ok(proxy.clone());
            }
        }
        let base = self.base()?;
        let mut entry = self.proxies.entry(partner.clone()).or_insert_with(|| {
            Proxy::new(&base, partner.clone(), self.factory.transport_for(&self.local, partner), None)
        });
        if entry.is_dead() {
            debug!(local = %self.local, %partner, "Replacing dead proxy");
            *entry = Proxy::new(&base, partner.clone(), self.factory.transport_for(&self.local, partner), None);
        }
        Ok(entry.clone())
    }

    pub fn get(&self, partner: &MeshBaseIdentifier) -> Option<Arc<Proxy>> {
        self.proxies.get(partner).map(|proxy| proxy.clone())
    }

    pub fn proxies(&self) -> Vec<Arc<Proxy>> {
        self.proxies.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn partners(&self) -> Vec<MeshBaseIdentifier> {
        self.proxies.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.proxies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proxies.is_empty()
    }

    /// Kills the proxy to `partner` and forgets its persisted state
    pub async fn remove(&self, partner: &MeshBaseIdentifier) -> MeshResult<()> {
        let Some((_, proxy)) = self.proxies.remove(partner) else {
            return Ok(());
        };
        proxy.die();
        info!(local = %self.local, %partner, "Removed proxy");
        if let Ok(base) = self.base() {
            base.store().remove(&proxy_key(partner)).await?;
        }
        Ok(())
    }

    /// Brings back a persisted proxy and resumes its endpoint
    pub(crate) fn restore(&self, external: ExternalizedProxy) -> MeshResult<Arc<Proxy>> {
        let base = self.base()?;
        let partner = external.partner;
        let proxy = Proxy::new(
            &base,
            partner.clone(),
            self.factory.transport_for(&self.local, &partner),
            Some(external.state),
        );
        if let Some(previous) = self.proxies.insert(partner, proxy.clone()) {
            previous.die();
        }
        Ok(proxy)
    }

    /// Hands a token from `partner` to the proxy responsible for it
    pub(crate) fn deliver(
        &self,
        partner: &MeshBaseIdentifier,
        token: Token,
        content: Vec<XprisoMessage>,
    ) -> Result<(), EndpointError> {
        let unreachable = |error: MeshError| EndpointError::PartnerDead {
            endpoint: format!("{}->{}", self.local, partner),
            reason: error.to_string(),
        };
        let mut proxy = self.obtain_for(partner).map_err(unreachable)?;
        let last_received = proxy.endpoint().last_received_token();
        if token == 1 && last_received > 1 {
            // the partner lost its state and started over
            warn!(local = %self.local, %partner, last_received, "Partner restarted its token sequence, replacing proxy");
            if let Some((_, stale)) = self.proxies.remove(partner) {
                stale.die();
            }
            proxy = self.obtain_for(partner).map_err(unreachable)?;
        }
        proxy.endpoint().incoming_message(token, content)
    }

    pub(crate) fn mark_in_flight(&self, kind: RequestKind, objects: &[MeshObjectIdentifier]) -> InFlight<'_> {
        for object in objects {
            *self.in_flight.entry((kind, object.clone())).or_insert(0) += 1;
        }
        InFlight {
            requests: &self.in_flight,
            kind,
            objects: objects.to_vec(),
        }
    }

    pub(crate) fn is_in_flight(&self, kind: RequestKind, object: &MeshObjectIdentifier) -> bool {
        self.in_flight.contains_key(&(kind, object.clone()))
    }

    pub fn die_all(&self) {
        for entry in self.proxies.iter() {
            entry.value().die();
        }
        self.proxies.clear();
    }
}
