//! Replicated mesh object
//!
//! A `MeshObject` is one mesh base's replica of a graph node. Besides its
//! content (types, properties, neighbors, equivalents, timestamps) it carries
//! replication state:
//! - the partners it is replicated towards (`proxies`)
//! - which of them leads towards the home replica and towards the lock holder,
//!   `None` meaning this replica is home or holds the lock
//! - whether it gives up the lock or home status when asked
//!
//! Content is only changed inside a transaction, after the lock has been
//! obtained. Replication state is changed by proxies.

pub mod externalized;

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use self::externalized::ExternalizedMeshObject;
use crate::{
    access::UpdateKind,
    error::{MeshError, MeshResult},
    identifier::{MeshBaseIdentifier, MeshObjectIdentifier},
    meshbase::MeshBase,
    model::{EntityTypeId, PropertyTypeId, PropertyValue, RoleTypeId},
    now_millis,
    transaction::{Change, Transaction},
};

/// A relationship to another mesh object and the roles it carries on this side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neighbor {
    pub identifier: MeshObjectIdentifier,
    pub roles: BTreeSet<RoleTypeId>,
}

#[derive(Debug, Clone)]
pub(crate) struct ReplicaState {
    pub(crate) types: BTreeSet<EntityTypeId>,
    pub(crate) properties: BTreeMap<PropertyTypeId, PropertyValue>,
    pub(crate) neighbors: Vec<Neighbor>,
    pub(crate) equivalents: BTreeSet<MeshObjectIdentifier>,
    pub(crate) time_created: i64,
    pub(crate) time_updated: i64,
    pub(crate) time_read: i64,
    pub(crate) time_expires: Option<i64>,
    pub(crate) give_up_lock: bool,
    pub(crate) give_up_home_replica: bool,
    pub(crate) owner: Option<String>,
    pub(crate) proxies: Vec<MeshBaseIdentifier>,
    pub(crate) home_proxy: Option<usize>,
    pub(crate) lock_proxy: Option<usize>,
    pub(crate) dead: bool,
}

impl ReplicaState {
    /// Fresh state of a locally created object: home here, lock here
    pub(crate) fn new_local(give_up_lock: bool, give_up_home_replica: bool) -> Self {
        let now = now_millis();
        Self {
            types: BTreeSet::new(),
            properties: BTreeMap::new(),
            neighbors: Vec::new(),
            equivalents: BTreeSet::new(),
            time_created: now,
            time_updated: now,
            time_read: now,
            time_expires: None,
            give_up_lock,
            give_up_home_replica,
            owner: None,
            proxies: Vec::new(),
            home_proxy: None,
            lock_proxy: None,
            dead: false,
        }
    }

    pub(crate) fn from_externalized(external: ExternalizedMeshObject) -> Self {
        let valid = |index: Option<usize>| index.filter(|i| *i < external.proxies.len());
        let home_proxy = valid(external.home_proxy);
        let lock_proxy = valid(external.lock_proxy);
        Self {
            types: external.types.into_iter().collect(),
            properties: external.properties,
            neighbors: external.neighbors,
            equivalents: external.equivalents.into_iter().collect(),
            time_created: external.time_created,
            time_updated: external.time_updated,
            time_read: external.time_read,
            time_expires: external.time_expires,
            give_up_lock: external.give_up_lock,
            give_up_home_replica: external.give_up_home_replica,
            owner: external.owner,
            proxies: external.proxies,
            home_proxy,
            lock_proxy,
            dead: false,
        }
    }

    fn index_of(&self, partner: &MeshBaseIdentifier) -> Option<usize> {
        self.proxies.iter().position(|p| p == partner)
    }

    fn index_or_register(&mut self, partner: &MeshBaseIdentifier) -> usize {
        match self.index_of(partner) {
            Some(index) => index,
            None => {
                self.proxies.push(partner.clone());
                self.proxies.len() - 1
            }
        }
    }

    fn neighbor_mut(&mut self, identifier: &MeshObjectIdentifier) -> Option<&mut Neighbor> {
        self.neighbors
            .iter_mut()
            .find(|n| &n.identifier == identifier)
    }
}

/// Adjusts a proxy index after the proxy at `removed` was dropped from the list
fn shift_pointer(pointer: Option<usize>, removed: usize) -> Option<usize> {
    match pointer {
        Some(index) if index == removed => None,
        Some(index) if index > removed => Some(index - 1),
        other => other,
    }
}

pub struct MeshObject {
    identifier: MeshObjectIdentifier,
    base: Weak<MeshBase>,
    state: RwLock<ReplicaState>,
}

impl MeshObject {
    pub(crate) fn new(
        identifier: MeshObjectIdentifier,
        base: Weak<MeshBase>,
        state: ReplicaState,
    ) -> Self {
        Self {
            identifier,
            base,
            state: RwLock::new(state),
        }
    }

    pub fn identifier(&self) -> &MeshObjectIdentifier {
        &self.identifier
    }

    pub fn mesh_base(&self) -> Option<Arc<MeshBase>> {
        self.base.upgrade()
    }

    fn base(&self) -> MeshResult<Arc<MeshBase>> {
        self.base
            .upgrade()
            .ok_or_else(|| MeshError::MeshBaseIsDead(self.identifier.base().clone()))
    }

    pub fn is_home_object(&self) -> bool {
        self.mesh_base()
            .is_some_and(|base| self.identifier == MeshObjectIdentifier::home_of(base.identifier()))
    }

    pub fn is_dead(&self) -> bool {
        self.state.read().dead
    }

    fn check_alive(&self) -> MeshResult<()> {
        if self.is_dead() {
            Err(MeshError::ObjectIsDead(self.identifier.clone()))
        } else {
            Ok(())
        }
    }

    // ========================================================================
    // Content
    // ========================================================================

    pub fn types(&self) -> Vec<EntityTypeId> {
        self.state.read().types.iter().cloned().collect()
    }

    pub fn is_blessed_by(&self, entity_type: &EntityTypeId) -> bool {
        self.state.read().types.contains(entity_type)
    }

    pub fn property(&self, property: &PropertyTypeId) -> Option<PropertyValue> {
        let mut state = self.state.write();
        state.time_read = now_millis();
        state.properties.get(property).cloned()
    }

    pub fn properties(&self) -> BTreeMap<PropertyTypeId, PropertyValue> {
        self.state.read().properties.clone()
    }

    pub fn neighbors(&self) -> Vec<MeshObjectIdentifier> {
        self.state
            .read()
            .neighbors
            .iter()
            .map(|n| n.identifier.clone())
            .collect()
    }

    pub fn is_related_to(&self, neighbor: &MeshObjectIdentifier) -> bool {
        self.state
            .read()
            .neighbors
            .iter()
            .any(|n| &n.identifier == neighbor)
    }

    /// Roles of the relationship to `neighbor`, `None` if not related
    pub fn roles_with(&self, neighbor: &MeshObjectIdentifier) -> Option<BTreeSet<RoleTypeId>> {
        self.state
            .read()
            .neighbors
            .iter()
            .find(|n| &n.identifier == neighbor)
            .map(|n| n.roles.clone())
    }

    pub fn equivalents(&self) -> Vec<MeshObjectIdentifier> {
        self.state.read().equivalents.iter().cloned().collect()
    }

    pub fn time_created(&self) -> i64 {
        self.state.read().time_created
    }

    pub fn time_updated(&self) -> i64 {
        self.state.read().time_updated
    }

    pub fn time_read(&self) -> i64 {
        self.state.read().time_read
    }

    pub fn time_expires(&self) -> Option<i64> {
        self.state.read().time_expires
    }

    pub fn owner(&self) -> Option<String> {
        self.state.read().owner.clone()
    }

    pub(crate) fn set_owner(&self, owner: Option<String>) {
        self.state.write().owner = owner;
    }

    // ========================================================================
    // Replication state
    // ========================================================================

    pub fn has_lock(&self) -> bool {
        self.state.read().lock_proxy.is_none()
    }

    pub fn is_home_replica(&self) -> bool {
        self.state.read().home_proxy.is_none()
    }

    pub fn proxy_towards_lock(&self) -> Option<MeshBaseIdentifier> {
        let state = self.state.read();
        state.lock_proxy.map(|index| state.proxies[index].clone())
    }

    pub fn proxy_towards_home(&self) -> Option<MeshBaseIdentifier> {
        let state = self.state.read();
        state.home_proxy.map(|index| state.proxies[index].clone())
    }

    pub fn proxies(&self) -> Vec<MeshBaseIdentifier> {
        self.state.read().proxies.clone()
    }

    pub fn has_replicas(&self) -> bool {
        !self.state.read().proxies.is_empty()
    }

    pub fn has_replica_in_direction(&self, partner: &MeshBaseIdentifier) -> bool {
        self.state.read().proxies.contains(partner)
    }

    pub fn will_give_up_lock(&self) -> bool {
        self.state.read().give_up_lock
    }

    pub fn will_give_up_home_replica(&self) -> bool {
        self.state.read().give_up_home_replica
    }

    pub fn set_will_give_up_lock(&self, give_up: bool) {
        self.state.write().give_up_lock = give_up;
        self.schedule_flush();
    }

    pub fn set_will_give_up_home_replica(&self, give_up: bool) {
        self.state.write().give_up_home_replica = give_up;
        self.schedule_flush();
    }

    /// Adds `partner` to the replication set; false if it was there already
    pub(crate) fn register_replication_towards(&self, partner: &MeshBaseIdentifier) -> bool {
        let mut state = self.state.write();
        if state.proxies.contains(partner) {
            return false;
        }
        state.proxies.push(partner.clone());
        true
    }

    /// Removes `partner` from the replication set, shifting the pointers
    pub(crate) fn unregister_replication_towards(&self, partner: &MeshBaseIdentifier) -> bool {
        let mut state = self.state.write();
        let Some(removed) = state.index_of(partner) else {
            return false;
        };
        state.proxies.remove(removed);
        if state.home_proxy == Some(removed) {
            warn!(object = %self.identifier, %partner, "Lost the path towards home, assuming home here");
        }
        if state.lock_proxy == Some(removed) {
            warn!(object = %self.identifier, %partner, "Lost the path towards the lock, assuming lock here");
        }
        state.home_proxy = shift_pointer(state.home_proxy, removed);
        state.lock_proxy = shift_pointer(state.lock_proxy, removed);
        true
    }

    /// Hands the lock to `partner`; unless forced, only if we are willing to
    pub(crate) fn surrender_lock(&self, partner: &MeshBaseIdentifier, force: bool) -> bool {
        let was_here = {
            let mut state = self.state.write();
            if !force && !state.give_up_lock {
                return false;
            }
            let was_here = state.lock_proxy.is_none();
            let index = state.index_or_register(partner);
            state.lock_proxy = Some(index);
            was_here
        };
        if was_here {
            debug!(object = %self.identifier, %partner, "Lock surrendered");
            if let Some(base) = self.mesh_base() {
                base.listeners()
                    .fire("lock_lost", |l| l.lock_lost(&self.identifier));
            }
        }
        true
    }

    /// Receives the lock from `partner`
    pub(crate) fn push_lock(&self, partner: &MeshBaseIdentifier) {
        let was_elsewhere = {
            let mut state = self.state.write();
            let expected = state.index_of(partner);
            if state.lock_proxy.is_some() && state.lock_proxy != expected {
                warn!(object = %self.identifier, %partner, "Lock pushed by a partner we did not expect it from");
            }
            let was_elsewhere = state.lock_proxy.is_some();
            state.lock_proxy = None;
            was_elsewhere
        };
        if was_elsewhere {
            if let Some(base) = self.mesh_base() {
                base.listeners()
                    .fire("lock_gained", |l| l.lock_gained(&self.identifier));
            }
        }
    }

    /// Hands home status to `partner`; unless forced, only if we are willing to
    pub(crate) fn surrender_home_replica(&self, partner: &MeshBaseIdentifier, force: bool) -> bool {
        let was_here = {
            let mut state = self.state.write();
            if !force && !state.give_up_home_replica {
                return false;
            }
            let was_here = state.home_proxy.is_none();
            let index = state.index_or_register(partner);
            state.home_proxy = Some(index);
            was_here
        };
        if was_here {
            if let Some(base) = self.mesh_base() {
                base.listeners()
                    .fire("home_replica_lost", |l| l.home_replica_lost(&self.identifier));
            }
        }
        true
    }

    pub(crate) fn push_home_replica(&self, partner: &MeshBaseIdentifier) {
        let was_elsewhere = {
            let mut state = self.state.write();
            if state.home_proxy.is_some() && state.home_proxy != state.index_of(partner) {
                warn!(object = %self.identifier, %partner, "Home pushed by a partner we did not expect it from");
            }
            let was_elsewhere = state.home_proxy.is_some();
            state.home_proxy = None;
            was_elsewhere
        };
        if was_elsewhere {
            if let Some(base) = self.mesh_base() {
                base.listeners()
                    .fire("home_replica_gained", |l| l.home_replica_gained(&self.identifier));
            }
        }
    }

    /// Points home (and the lock, unless held here) towards `partner`
    pub(crate) fn make_replica_from(&self, partner: &MeshBaseIdentifier) {
        let mut state = self.state.write();
        let index = state.index_or_register(partner);
        state.home_proxy = Some(index);
        if state.lock_proxy.is_some() {
            state.lock_proxy = Some(index);
        }
    }

    /// Takes the lock back unconditionally; returns the partner that had it
    pub(crate) fn reclaim_lock(&self) -> Option<MeshBaseIdentifier> {
        let previous = {
            let mut state = self.state.write();
            let previous = state.lock_proxy.map(|index| state.proxies[index].clone());
            state.lock_proxy = None;
            previous
        };
        if previous.is_some() {
            if let Some(base) = self.mesh_base() {
                base.listeners()
                    .fire("lock_gained", |l| l.lock_gained(&self.identifier));
            }
        }
        previous
    }

    pub(crate) fn mark_dead(&self) {
        self.state.write().dead = true;
    }

    fn schedule_flush(&self) {
        if let Some(base) = self.mesh_base() {
            base.schedule_flush(self.identifier.clone());
        }
    }

    // ========================================================================
    // Externalization
    // ========================================================================

    /// Externalized form; without captured proxies the receiver treats us as home
    pub fn as_externalized(&self, capture_proxies: bool) -> ExternalizedMeshObject {
        let state = self.state.read();
        let (proxies, home_proxy, lock_proxy) = if capture_proxies {
            (state.proxies.clone(), state.home_proxy, state.lock_proxy)
        } else {
            (Vec::new(), None, None)
        };
        ExternalizedMeshObject {
            identifier: self.identifier.clone(),
            types: state.types.iter().cloned().collect(),
            properties: state.properties.clone(),
            neighbors: state.neighbors.clone(),
            equivalents: state.equivalents.iter().cloned().collect(),
            time_created: state.time_created,
            time_updated: state.time_updated,
            time_read: state.time_read,
            time_expires: state.time_expires,
            give_up_lock: state.give_up_lock,
            give_up_home_replica: state.give_up_home_replica,
            owner: state.owner.clone(),
            proxies,
            home_proxy,
            lock_proxy,
        }
    }

    // ========================================================================
    // Lock and home replica
    // ========================================================================

    /// Obtains the lock if necessary; false if the lock holder refused
    pub async fn try_to_obtain_lock(
        self: &Arc<Self>,
        timeout: Option<Duration>,
    ) -> MeshResult<bool> {
        if self.has_lock() {
            return Ok(true);
        }
        self.check_alive()?;
        let base = self.base()?;
        let Some(partner) = self.proxy_towards_lock() else {
            return Ok(true);
        };
        let timeout = timeout.unwrap_or_else(|| base.config().obtain_lock_timeout());
        let proxy = base.proxy_manager().obtain_for(&partner)?;
        proxy
            .try_to_obtain_locks(std::slice::from_ref(self), timeout)
            .await?;
        Ok(self.has_lock())
    }

    /// Takes the lock immediately and tells the previous holder's direction
    pub async fn force_obtain_lock(self: &Arc<Self>) -> MeshResult<()> {
        self.check_alive()?;
        let base = self.base()?;
        let Some(previous) = self.reclaim_lock() else {
            return Ok(());
        };
        let proxy = base.proxy_manager().obtain_for(&previous)?;
        proxy.force_obtain_locks(std::slice::from_ref(self))?;
        self.schedule_flush();
        Ok(())
    }

    /// Hands the lock to `partner` if we hold it
    pub async fn try_to_push_lock(
        self: &Arc<Self>,
        partner: &MeshBaseIdentifier,
        timeout: Option<Duration>,
    ) -> MeshResult<bool> {
        if !self.has_lock() {
            return Ok(false);
        }
        let base = self.base()?;
        let timeout = timeout.unwrap_or_else(|| base.config().obtain_lock_timeout());
        let proxy = base.proxy_manager().obtain_for(partner)?;
        proxy
            .try_to_push_locks(std::slice::from_ref(self), timeout)
            .await?;
        Ok(!self.has_lock())
    }

    pub async fn try_to_obtain_home_replica(
        self: &Arc<Self>,
        timeout: Option<Duration>,
    ) -> MeshResult<bool> {
        if self.is_home_replica() {
            return Ok(true);
        }
        self.check_alive()?;
        let base = self.base()?;
        let Some(partner) = self.proxy_towards_home() else {
            return Ok(true);
        };
        let timeout = timeout.unwrap_or_else(|| base.config().obtain_lock_timeout());
        let proxy = base.proxy_manager().obtain_for(&partner)?;
        proxy
            .try_to_obtain_home_replicas(std::slice::from_ref(self), timeout)
            .await?;
        Ok(self.is_home_replica())
    }

    pub async fn try_to_push_home_replica(
        self: &Arc<Self>,
        partner: &MeshBaseIdentifier,
        timeout: Option<Duration>,
    ) -> MeshResult<bool> {
        if !self.is_home_replica() {
            return Ok(false);
        }
        let base = self.base()?;
        let timeout = timeout.unwrap_or_else(|| base.config().obtain_lock_timeout());
        let proxy = base.proxy_manager().obtain_for(partner)?;
        proxy
            .try_to_push_home_replicas(std::slice::from_ref(self), timeout)
            .await?;
        Ok(!self.is_home_replica())
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Checks the transaction, obtains the lock and asks the access manager
    pub(crate) async fn prepare_update(
        self: &Arc<Self>,
        tx: &Transaction,
        kind: UpdateKind,
    ) -> MeshResult<Arc<MeshBase>> {
        let base = self.base()?;
        tx.check(base.identifier())?;
        self.check_alive()?;
        if !self.try_to_obtain_lock(None).await? {
            return Err(MeshError::CannotObtainLock(self.identifier.clone()));
        }
        base.access_manager().check_permitted_update(self, kind)?;
        Ok(base)
    }

    pub async fn bless(self: &Arc<Self>, tx: &Transaction, types: &[EntityTypeId]) -> MeshResult<()> {
        let base = self.prepare_update(tx, UpdateKind::Bless).await?;
        for entity_type in types {
            base.types().resolve_entity_type(entity_type)?;
            if self.is_blessed_by(entity_type) {
                return Err(MeshError::BlessedAlready {
                    object: self.identifier.clone(),
                    entity_type: entity_type.clone(),
                });
            }
        }
        self.apply_and_record(
            tx,
            Change::TypesAdded {
                object: self.identifier.clone(),
                types: types.to_vec(),
            },
        );
        Ok(())
    }

    /// Removes `types`, together with properties only those types declared
    pub async fn unbless(self: &Arc<Self>, tx: &Transaction, types: &[EntityTypeId]) -> MeshResult<()> {
        let base = self.prepare_update(tx, UpdateKind::Unbless).await?;
        for entity_type in types {
            if !self.is_blessed_by(entity_type) {
                return Err(MeshError::NotBlessed {
                    object: self.identifier.clone(),
                    entity_type: entity_type.clone(),
                });
            }
        }
        let remaining: Vec<EntityTypeId> = self
            .types()
            .into_iter()
            .filter(|t| !types.contains(t))
            .collect();
        let still_declared = base.types().declared_properties(&remaining);
        let orphaned: Vec<PropertyTypeId> = base
            .types()
            .declared_properties(types)
            .into_iter()
            .filter(|p| !still_declared.contains(p))
            .filter(|p| self.state.read().properties.contains_key(p))
            .collect();
        for property in orphaned {
            let old_value = self.state.read().properties.get(&property).cloned();
            self.apply_and_record(
                tx,
                Change::PropertyChanged {
                    object: self.identifier.clone(),
                    property,
                    old_value,
                    new_value: None,
                },
            );
        }
        self.apply_and_record(
            tx,
            Change::TypesRemoved {
                object: self.identifier.clone(),
                types: types.to_vec(),
            },
        );
        Ok(())
    }

    /// Sets or (with `None`) removes a property value; returns the old value
    pub async fn set_property(
        self: &Arc<Self>,
        tx: &Transaction,
        property: &PropertyTypeId,
        value: Option<PropertyValue>,
    ) -> MeshResult<Option<PropertyValue>> {
        let base = self.prepare_update(tx, UpdateKind::SetProperty).await?;
        base.types().resolve_property_type(property)?;
        if !base
            .types()
            .is_property_allowed(&self.state.read().types, property)
        {
            return Err(MeshError::IllegalPropertyType {
                object: self.identifier.clone(),
                property: property.clone(),
            });
        }
        let old_value = self.state.read().properties.get(property).cloned();
        if old_value == value {
            return Ok(old_value);
        }
        self.apply_and_record(
            tx,
            Change::PropertyChanged {
                object: self.identifier.clone(),
                property: property.clone(),
                old_value: old_value.clone(),
                new_value: value,
            },
        );
        Ok(old_value)
    }

    pub async fn relate(self: &Arc<Self>, tx: &Transaction, neighbor: &Arc<MeshObject>) -> MeshResult<()> {
        if neighbor.identifier == self.identifier {
            return Err(MeshError::CannotRelateToItself {
                object: self.identifier.clone(),
            });
        }
        self.prepare_update(tx, UpdateKind::Relate).await?;
        neighbor.prepare_update(tx, UpdateKind::Relate).await?;
        if self.is_related_to(&neighbor.identifier) {
            return Err(MeshError::RelatedAlready {
                object: self.identifier.clone(),
                neighbor: neighbor.identifier.clone(),
            });
        }
        self.apply_and_record(
            tx,
            Change::NeighborAdded {
                object: self.identifier.clone(),
                neighbor: neighbor.identifier.clone(),
                roles: Vec::new(),
            },
        );
        neighbor.apply_and_record(
            tx,
            Change::NeighborAdded {
                object: neighbor.identifier.clone(),
                neighbor: self.identifier.clone(),
                roles: Vec::new(),
            },
        );
        Ok(())
    }

    /// Removes the relationship on this side and, if the neighbor is local, on its side
    pub async fn unrelate(self: &Arc<Self>, tx: &Transaction, neighbor: &MeshObjectIdentifier) -> MeshResult<()> {
        let base = self.prepare_update(tx, UpdateKind::Unrelate).await?;
        if !self.is_related_to(neighbor) {
            return Err(MeshError::NotRelated {
                object: self.identifier.clone(),
                neighbor: neighbor.clone(),
            });
        }
        let other = base.find_mesh_object(neighbor);
        if let Some(other) = &other {
            other.prepare_update(tx, UpdateKind::Unrelate).await?;
        }
        self.apply_and_record(
            tx,
            Change::NeighborRemoved {
                object: self.identifier.clone(),
                neighbor: neighbor.clone(),
            },
        );
        if let Some(other) = other {
            if other.is_related_to(&self.identifier) {
                other.apply_and_record(
                    tx,
                    Change::NeighborRemoved {
                        object: other.identifier.clone(),
                        neighbor: self.identifier.clone(),
                    },
                );
            }
        }
        Ok(())
    }

    pub async fn bless_role(
        self: &Arc<Self>,
        tx: &Transaction,
        neighbor: &MeshObjectIdentifier,
        roles: &[RoleTypeId],
    ) -> MeshResult<()> {
        let base = self.prepare_update(tx, UpdateKind::BlessRole).await?;
        let Some(existing) = self.roles_with(neighbor) else {
            return Err(MeshError::NotRelated {
                object: self.identifier.clone(),
                neighbor: neighbor.clone(),
            });
        };
        for role in roles {
            base.types().resolve_role_type(role)?;
        }
        let added: Vec<RoleTypeId> = roles
            .iter()
            .filter(|r| !existing.contains(*r))
            .cloned()
            .collect();
        if !added.is_empty() {
            self.apply_and_record(
                tx,
                Change::RolesAdded {
                    object: self.identifier.clone(),
                    neighbor: neighbor.clone(),
                    roles: added,
                },
            );
        }
        Ok(())
    }

    pub async fn unbless_role(
        self: &Arc<Self>,
        tx: &Transaction,
        neighbor: &MeshObjectIdentifier,
        roles: &[RoleTypeId],
    ) -> MeshResult<()> {
        self.prepare_update(tx, UpdateKind::UnblessRole).await?;
        let Some(existing) = self.roles_with(neighbor) else {
            return Err(MeshError::NotRelated {
                object: self.identifier.clone(),
                neighbor: neighbor.clone(),
            });
        };
        let removed: Vec<RoleTypeId> = roles
            .iter()
            .filter(|r| existing.contains(*r))
            .cloned()
            .collect();
        if !removed.is_empty() {
            self.apply_and_record(
                tx,
                Change::RolesRemoved {
                    object: self.identifier.clone(),
                    neighbor: neighbor.clone(),
                    roles: removed,
                },
            );
        }
        Ok(())
    }

    /// Declares `other` to be the same real-world thing
    pub async fn add_as_equivalent(self: &Arc<Self>, tx: &Transaction, other: &Arc<MeshObject>) -> MeshResult<()> {
        if other.identifier == self.identifier {
            return Ok(());
        }
        self.prepare_update(tx, UpdateKind::Equivalence).await?;
        other.prepare_update(tx, UpdateKind::Equivalence).await?;
        if !self.state.read().equivalents.contains(&other.identifier) {
            self.apply_and_record(
                tx,
                Change::EquivalentAdded {
                    object: self.identifier.clone(),
                    equivalent: other.identifier.clone(),
                },
            );
        }
        if !other.state.read().equivalents.contains(&self.identifier) {
            other.apply_and_record(
                tx,
                Change::EquivalentAdded {
                    object: other.identifier.clone(),
                    equivalent: self.identifier.clone(),
                },
            );
        }
        Ok(())
    }

    /// Leaves the equivalence set
    pub async fn remove_as_equivalent(self: &Arc<Self>, tx: &Transaction) -> MeshResult<()> {
        let base = self.prepare_update(tx, UpdateKind::Equivalence).await?;
        for equivalent in self.equivalents() {
            if let Some(other) = base.find_mesh_object(&equivalent) {
                other.prepare_update(tx, UpdateKind::Equivalence).await?;
                other.apply_and_record(
                    tx,
                    Change::EquivalentRemoved {
                        object: other.identifier.clone(),
                        equivalent: self.identifier.clone(),
                    },
                );
            }
            self.apply_and_record(
                tx,
                Change::EquivalentRemoved {
                    object: self.identifier.clone(),
                    equivalent,
                },
            );
        }
        Ok(())
    }

    /// Sets when this object expires; not replicated
    pub async fn set_time_expires(self: &Arc<Self>, tx: &Transaction, expires: Option<i64>) -> MeshResult<()> {
        self.prepare_update(tx, UpdateKind::Expiration).await?;
        self.state.write().time_expires = expires;
        self.schedule_flush();
        Ok(())
    }

    // ========================================================================
    // Change application
    // ========================================================================

    /// Applies `change` to the content and records it in `tx`
    pub(crate) fn apply_and_record(&self, tx: &Transaction, change: Change) {
        if self.apply(&change) {
            tx.record(change, self.proxies());
        }
    }

    /// Applies a content change; false if it does not apply to this object
    pub(crate) fn apply(&self, change: &Change) -> bool {
        let mut state = self.state.write();
        match change {
            Change::TypesAdded { types, .. } => {
                state.types.extend(types.iter().cloned());
            }
            Change::TypesRemoved { types, .. } => {
                for entity_type in types {
                    state.types.remove(entity_type);
                }
            }
            Change::PropertyChanged {
                property,
                new_value,
                ..
            } => match new_value {
                Some(value) => {
                    state.properties.insert(property.clone(), value.clone());
                }
                None => {
                    state.properties.remove(property);
                }
            },
            Change::NeighborAdded {
                neighbor, roles, ..
            } => match state.neighbor_mut(neighbor) {
                Some(existing) => existing.roles.extend(roles.iter().cloned()),
                None => state.neighbors.push(Neighbor {
                    identifier: neighbor.clone(),
                    roles: roles.iter().cloned().collect(),
                }),
            },
            Change::NeighborRemoved { neighbor, .. } => {
                state.neighbors.retain(|n| &n.identifier != neighbor);
            }
            Change::RolesAdded {
                neighbor, roles, ..
            } => match state.neighbor_mut(neighbor) {
                Some(existing) => existing.roles.extend(roles.iter().cloned()),
                None => return false,
            },
            Change::RolesRemoved {
                neighbor, roles, ..
            } => match state.neighbor_mut(neighbor) {
                Some(existing) => existing.roles.retain(|r| !roles.contains(r)),
                None => return false,
            },
            Change::EquivalentAdded { equivalent, .. } => {
                state.equivalents.insert(equivalent.clone());
            }
            Change::EquivalentRemoved { equivalent, .. } => {
                state.equivalents.remove(equivalent);
            }
            Change::Created { .. }
            | Change::ReplicaCreated { .. }
            | Change::Deleted { .. }
            | Change::ReplicaPurged { .. } => return false,
        }
        state.time_updated = now_millis();
        true
    }

    /// Replaces content and pointers from a conveyed replica, recording differences
    pub(crate) fn resynchronize_from(&self, tx: &Transaction, external: &ExternalizedMeshObject) {
        let (types, properties, neighbors, equivalents) = {
            let state = self.state.read();
            (
                state.types.clone(),
                state.properties.clone(),
                state.neighbors.clone(),
                state.equivalents.clone(),
            )
        };
        let object = self.identifier.clone();

        let added: Vec<EntityTypeId> = external
            .types
            .iter()
            .filter(|t| !types.contains(*t))
            .cloned()
            .collect();
        if !added.is_empty() {
            self.apply_and_record(tx, Change::TypesAdded { object: object.clone(), types: added });
        }
        for (property, value) in &external.properties {
            if properties.get(property) != Some(value) {
                self.apply_and_record(
                    tx,
                    Change::PropertyChanged {
                        object: object.clone(),
                        property: property.clone(),
                        old_value: properties.get(property).cloned(),
                        new_value: Some(value.clone()),
                    },
                );
            }
        }
        for (property, value) in &properties {
            if !external.properties.contains_key(property) {
                self.apply_and_record(
                    tx,
                    Change::PropertyChanged {
                        object: object.clone(),
                        property: property.clone(),
                        old_value: Some(value.clone()),
                        new_value: None,
                    },
                );
            }
        }
        for neighbor in &external.neighbors {
            match neighbors.iter().find(|n| n.identifier == neighbor.identifier) {
                None => self.apply_and_record(
                    tx,
                    Change::NeighborAdded {
                        object: object.clone(),
                        neighbor: neighbor.identifier.clone(),
                        roles: neighbor.roles.iter().cloned().collect(),
                    },
                ),
                Some(existing) if existing.roles != neighbor.roles => {
                    let removed: Vec<RoleTypeId> =
                        existing.roles.difference(&neighbor.roles).cloned().collect();
                    let added: Vec<RoleTypeId> =
                        neighbor.roles.difference(&existing.roles).cloned().collect();
                    if !added.is_empty() {
                        self.apply_and_record(
                            tx,
                            Change::RolesAdded {
                                object: object.clone(),
                                neighbor: neighbor.identifier.clone(),
                                roles: added,
                            },
                        );
                    }
                    if !removed.is_empty() {
                        self.apply_and_record(
                            tx,
                            Change::RolesRemoved {
                                object: object.clone(),
                                neighbor: neighbor.identifier.clone(),
                                roles: removed,
                            },
                        );
                    }
                }
                Some(_) => {}
            }
        }
        for neighbor in &neighbors {
            if !external
                .neighbors
                .iter()
                .any(|n| n.identifier == neighbor.identifier)
            {
                self.apply_and_record(
                    tx,
                    Change::NeighborRemoved {
                        object: object.clone(),
                        neighbor: neighbor.identifier.clone(),
                    },
                );
            }
        }
        for equivalent in &external.equivalents {
            if !equivalents.contains(equivalent) {
                self.apply_and_record(
                    tx,
                    Change::EquivalentAdded {
                        object: object.clone(),
                        equivalent: equivalent.clone(),
                    },
                );
            }
        }
        for equivalent in &equivalents {
            if !external.equivalents.contains(equivalent) {
                self.apply_and_record(
                    tx,
                    Change::EquivalentRemoved {
                        object: object.clone(),
                        equivalent: equivalent.clone(),
                    },
                );
            }
        }
        let removed: Vec<EntityTypeId> = types
            .iter()
            .filter(|t| !external.types.contains(*t))
            .cloned()
            .collect();
        if !removed.is_empty() {
            self.apply_and_record(tx, Change::TypesRemoved { object, types: removed });
        }

        let mut state = self.state.write();
        state.time_updated = external.time_updated.max(state.time_updated);
        state.time_expires = external.time_expires;
    }
}

impl fmt::Debug for MeshObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("MeshObject")
            .field("identifier", &self.identifier)
            .field("types", &state.types)
            .field("proxies", &state.proxies)
            .field("home_proxy", &state.home_proxy)
            .field("lock_proxy", &state.lock_proxy)
            .field("dead", &state.dead)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(proxies: &[&str], home: Option<usize>, lock: Option<usize>) -> MeshObject {
        let mut state = ReplicaState::new_local(true, true);
        state.proxies = proxies.iter().map(|p| MeshBaseIdentifier::from(*p)).collect();
        state.home_proxy = home;
        state.lock_proxy = lock;
        MeshObject::new(
            MeshObjectIdentifier::new("a".into(), "x"),
            Weak::new(),
            state,
        )
    }

    #[test]
    fn test_unregister_shifts_pointers() {
        let object = replica(&["b", "c", "d"], Some(2), Some(1));
        assert!(object.unregister_replication_towards(&"b".into()));
        assert_eq!(object.proxy_towards_home(), Some("d".into()));
        assert_eq!(object.proxy_towards_lock(), Some("c".into()));

        assert!(object.unregister_replication_towards(&"c".into()));
        assert!(object.has_lock());
        assert_eq!(object.proxy_towards_home(), Some("d".into()));
        assert!(!object.unregister_replication_towards(&"c".into()));
    }

    #[test]
    fn test_surrender_and_push_lock() {
        let object = replica(&[], None, None);
        assert!(object.has_lock());
        assert!(object.surrender_lock(&"b".into(), false));
        assert_eq!(object.proxy_towards_lock(), Some("b".into()));
        assert!(object.has_replica_in_direction(&"b".into()));
        object.push_lock(&"b".into());
        assert!(object.has_lock());

        object.state.write().give_up_lock = false;
        assert!(!object.surrender_lock(&"b".into(), false));
        assert!(object.has_lock());
        assert!(object.surrender_lock(&"b".into(), true));
        assert!(!object.has_lock());
    }

    #[test]
    fn test_make_replica_keeps_held_lock() {
        let object = replica(&["b"], Some(0), None);
        object.make_replica_from(&"h".into());
        assert_eq!(object.proxy_towards_home(), Some("h".into()));
        assert!(object.has_lock());

        let object = replica(&["b"], Some(0), Some(0));
        object.make_replica_from(&"h".into());
        assert_eq!(object.proxy_towards_lock(), Some("h".into()));
    }

    #[test]
    fn test_externalized_without_proxies_points_at_sender() {
        let object = replica(&["b", "c"], Some(1), Some(0));
        let captured = object.as_externalized(true);
        assert_eq!(captured.proxy_towards_home(), Some(&"c".into()));
        let bare = object.as_externalized(false);
        assert!(bare.proxies.is_empty());
        assert!(bare.proxy_towards_home().is_none());
    }

    #[test]
    fn test_apply_content_changes() {
        let object = replica(&[], None, None);
        let id = object.identifier().clone();
        let neighbor = MeshObjectIdentifier::new("a".into(), "y");
        assert!(object.apply(&Change::TypesAdded { object: id.clone(), types: vec!["T".into()] }));
        assert!(object.apply(&Change::NeighborAdded {
            object: id.clone(),
            neighbor: neighbor.clone(),
            roles: vec!["R".into()],
        }));
        assert!(object.apply(&Change::RolesRemoved {
            object: id.clone(),
            neighbor: neighbor.clone(),
            roles: vec!["R".into()],
        }));
        assert_eq!(object.roles_with(&neighbor), Some(BTreeSet::new()));
        assert!(!object.apply(&Change::RolesAdded {
            object: id.clone(),
            neighbor: MeshObjectIdentifier::new("a".into(), "z"),
            roles: vec!["R".into()],
        }));
        assert!(!object.apply(&Change::Deleted { object: id }));
        assert!(object.is_blessed_by(&"T".into()));
    }
}
