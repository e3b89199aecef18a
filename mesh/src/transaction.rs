//! Transactions and change events
//!
//! Every mutation of a mesh object happens inside a `Transaction` obtained from
//! its mesh base. Application transactions of one mesh base are serialized by
//! an async mutex. Transactions that apply changes received from a partner do
//! not take it; they only touch replicas whose lock lives elsewhere.
//!
//! Changes are buffered in the transaction and published at commit: persisted,
//! forwarded to the proxies that replicate the affected objects, and handed to
//! mesh base listeners.

use std::{
    collections::BTreeSet,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::{
    error::{MeshError, MeshResult},
    identifier::{MeshBaseIdentifier, MeshObjectIdentifier},
    meshbase::MeshBase,
    model::{EntityTypeId, PropertyTypeId, PropertyValue, RoleTypeId},
    now_millis,
};

/// One recorded modification of a mesh object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    Created {
        object: MeshObjectIdentifier,
    },
    ReplicaCreated {
        object: MeshObjectIdentifier,
    },
    Deleted {
        object: MeshObjectIdentifier,
    },
    ReplicaPurged {
        object: MeshObjectIdentifier,
    },
    TypesAdded {
        object: MeshObjectIdentifier,
        types: Vec<EntityTypeId>,
    },
    TypesRemoved {
        object: MeshObjectIdentifier,
        types: Vec<EntityTypeId>,
    },
    PropertyChanged {
        object: MeshObjectIdentifier,
        property: PropertyTypeId,
        old_value: Option<PropertyValue>,
        new_value: Option<PropertyValue>,
    },
    NeighborAdded {
        object: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
        roles: Vec<RoleTypeId>,
    },
    NeighborRemoved {
        object: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
    },
    RolesAdded {
        object: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
        roles: Vec<RoleTypeId>,
    },
    RolesRemoved {
        object: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
        roles: Vec<RoleTypeId>,
    },
    EquivalentAdded {
        object: MeshObjectIdentifier,
        equivalent: MeshObjectIdentifier,
    },
    EquivalentRemoved {
        object: MeshObjectIdentifier,
        equivalent: MeshObjectIdentifier,
    },
}

impl Change {
    pub fn affected_object(&self) -> &MeshObjectIdentifier {
        match self {
            Change::Created { object }
            | Change::ReplicaCreated { object }
            | Change::Deleted { object }
            | Change::ReplicaPurged { object }
            | Change::TypesAdded { object, .. }
            | Change::TypesRemoved { object, .. }
            | Change::PropertyChanged { object, .. }
            | Change::NeighborAdded { object, .. }
            | Change::NeighborRemoved { object, .. }
            | Change::RolesAdded { object, .. }
            | Change::RolesRemoved { object, .. }
            | Change::EquivalentAdded { object, .. }
            | Change::EquivalentRemoved { object, .. } => object,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Change::Created { .. } => "created",
            Change::ReplicaCreated { .. } => "replica_created",
            Change::Deleted { .. } => "deleted",
            Change::ReplicaPurged { .. } => "replica_purged",
            Change::TypesAdded { .. } => "types_added",
            Change::TypesRemoved { .. } => "types_removed",
            Change::PropertyChanged { .. } => "property_changed",
            Change::NeighborAdded { .. } => "neighbor_added",
            Change::NeighborRemoved { .. } => "neighbor_removed",
            Change::RolesAdded { .. } => "roles_added",
            Change::RolesRemoved { .. } => "roles_removed",
            Change::EquivalentAdded { .. } => "equivalent_added",
            Change::EquivalentRemoved { .. } => "equivalent_removed",
        }
    }

    /// Order in which received changes are applied: additions before
    /// properties, properties before removals, deletions last
    pub(crate) fn apply_rank(&self) -> u8 {
        match self {
            Change::Created { .. } | Change::ReplicaCreated { .. } => 0,
            Change::TypesAdded { .. } => 1,
            Change::EquivalentAdded { .. } => 2,
            Change::NeighborAdded { .. } => 3,
            Change::RolesAdded { .. } => 4,
            Change::PropertyChanged { .. } => 5,
            Change::RolesRemoved { .. } => 6,
            Change::NeighborRemoved { .. } => 7,
            Change::EquivalentRemoved { .. } => 8,
            Change::TypesRemoved { .. } => 9,
            Change::Deleted { .. } | Change::ReplicaPurged { .. } => 10,
        }
    }
}

/// A change together with where it came from and where it must go
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub change: Change,
    /// Partner whose message caused the change, `None` for local changes
    pub origin: Option<MeshBaseIdentifier>,
    pub time: i64,
    /// Partners the affected object was replicated towards when the change was recorded
    #[serde(skip)]
    pub(crate) directions: Vec<MeshBaseIdentifier>,
}

impl ChangeEvent {
    /// Whether this change has to be forwarded to `partner`
    pub fn should_be_sent_to(&self, partner: &MeshBaseIdentifier) -> bool {
        self.origin.as_ref() != Some(partner) && self.directions.contains(partner)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    events: Vec<ChangeEvent>,
}

impl ChangeSet {
    pub fn new(events: Vec<ChangeEvent>) -> Self {
        Self { events }
    }

    pub fn events(&self) -> &[ChangeEvent] {
        &self.events
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangeEvent> {
        self.events.iter()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Identifiers of every object touched, in first-touch order
    pub fn affected_objects(&self) -> Vec<MeshObjectIdentifier> {
        let mut seen = BTreeSet::new();
        self.events
            .iter()
            .map(|event| event.change.affected_object())
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .collect()
    }
}

// ============================================================================
// Transaction
// ============================================================================

pub struct Transaction {
    base: Arc<MeshBase>,
    origin: Option<MeshBaseIdentifier>,
    changes: Mutex<Vec<ChangeEvent>>,
    active: AtomicBool,
    _guard: Option<OwnedMutexGuard<()>>,
}

impl Transaction {
    pub(crate) fn new(
        base: Arc<MeshBase>,
        origin: Option<MeshBaseIdentifier>,
        guard: Option<OwnedMutexGuard<()>>,
    ) -> Self {
        Self {
            base,
            origin,
            changes: Mutex::new(Vec::new()),
            active: AtomicBool::new(true),
            _guard: guard,
        }
    }

    pub fn mesh_base(&self) -> &Arc<MeshBase> {
        &self.base
    }

    pub fn origin(&self) -> Option<&MeshBaseIdentifier> {
        self.origin.as_ref()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Fails unless this transaction is active and belongs to `base`
    pub(crate) fn check(&self, base: &MeshBaseIdentifier) -> MeshResult<()> {
        if !self.is_active() {
            return Err(MeshError::TransactionClosed(self.base.identifier().clone()));
        }
        if self.base.identifier() != base {
            return Err(MeshError::WrongTransaction {
                expected: base.clone(),
                actual: self.base.identifier().clone(),
            });
        }
        Ok(())
    }

    pub(crate) fn record(&self, change: Change, directions: Vec<MeshBaseIdentifier>) {
        self.changes.lock().push(ChangeEvent {
            change,
            origin: self.origin.clone(),
            time: now_millis(),
            directions,
        });
    }

    pub fn pending_changes(&self) -> usize {
        self.changes.lock().len()
    }

    /// Publishes the buffered changes and releases the transaction
    pub async fn commit(self) -> MeshResult<ChangeSet> {
        self.active.store(false, Ordering::SeqCst);
        let changes = ChangeSet::new(std::mem::take(&mut *self.changes.lock()));
        debug!(
            base = %self.base.identifier(),
            changes = changes.len(),
            "Committing transaction"
        );
        self.base
            .transaction_committed(&changes, self.origin.as_ref())
            .await?;
        Ok(changes)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        let changes = std::mem::take(&mut *self.changes.lock());
        if changes.is_empty() {
            return;
        }
        warn!(
            base = %self.base.identifier(),
            changes = changes.len(),
            "Transaction dropped without commit, publishing its changes"
        );
        let base = self.base.clone();
        let origin = self.origin.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let changes = ChangeSet::new(changes);
                    if let Err(e) = base.transaction_committed(&changes, origin.as_ref()).await {
                        warn!(base = %base.identifier(), error = %e, "Publishing dropped transaction failed");
                    }
                });
            }
            Err(_) => {
                warn!(base = %base.identifier(), "No runtime to publish dropped transaction");
            }
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("base", self.base.identifier())
            .field("origin", &self.origin)
            .field("active", &self.is_active())
            .field("changes", &self.pending_changes())
            .finish()
    }
}
