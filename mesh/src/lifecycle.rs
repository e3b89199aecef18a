//! Lifecycle manager
//!
//! Creates, deletes and recreates the mesh objects of one mesh base. The
//! `ripple_*` operations materialize what partners tell us about and skip lock
//! and permission checks; the partner has done those already.

use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use crate::{
    error::{MeshError, MeshResult},
    identifier::{MeshBaseIdentifier, MeshObjectIdentifier},
    meshbase::MeshBase,
    model::{EntityTypeId, TypeRegistry},
    object::{externalized::ExternalizedMeshObject, MeshObject, ReplicaState},
    transaction::{Change, Transaction},
};

pub struct LifecycleManager {
    base: Weak<MeshBase>,
}

impl LifecycleManager {
    pub(crate) fn new(base: Weak<MeshBase>) -> Self {
        Self { base }
    }

    fn base(&self) -> MeshResult<Arc<MeshBase>> {
        self.base
            .upgrade()
            .ok_or_else(|| MeshError::MeshBaseIsDead(MeshBaseIdentifier::default()))
    }

    /// Creates a new mesh object; a fresh identifier is generated if none is given
    pub async fn create_mesh_object(
        &self,
        tx: &Transaction,
        identifier: Option<MeshObjectIdentifier>,
        types: &[EntityTypeId],
    ) -> MeshResult<Arc<MeshObject>> {
        let base = self.base()?;
        tx.check(base.identifier())?;
        let identifier =
            identifier.unwrap_or_else(|| MeshObjectIdentifier::generate(base.identifier()));
        if identifier.base() != base.identifier() {
            return Err(MeshError::WrongMeshBase {
                object: identifier,
                base: base.identifier().clone(),
            });
        }
        if let Some(existing) = base.find_mesh_object(&identifier) {
            return Err(MeshError::IdentifierNotUnique { existing });
        }
        base.access_manager()
            .check_permitted_create(base.identifier(), &identifier)?;
        for entity_type in types {
            base.types().resolve_entity_type(entity_type)?;
        }

        let config = base.config();
        let state = ReplicaState::new_local(
            config.default_will_give_up_lock,
            config.default_will_give_up_home_replica,
        );
        let object = Arc::new(MeshObject::new(
            identifier.clone(),
            Arc::downgrade(&base),
            state,
        ));
        object.set_owner(base.access_manager().assign_owner(base.identifier(), &object));
        base.insert_object(object.clone());
        tx.record(Change::Created { object: identifier.clone() }, Vec::new());
        if !types.is_empty() {
            object.apply_and_record(
                tx,
                Change::TypesAdded {
                    object: identifier.clone(),
                    types: types.to_vec(),
                },
            );
        }
        debug!(base = %base.identifier(), object = %identifier, "Created mesh object");
        Ok(object)
    }

    pub async fn delete_mesh_object(&self, tx: &Transaction, object: &Arc<MeshObject>) -> MeshResult<()> {
        self.delete_mesh_objects(tx, std::slice::from_ref(object)).await
    }

    /// Deletes all of `objects` or none of them
    pub async fn delete_mesh_objects(
        &self,
        tx: &Transaction,
        objects: &[Arc<MeshObject>],
    ) -> MeshResult<()> {
        let base = self.base()?;
        tx.check(base.identifier())?;

        for object in objects {
            if object.is_dead() {
                return Err(MeshError::ObjectIsDead(object.identifier().clone()));
            }
            if object.identifier() == &MeshObjectIdentifier::home_of(base.identifier()) {
                return Err(MeshError::MustNotDeleteHomeObject(object.identifier().clone()));
            }
        }
        for object in objects {
            if !object.try_to_obtain_lock(None).await? {
                return Err(MeshError::CannotObtainLock(object.identifier().clone()));
            }
            base.access_manager().check_permitted_delete(object)?;
            for neighbor in object.neighbors() {
                if let Some(neighbor) = base.find_mesh_object(&neighbor) {
                    if !neighbor.try_to_obtain_lock(None).await? {
                        return Err(MeshError::CannotObtainLock(neighbor.identifier().clone()));
                    }
                }
            }
        }

        for object in objects {
            self.unlink_neighbors(&base, tx, object);
            tx.record(
                Change::Deleted {
                    object: object.identifier().clone(),
                },
                object.proxies(),
            );
            object.mark_dead();
            base.remove_object(object.identifier());
        }
        Ok(())
    }

    /// Drops local replicas without deleting the object elsewhere
    ///
    /// Only leaf replicas can be purged: the home replica and replicas that
    /// other partners replicate from are refused.
    pub async fn purge(&self, tx: &Transaction, objects: &[Arc<MeshObject>]) -> MeshResult<()> {
        let base = self.base()?;
        tx.check(base.identifier())?;

        for object in objects {
            if object.is_home_replica() {
                return Err(MeshError::NotPermitted(format!(
                    "{} is the home replica and cannot be purged",
                    object.identifier()
                )));
            }
            if object.proxies().len() > 1 {
                return Err(MeshError::NotPermitted(format!(
                    "{} is replicated onwards and cannot be purged",
                    object.identifier()
                )));
            }
        }
        for object in objects {
            if object.has_lock() {
                if let Some(home) = object.proxy_towards_home() {
                    match object.try_to_push_lock(&home, None).await {
                        Ok(_) => {}
                        // the lock has left this replica even if home did not answer
                        Err(MeshError::RemoteQueryTimeout { .. }) => {
                            debug!(object = %object.identifier(), %home, "Home did not confirm pushed lock");
                        }
                        Err(error) => return Err(error),
                    }
                }
            }
        }
        for object in objects {
            tx.record(
                Change::ReplicaPurged {
                    object: object.identifier().clone(),
                },
                object.proxies(),
            );
            object.mark_dead();
            base.remove_object(object.identifier());
        }
        Ok(())
    }

    /// Rebuilds an object from its externalized form, keeping its proxy pointers
    ///
    /// Types, properties and roles the type registry no longer knows are dropped
    /// with a warning; the rest of the object still materializes.
    pub fn recreate(&self, external: ExternalizedMeshObject) -> MeshResult<Arc<MeshObject>> {
        let base = self.base()?;
        let external = without_schema_drift(base.types(), external);
        let identifier = external.identifier.clone();
        let object = Arc::new(MeshObject::new(
            identifier,
            Arc::downgrade(&base),
            ReplicaState::from_externalized(external),
        ));
        base.insert_object(object.clone());
        Ok(object)
    }

    /// Materializes a replica conveyed by `from`, pointing home and lock at it
    pub(crate) fn ripple_create(
        &self,
        tx: &Transaction,
        external: ExternalizedMeshObject,
        from: &MeshBaseIdentifier,
    ) -> MeshResult<Arc<MeshObject>> {
        let base = self.base()?;
        if let Some(existing) = base.find_mesh_object(&external.identifier) {
            self.ripple_resynchronize(tx, &existing, &external, from);
            return Ok(existing);
        }
        let mut external = without_schema_drift(base.types(), external);
        external.give_up_lock = base.config().default_will_give_up_lock;
        external.give_up_home_replica = base.config().default_will_give_up_home_replica;
        external.proxies = vec![from.clone()];
        external.home_proxy = Some(0);
        external.lock_proxy = Some(0);
        let identifier = external.identifier.clone();
        let object = Arc::new(MeshObject::new(
            identifier.clone(),
            Arc::downgrade(&base),
            ReplicaState::from_externalized(external),
        ));
        base.insert_object(object.clone());
        tx.record(Change::ReplicaCreated { object: identifier.clone() }, Vec::new());
        debug!(base = %base.identifier(), object = %identifier, %from, "Created replica");
        Ok(object)
    }

    /// Makes `object` a replica of `from` and brings its content in line with `external`
    pub(crate) fn ripple_resynchronize(
        &self,
        tx: &Transaction,
        object: &Arc<MeshObject>,
        external: &ExternalizedMeshObject,
        from: &MeshBaseIdentifier,
    ) {
        object.make_replica_from(from);
        match self.base() {
            Ok(base) => {
                let external = without_schema_drift(base.types(), external.clone());
                object.resynchronize_from(tx, &external);
            }
            Err(_) => object.resynchronize_from(tx, external),
        }
    }

    /// Deletes a replica because its object was deleted elsewhere
    pub(crate) fn ripple_delete(&self, tx: &Transaction, identifier: &MeshObjectIdentifier) {
        let Ok(base) = self.base() else {
            return;
        };
        let Some(object) = base.find_mesh_object(identifier) else {
            return;
        };
        self.unlink_neighbors(&base, tx, &object);
        tx.record(Change::Deleted { object: identifier.clone() }, object.proxies());
        object.mark_dead();
        base.remove_object(identifier);
    }

    fn unlink_neighbors(&self, base: &MeshBase, tx: &Transaction, object: &Arc<MeshObject>) {
        for neighbor in object.neighbors() {
            if let Some(neighbor) = base.find_mesh_object(&neighbor) {
                if neighbor.is_related_to(object.identifier()) {
                    neighbor.apply_and_record(
                        tx,
                        Change::NeighborRemoved {
                            object: neighbor.identifier().clone(),
                            neighbor: object.identifier().clone(),
                        },
                    );
                }
            }
        }
    }
}

fn without_schema_drift(
    types: &TypeRegistry,
    mut external: ExternalizedMeshObject,
) -> ExternalizedMeshObject {
    let object = external.identifier.clone();
    external.types.retain(|entity_type| match types.resolve_entity_type(entity_type) {
        Ok(()) => true,
        Err(e) => {
            warn!(%object, %entity_type, error = %e, "Dropping entity type that no longer resolves");
            false
        }
    });
    external.properties.retain(|property, _| match types.resolve_property_type(property) {
        Ok(()) => true,
        Err(e) => {
            warn!(%object, %property, error = %e, "Dropping property that no longer resolves");
            false
        }
    });
    for neighbor in &mut external.neighbors {
        neighbor.roles.retain(|role| match types.resolve_role_type(role) {
            Ok(()) => true,
            Err(e) => {
                warn!(%object, %role, error = %e, "Dropping role type that no longer resolves");
                false
            }
        });
    }
    external
}
