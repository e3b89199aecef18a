//! Error types
//!
//! - `EndpointError`: a message endpoint can no longer be used
//! - `CallError`: a correlated call did not produce a response
//! - `StoreError`: the key-value store rejected an operation
//! - `MeshError`: everything an application calling into a mesh base can see

use std::{sync::Arc, time::Duration};

use thiserror::Error;

use crate::{
    identifier::{MeshBaseIdentifier, MeshObjectIdentifier},
    model::{EntityTypeId, PropertyTypeId, RoleTypeId},
    object::MeshObject,
    shadow::probe::ProbeError,
};

pub type EndpointResult<T> = Result<T, EndpointError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type MeshResult<T> = Result<T, MeshError>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("endpoint {0} is dead")]
    IsDead(String),
    #[error("partner of endpoint {endpoint} is unreachable for good: {reason}")]
    PartnerDead { endpoint: String, reason: String },
}

#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("call was abandoned before a response arrived")]
    Abandoned,
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key {0} exists already")]
    KeyExistsAlready(String),
    #[error("key {0} does not exist")]
    KeyDoesNotExist(String),
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("cannot encode or decode stored value: {0}")]
    Codec(#[from] bincode::Error),
}

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("not permitted: {0}")]
    NotPermitted(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("identifier {} is not unique", .existing.identifier())]
    IdentifierNotUnique { existing: Arc<MeshObject> },

    #[error("cannot create {object} in the namespace of another mesh base than {base}")]
    WrongMeshBase {
        object: MeshObjectIdentifier,
        base: MeshBaseIdentifier,
    },

    #[error("the home object {0} must not be deleted")]
    MustNotDeleteHomeObject(MeshObjectIdentifier),

    #[error("mesh object {0} has been deleted")]
    ObjectIsDead(MeshObjectIdentifier),

    #[error("cannot obtain the lock for {0}")]
    CannotObtainLock(MeshObjectIdentifier),

    #[error(
        "remote query timed out, {} of {} objects resolved",
        .partial.iter().filter(|found| found.is_some()).count(),
        .partial.len()
    )]
    RemoteQueryTimeout {
        partial: Vec<Option<Arc<MeshObject>>>,
    },

    #[error("endpoint dead: {0}")]
    EndpointDead(#[from] EndpointError),

    #[error("mesh base {0} has been shut down")]
    MeshBaseIsDead(MeshBaseIdentifier),

    #[error("cannot find or create mesh base {0}")]
    UnknownMeshBase(MeshBaseIdentifier),

    #[error("transaction of mesh base {0} is not active")]
    TransactionClosed(MeshBaseIdentifier),

    #[error("transaction belongs to mesh base {actual}, not {expected}")]
    WrongTransaction {
        expected: MeshBaseIdentifier,
        actual: MeshBaseIdentifier,
    },

    #[error("unknown entity type {0}")]
    UnknownEntityType(EntityTypeId),

    #[error("entity type {0} is abstract")]
    IsAbstract(EntityTypeId),

    #[error("unknown property type {0}")]
    UnknownPropertyType(PropertyTypeId),

    #[error("unknown role type {0}")]
    UnknownRoleType(RoleTypeId),

    #[error("property {property} is not allowed on {object}")]
    IllegalPropertyType {
        object: MeshObjectIdentifier,
        property: PropertyTypeId,
    },

    #[error("{object} is blessed with {entity_type} already")]
    BlessedAlready {
        object: MeshObjectIdentifier,
        entity_type: EntityTypeId,
    },

    #[error("{object} is not blessed with {entity_type}")]
    NotBlessed {
        object: MeshObjectIdentifier,
        entity_type: EntityTypeId,
    },

    #[error("{object} is related to {neighbor} already")]
    RelatedAlready {
        object: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
    },

    #[error("{object} is not related to {neighbor}")]
    NotRelated {
        object: MeshObjectIdentifier,
        neighbor: MeshObjectIdentifier,
    },

    #[error("{object} cannot be related to itself")]
    CannotRelateToItself { object: MeshObjectIdentifier },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("codec failure: {0}")]
    Codec(#[from] bincode::Error),

    #[error(transparent)]
    Probe(#[from] ProbeError),
}

impl MeshError {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeshError::NotPermitted(_) => "not_permitted",
            MeshError::InvalidConfig(_) => "invalid_config",
            MeshError::IdentifierNotUnique { .. } => "identifier_not_unique",
            MeshError::WrongMeshBase { .. } => "wrong_mesh_base",
            MeshError::MustNotDeleteHomeObject(_) => "must_not_delete_home_object",
            MeshError::ObjectIsDead(_) => "object_is_dead",
            MeshError::CannotObtainLock(_) => "cannot_obtain_lock",
            MeshError::RemoteQueryTimeout { .. } => "remote_query_timeout",
            MeshError::EndpointDead(_) => "endpoint_dead",
            MeshError::MeshBaseIsDead(_) => "mesh_base_is_dead",
            MeshError::UnknownMeshBase(_) => "unknown_mesh_base",
            MeshError::TransactionClosed(_) => "transaction_closed",
            MeshError::WrongTransaction { .. } => "wrong_transaction",
            MeshError::UnknownEntityType(_) => "unknown_entity_type",
            MeshError::IsAbstract(_) => "is_abstract",
            MeshError::UnknownPropertyType(_) => "unknown_property_type",
            MeshError::UnknownRoleType(_) => "unknown_role_type",
            MeshError::IllegalPropertyType { .. } => "illegal_property_type",
            MeshError::BlessedAlready { .. } => "blessed_already",
            MeshError::NotBlessed { .. } => "not_blessed",
            MeshError::RelatedAlready { .. } => "related_already",
            MeshError::NotRelated { .. } => "not_related",
            MeshError::CannotRelateToItself { .. } => "cannot_relate_to_itself",
            MeshError::Store(_) => "store",
            MeshError::Codec(_) => "codec",
            MeshError::Probe(_) => "probe",
        }
    }
}

impl From<CallError> for MeshError {
    fn from(error: CallError) -> Self {
        match error {
            CallError::Timeout(_) | CallError::Abandoned => {
                MeshError::RemoteQueryTimeout { partial: Vec::new() }
            }
            CallError::Endpoint(error) => MeshError::EndpointDead(error),
        }
    }
}
