//! Access control seam
//!
//! The mesh base consults its `AccessManager` when objects are created,
//! changed, deleted, when the lock of an object is about to move to another
//! mesh base and when remote objects are accessed. A refusal surfaces as
//! `MeshError::NotPermitted`.

use crate::{
    error::MeshResult,
    identifier::{MeshBaseIdentifier, MeshObjectAccessSpecification, MeshObjectIdentifier},
    object::MeshObject,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Bless,
    Unbless,
    SetProperty,
    Relate,
    Unrelate,
    BlessRole,
    UnblessRole,
    Equivalence,
    Expiration,
}

impl UpdateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateKind::Bless => "bless",
            UpdateKind::Unbless => "unbless",
            UpdateKind::SetProperty => "set_property",
            UpdateKind::Relate => "relate",
            UpdateKind::Unrelate => "unrelate",
            UpdateKind::BlessRole => "bless_role",
            UpdateKind::UnblessRole => "unbless_role",
            UpdateKind::Equivalence => "equivalence",
            UpdateKind::Expiration => "expiration",
        }
    }
}

pub trait AccessManager: Send + Sync {
    fn check_permitted_create(
        &self,
        _base: &MeshBaseIdentifier,
        _identifier: &MeshObjectIdentifier,
    ) -> MeshResult<()> {
        Ok(())
    }

    /// Owner assigned to a newly created object
    fn assign_owner(&self, _base: &MeshBaseIdentifier, _object: &MeshObject) -> Option<String> {
        None
    }

    fn check_permitted_update(&self, _object: &MeshObject, _kind: UpdateKind) -> MeshResult<()> {
        Ok(())
    }

    fn check_permitted_delete(&self, _object: &MeshObject) -> MeshResult<()> {
        Ok(())
    }

    /// Whether the lock of `object` may be handed to `partner`
    fn check_permitted_lock_transfer(
        &self,
        _object: &MeshObject,
        _partner: &MeshBaseIdentifier,
    ) -> MeshResult<()> {
        Ok(())
    }

    fn check_permitted_access_locally(
        &self,
        _base: &MeshBaseIdentifier,
        _paths: &[MeshObjectAccessSpecification],
    ) -> MeshResult<()> {
        Ok(())
    }
}

/// Permits everything and assigns no owner
#[derive(Debug, Clone, Copy, Default)]
pub struct PermitAll;

impl AccessManager for PermitAll {}
