//! Type registry for entity types, property types and role types
//!
//! Mesh objects refer to their types by identifier only. The registry maps
//! those identifiers to declarations and decides whether a blessing, property
//! or role is acceptable. An open registry accepts identifiers it has never
//! seen, which is what shadows fed by schemaless sources use.

use std::{
    collections::{BTreeSet, HashMap},
    fmt,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{MeshError, MeshResult};

macro_rules! type_identifier {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self::new(value)
            }
        }
    };
}

type_identifier!(
    /// Identifier of an entity type a mesh object can be blessed with
    EntityTypeId
);
type_identifier!(
    /// Identifier of a property type
    PropertyTypeId
);
type_identifier!(
    /// Identifier of a role type carried by a relationship
    RoleTypeId
);

/// Value of a property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    Blob(Vec<u8>),
    TimeStamp(i64),
}

impl PropertyValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            PropertyValue::String(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_string())
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Integer(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Boolean(value)
    }
}

/// Declaration of an entity type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityType {
    pub id: EntityTypeId,
    pub property_types: BTreeSet<PropertyTypeId>,
    pub is_abstract: bool,
}

impl EntityType {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: EntityTypeId::new(id),
            property_types: BTreeSet::new(),
            is_abstract: false,
        }
    }

    pub fn with_property(mut self, property: impl Into<String>) -> Self {
        self.property_types.insert(PropertyTypeId::new(property));
        self
    }

    pub fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }
}

#[derive(Debug, Default)]
struct Registry {
    entity_types: HashMap<EntityTypeId, EntityType>,
    property_owners: HashMap<PropertyTypeId, EntityTypeId>,
    role_types: BTreeSet<RoleTypeId>,
}

#[derive(Debug, Default)]
pub struct TypeRegistry {
    inner: RwLock<Registry>,
    open: bool,
}

impl TypeRegistry {
    /// A registry that only knows what has been registered
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry that also accepts unregistered identifiers
    pub fn open() -> Self {
        Self {
            inner: RwLock::new(Registry::default()),
            open: true,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn register_entity_type(&self, entity_type: EntityType) {
        let mut inner = self.inner.write();
        for property in &entity_type.property_types {
            inner
                .property_owners
                .insert(property.clone(), entity_type.id.clone());
        }
        inner
            .entity_types
            .insert(entity_type.id.clone(), entity_type);
    }

    pub fn register_role_type(&self, role: RoleTypeId) {
        self.inner.write().role_types.insert(role);
    }

    pub fn find_entity_type(&self, id: &EntityTypeId) -> Option<EntityType> {
        self.inner.read().entity_types.get(id).cloned()
    }

    /// Resolves a type for blessing
    pub fn resolve_entity_type(&self, id: &EntityTypeId) -> MeshResult<()> {
        match self.inner.read().entity_types.get(id) {
            Some(entity_type) if entity_type.is_abstract => {
                Err(MeshError::IsAbstract(id.clone()))
            }
            Some(_) => Ok(()),
            None if self.open => Ok(()),
            None => Err(MeshError::UnknownEntityType(id.clone())),
        }
    }

    pub fn resolve_property_type(&self, id: &PropertyTypeId) -> MeshResult<()> {
        if self.open || self.inner.read().property_owners.contains_key(id) {
            Ok(())
        } else {
            Err(MeshError::UnknownPropertyType(id.clone()))
        }
    }

    pub fn resolve_role_type(&self, id: &RoleTypeId) -> MeshResult<()> {
        if self.open || self.inner.read().role_types.contains(id) {
            Ok(())
        } else {
            Err(MeshError::UnknownRoleType(id.clone()))
        }
    }

    /// Whether an object blessed with `types` may carry `property`
    pub fn is_property_allowed<'a>(
        &self,
        types: impl IntoIterator<Item = &'a EntityTypeId>,
        property: &PropertyTypeId,
    ) -> bool {
        let inner = self.inner.read();
        match inner.property_owners.get(property) {
            Some(owner) => types.into_iter().any(|t| t == owner),
            None => self.open,
        }
    }

    /// Property types declared by any of `types`
    pub fn declared_properties<'a>(
        &self,
        types: impl IntoIterator<Item = &'a EntityTypeId>,
    ) -> BTreeSet<PropertyTypeId> {
        let inner = self.inner.read();
        types
            .into_iter()
            .filter_map(|t| inner.entity_types.get(t))
            .flat_map(|t| t.property_types.iter().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> TypeRegistry {
        let registry = TypeRegistry::new();
        registry.register_entity_type(EntityType::new("Person").with_property("Person_Name"));
        registry.register_entity_type(EntityType::new("Thing").abstract_type());
        registry.register_role_type(RoleTypeId::new("Knows-S"));
        registry
    }

    #[test]
    fn test_closed_registry() {
        let registry = registry();
        assert!(registry.resolve_entity_type(&"Person".into()).is_ok());
        assert!(matches!(
            registry.resolve_entity_type(&"Thing".into()),
            Err(MeshError::IsAbstract(_))
        ));
        assert!(matches!(
            registry.resolve_entity_type(&"Robot".into()),
            Err(MeshError::UnknownEntityType(_))
        ));
        assert!(registry.resolve_property_type(&"Person_Name".into()).is_ok());
        assert!(registry.resolve_role_type(&"Knows-S".into()).is_ok());
        assert!(registry.resolve_role_type(&"Likes-S".into()).is_err());

        let person = EntityTypeId::new("Person");
        assert!(registry.is_property_allowed([&person], &"Person_Name".into()));
        assert!(!registry.is_property_allowed([], &"Person_Name".into()));
        assert_eq!(registry.declared_properties([&person]).len(), 1);
    }

    #[test]
    fn test_open_registry() {
        let registry = TypeRegistry::open();
        assert!(registry.resolve_entity_type(&"Anything".into()).is_ok());
        assert!(registry.is_property_allowed([], &"Whatever".into()));
    }
}
