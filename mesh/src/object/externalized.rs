//! Externalized form of a mesh object
//!
//! Used for persistence and for conveying replicas between mesh bases. Proxy
//! pointers are stored as indices into `proxies`, `None` meaning "here".

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::Neighbor;
use crate::{
    identifier::{MeshBaseIdentifier, MeshObjectIdentifier},
    model::{EntityTypeId, PropertyTypeId, PropertyValue},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalizedMeshObject {
    pub identifier: MeshObjectIdentifier,
    pub types: Vec<EntityTypeId>,
    pub properties: BTreeMap<PropertyTypeId, PropertyValue>,
    pub neighbors: Vec<Neighbor>,
    pub equivalents: Vec<MeshObjectIdentifier>,
    pub time_created: i64,
    pub time_updated: i64,
    pub time_read: i64,
    pub time_expires: Option<i64>,
    pub give_up_lock: bool,
    pub give_up_home_replica: bool,
    pub owner: Option<String>,
    pub proxies: Vec<MeshBaseIdentifier>,
    pub home_proxy: Option<usize>,
    pub lock_proxy: Option<usize>,
}

impl ExternalizedMeshObject {
    /// Partner towards the home replica, as seen by whoever externalized this object
    pub fn proxy_towards_home(&self) -> Option<&MeshBaseIdentifier> {
        self.home_proxy.and_then(|index| self.proxies.get(index))
    }

    /// Partner towards the lock holder, as seen by whoever externalized this object
    pub fn proxy_towards_lock(&self) -> Option<&MeshBaseIdentifier> {
        self.lock_proxy.and_then(|index| self.proxies.get(index))
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::model::RoleTypeId;

    fn full_object() -> ExternalizedMeshObject {
        let base = MeshBaseIdentifier::new("http://a.example/");
        let id = |local: &str| MeshObjectIdentifier::new(base.clone(), local);
        let mut properties = BTreeMap::new();
        properties.insert(PropertyTypeId::new("Name"), PropertyValue::String("x".into()));
        properties.insert(PropertyTypeId::new("Age"), PropertyValue::Integer(42));
        properties.insert(PropertyTypeId::new("Ratio"), PropertyValue::Float(0.25));
        properties.insert(PropertyTypeId::new("Flag"), PropertyValue::Boolean(true));
        properties.insert(PropertyTypeId::new("Data"), PropertyValue::Blob(vec![0, 1, 255]));
        properties.insert(PropertyTypeId::new("When"), PropertyValue::TimeStamp(1_700_000_000_000));

        ExternalizedMeshObject {
            identifier: id("subject"),
            types: vec![EntityTypeId::new("Person"), EntityTypeId::new("Employee")],
            properties,
            neighbors: vec![
                Neighbor {
                    identifier: id("n1"),
                    roles: BTreeSet::from([RoleTypeId::new("Knows-S"), RoleTypeId::new("Likes-S")]),
                },
                Neighbor {
                    identifier: id("n2"),
                    roles: BTreeSet::new(),
                },
            ],
            equivalents: vec![MeshObjectIdentifier::new("http://b.example/".into(), "same")],
            time_created: 1,
            time_updated: 2,
            time_read: 3,
            time_expires: Some(4),
            give_up_lock: false,
            give_up_home_replica: true,
            owner: Some("alice".into()),
            proxies: vec!["http://b.example/".into(), "http://c.example/".into()],
            home_proxy: Some(1),
            lock_proxy: Some(0),
        }
    }

    #[test]
    fn test_encode_decode_preserves_every_field() {
        let original = full_object();
        let decoded = ExternalizedMeshObject::decode(&original.encode().unwrap()).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(
            decoded.proxy_towards_home(),
            Some(&MeshBaseIdentifier::new("http://c.example/"))
        );
        assert_eq!(
            decoded.proxy_towards_lock(),
            Some(&MeshBaseIdentifier::new("http://b.example/"))
        );
    }

    #[test]
    fn test_pointers_here() {
        let mut object = full_object();
        object.home_proxy = None;
        object.lock_proxy = None;
        assert!(object.proxy_towards_home().is_none());
        assert!(object.proxy_towards_lock().is_none());
    }
}
