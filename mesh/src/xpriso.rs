//! Xpriso protocol messages
//!
//! One `XprisoMessage` travels from a proxy to its partner proxy and may carry
//! any combination of:
//! - replica requests (first time, resynchronize) and cancellations
//! - lock and home replica requests, pushes and reclaims
//! - conveyed objects in externalized form
//! - change events to apply to existing replicas
//! - a cease-communications notice
//!
//! Messages are batched per ping-pong token; `encode`/`decode` turn a batch
//! into bytes with bincode.

use serde::{Deserialize, Serialize};

use crate::{
    endpoint::{pingpong::Token, rpc::Correlated},
    identifier::{
        CoherenceSpecification, MeshBaseIdentifier, MeshObjectAccessSpecification,
        MeshObjectIdentifier,
    },
    object::externalized::ExternalizedMeshObject,
    transaction::Change,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct XprisoMessage {
    pub request_id: Option<u64>,
    pub response_id: Option<u64>,
    pub sender: MeshBaseIdentifier,
    pub receiver: MeshBaseIdentifier,
    pub cease_communications: bool,
    /// Coherence the requester wants for the requested objects
    pub coherence: Option<CoherenceSpecification>,
    pub conveyed_objects: Vec<ExternalizedMeshObject>,
    pub requested_first_time_objects: Vec<MeshObjectAccessSpecification>,
    pub requested_canceled_objects: Vec<MeshObjectIdentifier>,
    pub requested_resynchronize_replicas: Vec<MeshObjectIdentifier>,
    pub requested_lock_objects: Vec<MeshObjectIdentifier>,
    pub pushed_locks: Vec<MeshObjectIdentifier>,
    pub reclaimed_lock_objects: Vec<MeshObjectIdentifier>,
    pub requested_home_replicas: Vec<MeshObjectIdentifier>,
    pub pushed_home_replicas: Vec<MeshObjectIdentifier>,
    pub changes: Vec<Change>,
}

impl XprisoMessage {
    pub fn new(sender: MeshBaseIdentifier, receiver: MeshBaseIdentifier) -> Self {
        Self {
            sender,
            receiver,
            ..Default::default()
        }
    }

    /// True if the message carries no payload; ids and addresses do not count
    pub fn is_empty(&self) -> bool {
        !self.cease_communications
            && self.conveyed_objects.is_empty()
            && self.requested_first_time_objects.is_empty()
            && self.requested_canceled_objects.is_empty()
            && self.requested_resynchronize_replicas.is_empty()
            && self.requested_lock_objects.is_empty()
            && self.pushed_locks.is_empty()
            && self.reclaimed_lock_objects.is_empty()
            && self.requested_home_replicas.is_empty()
            && self.pushed_home_replicas.is_empty()
            && self.changes.is_empty()
    }

    /// Adds `object` to the conveyed objects unless it is there already
    pub fn convey(&mut self, object: ExternalizedMeshObject) -> bool {
        if self
            .conveyed_objects
            .iter()
            .any(|o| o.identifier == object.identifier)
        {
            return false;
        }
        self.conveyed_objects.push(object);
        true
    }
}

impl Correlated for XprisoMessage {
    fn request_id(&self) -> Option<u64> {
        self.request_id
    }

    fn set_request_id(&mut self, id: u64) {
        self.request_id = Some(id);
    }

    fn response_id(&self) -> Option<u64> {
        self.response_id
    }
}

/// The payload of one token
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XprisoBatch {
    pub token: Token,
    pub messages: Vec<XprisoMessage>,
}

pub fn encode(batch: &XprisoBatch) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(batch)
}

pub fn decode(bytes: &[u8]) -> Result<XprisoBatch, bincode::Error> {
    bincode::deserialize(bytes)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::model::PropertyValue;

    #[test]
    fn test_empty_message() {
        let mut message = XprisoMessage::new("a".into(), "b".into());
        message.request_id = Some(4);
        assert!(message.is_empty());
        message.cease_communications = true;
        assert!(!message.is_empty());
    }

    #[test]
    fn test_convey_skips_duplicates() {
        let object = ExternalizedMeshObject {
            identifier: MeshObjectIdentifier::new("a".into(), "x"),
            types: Vec::new(),
            properties: BTreeMap::new(),
            neighbors: Vec::new(),
            equivalents: Vec::new(),
            time_created: 0,
            time_updated: 0,
            time_read: 0,
            time_expires: None,
            give_up_lock: true,
            give_up_home_replica: true,
            owner: None,
            proxies: Vec::new(),
            home_proxy: None,
            lock_proxy: None,
        };
        let mut message = XprisoMessage::new("a".into(), "b".into());
        assert!(message.convey(object.clone()));
        assert!(!message.convey(object));
        assert_eq!(message.conveyed_objects.len(), 1);
    }

    #[test]
    fn test_batch_keeps_proxy_pointers_and_changes() {
        let object = MeshObjectIdentifier::new("a".into(), "x");
        let mut message = XprisoMessage::new("a".into(), "b".into());
        message.response_id = Some(9);
        message.coherence = Some(CoherenceSpecification::Periodic { period_ms: 100 });
        message.requested_first_time_objects =
            vec![MeshObjectAccessSpecification::at("c".into(), object.clone())];
        message.pushed_locks = vec![object.clone()];
        message.changes = vec![Change::PropertyChanged {
            object,
            property: "p".into(),
            old_value: None,
            new_value: Some(PropertyValue::Float(1.5)),
        }];
        let batch = XprisoBatch {
            token: 7,
            messages: vec![message],
        };

        let decoded = decode(&encode(&batch).unwrap()).unwrap();
        assert_eq!(decoded, batch);
        assert_eq!(decoded.messages[0].response_id(), Some(9));
    }
}
