//! Work collected while processing one incoming message
//!
//! The proxy first works out everything an incoming message asks for, then
//! performs it in a fixed order: replica materialization and changes inside one
//! transaction, instructions to other proxies, the response, waking waiters.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use crate::{
    identifier::{MeshBaseIdentifier, MeshObjectIdentifier},
    object::{externalized::ExternalizedMeshObject, MeshObject},
    transaction::Change,
    xpriso::XprisoMessage,
};

pub(crate) struct ProxyInstructions {
    /// Response or follow-up to the partner
    pub(crate) outgoing: XprisoMessage,
    pub(crate) must_respond: bool,
    pub(crate) creates: Vec<ExternalizedMeshObject>,
    pub(crate) resynchronizations: Vec<(Arc<MeshObject>, ExternalizedMeshObject)>,
    pub(crate) changes: Vec<Change>,
    pub(crate) resynchronize_towards: BTreeMap<MeshBaseIdentifier, Vec<MeshObjectIdentifier>>,
    pub(crate) cancel_towards: BTreeMap<MeshBaseIdentifier, Vec<Arc<MeshObject>>>,
    pub(crate) canceled: Vec<MeshObjectIdentifier>,
    pub(crate) flush: BTreeSet<MeshObjectIdentifier>,
}

impl ProxyInstructions {
    pub(crate) fn new(outgoing: XprisoMessage, must_respond: bool) -> Self {
        Self {
            outgoing,
            must_respond,
            creates: Vec::new(),
            resynchronizations: Vec::new(),
            changes: Vec::new(),
            resynchronize_towards: BTreeMap::new(),
            cancel_towards: BTreeMap::new(),
            canceled: Vec::new(),
            flush: BTreeSet::new(),
        }
    }

    pub(crate) fn needs_transaction(&self) -> bool {
        !self.creates.is_empty() || !self.resynchronizations.is_empty() || !self.changes.is_empty()
    }

    pub(crate) fn should_send(&self) -> bool {
        self.must_respond || !self.outgoing.is_empty()
    }

    pub(crate) fn add_resynchronize_towards(
        &mut self,
        partner: MeshBaseIdentifier,
        object: MeshObjectIdentifier,
    ) {
        let objects = self.resynchronize_towards.entry(partner).or_default();
        if !objects.contains(&object) {
            objects.push(object);
        }
    }

    pub(crate) fn add_cancel_towards(&mut self, partner: MeshBaseIdentifier, object: Arc<MeshObject>) {
        self.cancel_towards.entry(partner).or_default().push(object);
    }

    /// Changes in the order they have to be applied
    pub(crate) fn take_sorted_changes(&mut self) -> Vec<Change> {
        let mut changes = std::mem::take(&mut self.changes);
        changes.sort_by_key(Change::apply_rank);
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_is_sent_even_when_empty() {
        let message = XprisoMessage::new("a".into(), "b".into());
        assert!(ProxyInstructions::new(message.clone(), true).should_send());
        assert!(!ProxyInstructions::new(message, false).should_send());
    }

    #[test]
    fn test_resynchronize_towards_deduplicates() {
        let mut instructions =
            ProxyInstructions::new(XprisoMessage::new("a".into(), "b".into()), false);
        let object = MeshObjectIdentifier::new("c".into(), "x");
        instructions.add_resynchronize_towards("c".into(), object.clone());
        instructions.add_resynchronize_towards("c".into(), object);
        assert_eq!(instructions.resynchronize_towards.len(), 1);
        assert_eq!(instructions.resynchronize_towards[&MeshBaseIdentifier::from("c")].len(), 1);
    }

    #[test]
    fn test_changes_sorted_for_application() {
        let object = MeshObjectIdentifier::new("a".into(), "x");
        let mut instructions =
            ProxyInstructions::new(XprisoMessage::new("a".into(), "b".into()), false);
        instructions.changes = vec![
            Change::Deleted { object: object.clone() },
            Change::TypesAdded { object, types: Vec::new() },
        ];
        assert!(instructions.needs_transaction());
        let sorted = instructions.take_sorted_changes();
        assert_eq!(sorted[0].as_str(), "types_added");
        assert!(!instructions.needs_transaction());
    }
}
