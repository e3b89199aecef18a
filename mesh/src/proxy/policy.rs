//! What to do with objects a partner conveys to us
//!
//! A conveyed object arrives with the sender's view of where its home is. The
//! receiver either materializes it, refreshes its own replica, moves its replica
//! closer to the home replica, or declines the offered replication lease.

use crate::{identifier::MeshBaseIdentifier, object::externalized::ExternalizedMeshObject};

/// The receiving replica's current pointers, `None` meaning "here"
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LocalPointers {
    pub(crate) home: Option<MeshBaseIdentifier>,
    pub(crate) lock: Option<MeshBaseIdentifier>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConveyedAction {
    /// Materialize a replica of the sender; optionally ask the real home to resynchronize us
    Create {
        resynchronize_towards: Option<MeshBaseIdentifier>,
    },
    /// Refresh the replica from the sender, which is our home direction already
    Resynchronize {
        resynchronize_towards: Option<MeshBaseIdentifier>,
    },
    /// Only ask the real home to resynchronize us
    ResynchronizeTowards(MeshBaseIdentifier),
    /// Replicate from the sender instead and cancel the lease with our old home direction
    Tighten { cancel_towards: MeshBaseIdentifier },
    /// Tell the sender we do not replicate through it
    CancelOffered,
    Ignore,
}

/// Decides what to do with `conveyed`, sent by `sender` to `local`
///
/// `found` is `None` if there is no local replica. `is_response` is true if the
/// object answers one of our own ongoing queries.
pub(crate) fn decide_conveyed(
    local: &MeshBaseIdentifier,
    sender: &MeshBaseIdentifier,
    conveyed: &ExternalizedMeshObject,
    found: Option<&LocalPointers>,
    is_response: bool,
) -> ConveyedAction {
    let home_elsewhere = conveyed
        .proxy_towards_home()
        .filter(|home| *home != sender && *home != local)
        .cloned();

    let Some(pointers) = found else {
        return if is_response {
            ConveyedAction::Create {
                resynchronize_towards: home_elsewhere,
            }
        } else {
            ConveyedAction::CancelOffered
        };
    };

    if pointers.home.as_ref() == Some(sender) {
        return match (is_response, home_elsewhere) {
            (true, home) => ConveyedAction::Resynchronize {
                resynchronize_towards: home,
            },
            (false, Some(home)) => ConveyedAction::ResynchronizeTowards(home),
            (false, None) => ConveyedAction::Ignore,
        };
    }

    // The sender is the home replica and our lock pointer runs through our
    // current home direction: switching to the sender keeps one lock path.
    let sender_is_home = conveyed.proxy_towards_home().is_none();
    match &pointers.home {
        Some(old_home) if is_response && sender_is_home && pointers.lock.as_ref() == Some(old_home) => {
            ConveyedAction::Tighten {
                cancel_towards: old_home.clone(),
            }
        }
        _ => ConveyedAction::CancelOffered,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::identifier::MeshObjectIdentifier;

    fn conveyed(proxies: &[&str], home: Option<usize>) -> ExternalizedMeshObject {
        ExternalizedMeshObject {
            identifier: MeshObjectIdentifier::new("c".into(), "x"),
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
            proxies: proxies.iter().map(|p| MeshBaseIdentifier::from(*p)).collect(),
            home_proxy: home,
            lock_proxy: home,
        }
    }

    fn pointers(home: Option<&str>, lock: Option<&str>) -> LocalPointers {
        LocalPointers {
            home: home.map(MeshBaseIdentifier::from),
            lock: lock.map(MeshBaseIdentifier::from),
        }
    }

    #[test]
    fn test_unknown_object() {
        let a: MeshBaseIdentifier = "a".into();
        let b: MeshBaseIdentifier = "b".into();
        let from_home = conveyed(&["a"], None);
        assert_eq!(
            decide_conveyed(&a, &b, &from_home, None, true),
            ConveyedAction::Create { resynchronize_towards: None }
        );
        assert_eq!(
            decide_conveyed(&a, &b, &from_home, None, false),
            ConveyedAction::CancelOffered
        );

        let from_intermediate = conveyed(&["c", "a"], Some(0));
        assert_eq!(
            decide_conveyed(&a, &b, &from_intermediate, None, true),
            ConveyedAction::Create { resynchronize_towards: Some("c".into()) }
        );
    }

    #[test]
    fn test_replica_of_sender() {
        let a: MeshBaseIdentifier = "a".into();
        let b: MeshBaseIdentifier = "b".into();
        let ours = pointers(Some("b"), Some("b"));
        assert_eq!(
            decide_conveyed(&a, &b, &conveyed(&[], None), Some(&ours), true),
            ConveyedAction::Resynchronize { resynchronize_towards: None }
        );
        assert_eq!(
            decide_conveyed(&a, &b, &conveyed(&[], None), Some(&ours), false),
            ConveyedAction::Ignore
        );
        assert_eq!(
            decide_conveyed(&a, &b, &conveyed(&["c"], Some(0)), Some(&ours), false),
            ConveyedAction::ResynchronizeTowards("c".into())
        );
        // the sender's home pointer leading back to us is not a different home
        assert_eq!(
            decide_conveyed(&a, &b, &conveyed(&["a"], Some(0)), Some(&ours), false),
            ConveyedAction::Ignore
        );
    }

    #[test]
    fn test_tightening_needs_lock_path_through_old_home() {
        let a: MeshBaseIdentifier = "a".into();
        let c: MeshBaseIdentifier = "c".into();
        let from_home = conveyed(&["a"], None);

        let via_b = pointers(Some("b"), Some("b"));
        assert_eq!(
            decide_conveyed(&a, &c, &from_home, Some(&via_b), true),
            ConveyedAction::Tighten { cancel_towards: "b".into() }
        );

        let lock_here = pointers(Some("b"), None);
        assert_eq!(
            decide_conveyed(&a, &c, &from_home, Some(&lock_here), true),
            ConveyedAction::CancelOffered
        );

        let home_here = pointers(None, None);
        assert_eq!(
            decide_conveyed(&a, &c, &from_home, Some(&home_here), true),
            ConveyedAction::CancelOffered
        );

        assert_eq!(
            decide_conveyed(&a, &c, &from_home, Some(&via_b), false),
            ConveyedAction::CancelOffered
        );
    }
}
