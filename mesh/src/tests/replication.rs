//! Replication scenarios between mesh bases in one process

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use super::test_utils::{
    create_configured_base, create_test_base, eventually, fast_config, init_test_logging,
};
use crate::{
    config::{LockRefusalScope, MeshBaseConfig},
    endpoint::{pingpong::Token, MessageTransport, SendError},
    error::MeshError,
    identifier::{
        MeshBaseAccessSpecification, MeshBaseIdentifier, MeshObjectAccessSpecification,
        MeshObjectIdentifier,
    },
    object::MeshObject,
    meshbase::MeshBase,
    model::{EntityTypeId, PropertyTypeId, PropertyValue},
    nameserver::MeshBaseNameServer,
    proxy::TransportFactory,
    store::{MemoryStore, Store},
    xpriso::XprisoMessage,
};

/// Accepts every token and delivers none
struct Blackhole;

#[async_trait]
impl MessageTransport<XprisoMessage> for Blackhole {
    async fn send_message(&self, _token: Token, _content: Vec<XprisoMessage>) -> Result<(), SendError> {
        Ok(())
    }
}

impl TransportFactory for Blackhole {
    fn transport_for(
        &self,
        _local: &MeshBaseIdentifier,
        _partner: &MeshBaseIdentifier,
    ) -> Arc<dyn MessageTransport<XprisoMessage>> {
        Arc::new(Blackhole)
    }
}

async fn create_named_object(base: &Arc<MeshBase>, local_id: &str, name: &str) -> MeshObjectIdentifier {
    let tx = base.create_transaction().await.unwrap();
    let object = base
        .lifecycle()
        .create_mesh_object(&tx, Some(MeshObjectIdentifier::new(base.identifier().clone(), local_id)), &[])
        .await
        .unwrap();
    object
        .set_property(&tx, &PropertyTypeId::from("name"), Some(PropertyValue::from(name)))
        .await
        .unwrap();
    tx.commit().await.unwrap();
    object.identifier().clone()
}

/// Which of `bases` hold the lock of `id`
fn lock_holders(bases: &[&Arc<MeshBase>], id: &MeshObjectIdentifier) -> Vec<bool> {
    bases
        .iter()
        .map(|base| base.find_mesh_object(id).is_some_and(|object| object.has_lock()))
        .collect()
}

async fn rename(base: &Arc<MeshBase>, object: &Arc<MeshObject>, name: &str) {
    let tx = base.create_transaction().await.unwrap();
    object
        .set_property(&tx, &"name".into(), Some(name.into()))
        .await
        .unwrap();
    tx.commit().await.unwrap();
}

async fn replicate(base: &Arc<MeshBase>, id: &MeshObjectIdentifier) -> Arc<MeshObject> {
    base.access_locally(&MeshObjectAccessSpecification::of(id.clone()), None)
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_replicate_home_object() {
    init_test_logging();
    let name_server = MeshBaseNameServer::new();
    let a = create_test_base(&name_server, "a", None).await;
    let b = create_test_base(&name_server, "b", None).await;

    let replica = a
        .access_locally(&MeshObjectAccessSpecification::home_of(b.identifier()), None)
        .await
        .unwrap()
        .expect("home object of b");

    assert_eq!(replica.identifier(), &MeshObjectIdentifier::home_of(b.identifier()));
    assert!(!replica.has_lock());
    assert!(!replica.is_home_replica());
    assert_eq!(replica.proxy_towards_lock(), Some(b.identifier().clone()));

    let home = b.home_object().unwrap();
    assert!(home.has_lock());
    assert!(home.has_replica_in_direction(a.identifier()));
    assert!(b.has_replicas());
}

#[tokio::test]
async fn test_lock_moves_to_updating_replica() {
    init_test_logging();
    let name_server = MeshBaseNameServer::new();
    let a = create_test_base(&name_server, "a", None).await;
    let b = create_test_base(&name_server, "b", None).await;
    let id = create_named_object(&b, "thing", "before").await;

    let replica = a
        .access_locally(&MeshObjectAccessSpecification::at(b.identifier().clone(), id.clone()), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        replica.property(&"name".into()),
        Some(PropertyValue::from("before"))
    );

    let tx = a.create_transaction().await.unwrap();
    replica
        .set_property(&tx, &"name".into(), Some("after".into()))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let original = b.find_mesh_object(&id).unwrap();
    assert!(replica.has_lock());
    assert!(!original.has_lock(), "exactly one replica holds the lock");

    let arrived = eventually(Duration::from_secs(2), || {
        let original = original.clone();
        async move { original.property(&"name".into()) == Some(PropertyValue::from("after")) }
    })
    .await;
    assert!(arrived, "change did not reach the home replica");
}

#[tokio::test]
async fn test_changes_reach_existing_replicas() {
    init_test_logging();
    let name_server = MeshBaseNameServer::new();
    let a = create_test_base(&name_server, "a", None).await;
    let b = create_test_base(&name_server, "b", None).await;
    let id = create_named_object(&b, "thing", "one").await;

    let replica = a
        .access_locally(&MeshObjectAccessSpecification::of(id.clone()), None)
        .await
        .unwrap()
        .unwrap();

    let original = b.find_mesh_object(&id).unwrap();
    let tx = b.create_transaction().await.unwrap();
    original
        .set_property(&tx, &"name".into(), Some("two".into()))
        .await
        .unwrap();
    original.bless(&tx, &[EntityTypeId::from("Person")]).await.unwrap();
    tx.commit().await.unwrap();

    let arrived = eventually(Duration::from_secs(2), || {
        let replica = replica.clone();
        async move {
            replica.property(&"name".into()) == Some(PropertyValue::from("two"))
                && replica.is_blessed_by(&"Person".into())
        }
    })
    .await;
    assert!(arrived);
}

#[tokio::test]
async fn test_access_missing_object_is_none() {
    init_test_logging();
    let name_server = MeshBaseNameServer::new();
    let a = create_test_base(&name_server, "a", None).await;
    let b = create_test_base(&name_server, "b", None).await;

    let missing = MeshObjectIdentifier::new(b.identifier().clone(), "nothing-here");
    let found = a
        .access_locally(&MeshObjectAccessSpecification::at(b.identifier().clone(), missing), None)
        .await
        .unwrap();
    assert!(found.is_none());
}

#[tokio::test]
async fn test_access_times_out_when_partner_is_silent() {
    init_test_logging();
    let a = MeshBase::builder("a", Arc::new(Blackhole))
        .config(fast_config())
        .build()
        .await
        .unwrap();

    let result = a
        .access_locally(
            &MeshObjectAccessSpecification::home_of(&"b".into()),
            Some(Duration::from_millis(100)),
        )
        .await;
    match result {
        Err(MeshError::RemoteQueryTimeout { partial }) => {
            assert_eq!(partial.len(), 1);
            assert!(partial[0].is_none());
        }
        other => panic!("expected a timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn test_replica_survives_restart() {
    init_test_logging();
    let name_server = MeshBaseNameServer::new();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let a = create_test_base(&name_server, "a", Some(store.clone())).await;
    let b = create_test_base(&name_server, "b", None).await;
    let id = create_named_object(&b, "thing", "kept").await;

    a.access_locally(&MeshObjectAccessSpecification::of(id.clone()), None)
        .await
        .unwrap()
        .unwrap();
    a.flush_pending().await;
    a.die();
    name_server.unregister(a.identifier());
    drop(a);

    let reopened = create_test_base(&name_server, "a", Some(store)).await;
    let replica = reopened.find_mesh_object(&id).expect("replica restored");
    assert_eq!(replica.property(&"name".into()), Some(PropertyValue::from("kept")));
    assert_eq!(replica.proxy_towards_lock(), Some(b.identifier().clone()));
    assert!(reopened.home_object().is_some());
}

#[tokio::test]
async fn test_purged_replica_is_unregistered_at_origin() {
    init_test_logging();
    let name_server = MeshBaseNameServer::new();
    let a = create_test_base(&name_server, "a", None).await;
    let b = create_test_base(&name_server, "b", None).await;
    let id = create_named_object(&b, "thing", "x").await;

    let replica = a
        .access_locally(&MeshObjectAccessSpecification::of(id.clone()), None)
        .await
        .unwrap()
        .unwrap();
    let original = b.find_mesh_object(&id).unwrap();
    assert!(original.has_replica_in_direction(a.identifier()));

    let tx = a.create_transaction().await.unwrap();
    a.lifecycle().purge(&tx, &[replica]).await.unwrap();
    tx.commit().await.unwrap();
    assert!(a.find_mesh_object(&id).is_none());

    let unregistered = eventually(Duration::from_secs(2), || {
        let original = original.clone();
        let a = a.identifier().clone();
        async move { !original.has_replica_in_direction(&a) }
    })
    .await;
    assert!(unregistered);
}

#[tokio::test]
async fn test_unanswered_lock_request_is_a_timeout() {
    init_test_logging();
    let name_server = MeshBaseNameServer::new();
    let a = create_configured_base(
        &name_server,
        "a",
        MeshBaseConfig {
            obtain_lock_timeout_ms: 100,
            ..fast_config()
        },
    )
    .await;
    let b = create_test_base(&name_server, "b", None).await;
    let id = create_named_object(&b, "thing", "before").await;
    let replica = replicate(&a, &id).await;

    let update = b.begin_update(std::slice::from_ref(&id));
    let error = replica
        .try_to_obtain_lock(Some(Duration::from_millis(100)))
        .await
        .unwrap_err();
    assert!(matches!(error, MeshError::RemoteQueryTimeout { .. }), "got {error:?}");

    let tx = a.create_transaction().await.unwrap();
    let error = replica
        .set_property(&tx, &"name".into(), Some("after".into()))
        .await
        .unwrap_err();
    assert_eq!(error.as_str(), "remote_query_timeout");
    drop(tx);
    assert_eq!(lock_holders(&[&a, &b], &id), vec![false, true]);

    drop(update);
    let moved = eventually(Duration::from_secs(2), || {
        let replica = replica.clone();
        async move { replica.has_lock() }
    })
    .await;
    assert!(moved, "held back request was not granted after the update");
    assert_eq!(lock_holders(&[&a, &b], &id), vec![true, false]);
}

#[tokio::test]
async fn test_lock_request_waits_for_running_update() {
    init_test_logging();
    let name_server = MeshBaseNameServer::new();
    let a = create_test_base(&name_server, "a", None).await;
    let b = create_test_base(&name_server, "b", None).await;
    let x = create_named_object(&b, "x", "x").await;
    let y = create_named_object(&b, "y", "y").await;
    let replica_x = replicate(&a, &x).await;
    let replica_y = replicate(&a, &y).await;

    let update = b.begin_update(std::slice::from_ref(&x));
    assert!(replica_y.try_to_obtain_lock(None).await.unwrap(), "y is not being updated");

    let request = {
        let replica_x = replica_x.clone();
        tokio::spawn(async move { replica_x.try_to_obtain_lock(None).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(lock_holders(&[&a, &b], &x), vec![false, true]);

    drop(update);
    assert!(request.await.unwrap().unwrap());
    assert_eq!(lock_holders(&[&a, &b], &x), vec![true, false]);
}

#[tokio::test]
async fn test_lock_request_rejected_when_update_outlasts_wait() {
    init_test_logging();
    let name_server = MeshBaseNameServer::new();
    let a = create_test_base(&name_server, "a", None).await;
    let b = create_test_base(&name_server, "b", None).await;
    let id = create_named_object(&b, "thing", "x").await;
    let replica = replicate(&a, &id).await;

    let _update = b.begin_update(std::slice::from_ref(&id));
    let granted = replica
        .try_to_obtain_lock(Some(Duration::from_secs(3)))
        .await
        .unwrap();
    assert!(!granted);
    assert_eq!(lock_holders(&[&a, &b], &id), vec![false, true]);
}

#[tokio::test]
async fn test_mesh_base_scope_holds_back_every_lock() {
    init_test_logging();
    let name_server = MeshBaseNameServer::new();
    let a = create_test_base(&name_server, "a", None).await;
    let b = create_configured_base(
        &name_server,
        "b",
        MeshBaseConfig {
            lock_refusal_scope: LockRefusalScope::MeshBase,
            ..fast_config()
        },
    )
    .await;
    let x = create_named_object(&b, "x", "x").await;
    let y = create_named_object(&b, "y", "y").await;
    let replica_y = replicate(&a, &y).await;

    let update = b.begin_update(std::slice::from_ref(&x));
    let request = {
        let replica_y = replica_y.clone();
        tokio::spawn(async move { replica_y.try_to_obtain_lock(None).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(lock_holders(&[&a, &b], &y), vec![false, true]);

    drop(update);
    assert!(request.await.unwrap().unwrap());
    assert_eq!(lock_holders(&[&a, &b], &y), vec![true, false]);
}

#[tokio::test]
async fn test_replica_through_intermediary_is_tightened() {
    init_test_logging();
    let name_server = MeshBaseNameServer::new();
    let a = create_test_base(&name_server, "a", None).await;
    let b = create_test_base(&name_server, "b", None).await;
    let c = create_test_base(&name_server, "c", None).await;
    let id = create_named_object(&b, "thing", "one").await;

    let through_a = MeshObjectAccessSpecification::via(
        vec![
            MeshBaseAccessSpecification::new(a.identifier().clone()),
            MeshBaseAccessSpecification::new(b.identifier().clone()),
        ],
        id.clone(),
    );
    let at_c = c.access_locally(&through_a, None).await.unwrap().unwrap();
    let at_a = a.find_mesh_object(&id).expect("intermediary keeps its replica");
    let at_b = b.find_mesh_object(&id).unwrap();

    let tightened = eventually(Duration::from_secs(2), || {
        let at_c = at_c.clone();
        let home = b.identifier().clone();
        async move {
            at_c.proxy_towards_home().as_ref() == Some(&home)
                && at_c.proxy_towards_lock().as_ref() == Some(&home)
        }
    })
    .await;
    assert!(tightened, "replica at c still points through a");
    assert!(at_b.has_replica_in_direction(c.identifier()));
    let released = eventually(Duration::from_secs(2), || {
        let at_a = at_a.clone();
        let c = c.identifier().clone();
        async move { !at_a.has_replica_in_direction(&c) }
    })
    .await;
    assert!(released, "a still replicates towards c");

    let bases = [&a, &b, &c];
    assert_eq!(lock_holders(&bases, &id), vec![false, true, false]);

    rename(&c, &at_c, "two").await;
    assert_eq!(lock_holders(&bases, &id), vec![false, false, true]);
    let seen = eventually(Duration::from_secs(2), || {
        let at_a = at_a.clone();
        async move { at_a.property(&"name".into()) == Some(PropertyValue::from("two")) }
    })
    .await;
    assert!(seen, "change from c did not reach a");

    // b does not hold the lock and forwards a's request to c
    rename(&a, &at_a, "three").await;
    assert_eq!(lock_holders(&bases, &id), vec![true, false, false]);

    let converged = eventually(Duration::from_secs(2), || {
        let replicas = [at_a.clone(), at_b.clone(), at_c.clone()];
        async move {
            replicas
                .iter()
                .all(|replica| replica.property(&"name".into()) == Some(PropertyValue::from("three")))
        }
    })
    .await;
    assert!(converged);
}

#[tokio::test]
async fn test_home_replica_moves_to_requesting_replica() {
    init_test_logging();
    let name_server = MeshBaseNameServer::new();
    let a = create_test_base(&name_server, "a", None).await;
    let b = create_test_base(&name_server, "b", None).await;
    let id = create_named_object(&b, "thing", "x").await;
    let replica = replicate(&a, &id).await;
    let original = b.find_mesh_object(&id).unwrap();
    assert!(original.is_home_replica());

    assert!(replica.try_to_obtain_home_replica(None).await.unwrap());
    assert!(replica.is_home_replica());
    assert!(replica.proxy_towards_home().is_none());
    assert!(!original.is_home_replica());
    assert_eq!(original.proxy_towards_home(), Some(a.identifier().clone()));

    let holders = [&a, &b]
        .iter()
        .filter(|base| base.find_mesh_object(&id).is_some_and(|object| object.is_home_replica()))
        .count();
    assert_eq!(holders, 1);
}
