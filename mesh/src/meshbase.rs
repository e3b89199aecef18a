//! Mesh base
//!
//! A mesh base holds the mesh objects of one peer and the proxies connecting it
//! to its partners. It provides:
//! - transactions and publication of committed changes
//! - `access_locally`, which fetches remote objects through proxies
//! - persistence of objects and proxies through a `Store`, and restore on open
//! - update tracking used to refuse lock requests while an update runs

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::{
    sync::{watch, Mutex as AsyncMutex},
    time::Instant,
};
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use crate::{
    access::{AccessManager, PermitAll},
    config::{LockRefusalScope, MeshBaseConfig},
    endpoint::{
        listeners::{ListenerSet, Subscription},
        rpc::{JoinOutcome, ReturnSynchronizer},
    },
    error::{MeshError, MeshResult},
    identifier::{
        CoherenceSpecification, MeshBaseIdentifier, MeshObjectAccessSpecification,
        MeshObjectIdentifier,
    },
    lifecycle::LifecycleManager,
    model::TypeRegistry,
    object::{externalized::ExternalizedMeshObject, MeshObject},
    proxy::{manager::ProxyManager, sweeper::ProxySweeper, ExternalizedProxy, TransportFactory},
    store::{object_key, MemoryStore, Store, StoreValue, OBJECT_KEY_PREFIX, PROXY_KEY_PREFIX},
    transaction::{ChangeSet, Transaction},
};

/// Mesh base events, every method defaults to doing nothing
pub trait MeshBaseListener: Send + Sync {
    fn transaction_committed(&self, _base: &MeshBaseIdentifier, _changes: &ChangeSet) {}

    fn lock_gained(&self, _object: &MeshObjectIdentifier) {}

    fn lock_lost(&self, _object: &MeshObjectIdentifier) {}

    fn home_replica_gained(&self, _object: &MeshObjectIdentifier) {}

    fn home_replica_lost(&self, _object: &MeshObjectIdentifier) {}

    /// A partner asked for replicas and wants them kept fresh as described
    fn coherence_requested(&self, _partner: &MeshBaseIdentifier, _coherence: &CoherenceSpecification) {}

    /// A partner stopped replicating `objects` from us
    fn replicas_canceled(&self, _partner: &MeshBaseIdentifier, _objects: &[MeshObjectIdentifier]) {}
}

#[derive(Default)]
struct UpdateRegistry {
    next_id: u64,
    active: HashMap<u64, BTreeSet<MeshObjectIdentifier>>,
}

/// Marks an update in progress until dropped
///
/// While the guard lives, lock requests from partners for the covered objects
/// (or for every object, depending on `LockRefusalScope`) are held back.
#[must_use = "the update ends when the guard is dropped"]
pub struct UpdateGuard {
    base: Weak<MeshBase>,
    id: u64,
}

impl UpdateGuard {
    /// Adds `object` to the objects this update refuses to give up
    pub fn cover(&self, object: &MeshObjectIdentifier) {
        if let Some(base) = self.base.upgrade() {
            if let Some(objects) = base.updates.lock().active.get_mut(&self.id) {
                objects.insert(object.clone());
            }
        }
    }
}

impl Drop for UpdateGuard {
    fn drop(&mut self) {
        if let Some(base) = self.base.upgrade() {
            base.updates.lock().active.remove(&self.id);
            base.updates_changed
                .send_modify(|generation| *generation = generation.wrapping_add(1));
        }
    }
}

pub struct MeshBase {
    identifier: MeshBaseIdentifier,
    config: MeshBaseConfig,
    store: Arc<dyn Store>,
    types: Arc<TypeRegistry>,
    access_manager: Arc<dyn AccessManager>,
    objects: DashMap<MeshObjectIdentifier, Arc<MeshObject>>,
    proxy_manager: ProxyManager,
    lifecycle: LifecycleManager,
    transaction_lock: Arc<AsyncMutex<()>>,
    listeners: ListenerSet<dyn MeshBaseListener>,
    updates: Mutex<UpdateRegistry>,
    updates_changed: watch::Sender<u64>,
    pending_flushes: Mutex<BTreeSet<MeshObjectIdentifier>>,
    flush_scheduled: AtomicBool,
    self_ref: Weak<MeshBase>,
    shutdown_tx: watch::Sender<bool>,
    dead: AtomicBool,
}

impl MeshBase {
    pub fn builder(
        identifier: impl Into<MeshBaseIdentifier>,
        transport_factory: Arc<dyn TransportFactory>,
    ) -> MeshBaseBuilder {
        MeshBaseBuilder {
            identifier: identifier.into(),
            transport_factory,
            config: MeshBaseConfig::default(),
            store: Arc::new(MemoryStore::new()),
            types: Arc::new(TypeRegistry::open()),
            access_manager: Arc::new(PermitAll),
        }
    }

    pub fn identifier(&self) -> &MeshBaseIdentifier {
        &self.identifier
    }

    pub fn config(&self) -> &MeshBaseConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    pub fn access_manager(&self) -> &Arc<dyn AccessManager> {
        &self.access_manager
    }

    pub fn proxy_manager(&self) -> &ProxyManager {
        &self.proxy_manager
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn listeners(&self) -> &ListenerSet<dyn MeshBaseListener> {
        &self.listeners
    }

    pub fn add_listener(&self, listener: Arc<dyn MeshBaseListener>) -> Subscription {
        self.listeners.subscribe(listener)
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    fn check_alive(&self) -> MeshResult<()> {
        if self.is_dead() {
            return Err(MeshError::MeshBaseIsDead(self.identifier.clone()));
        }
        Ok(())
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// Waits for the running application transaction, if any, and starts a new one
    pub async fn create_transaction(self: &Arc<Self>) -> MeshResult<Transaction> {
        self.check_alive()?;
        let guard = self.transaction_lock.clone().lock_owned().await;
        self.check_alive()?;
        Ok(Transaction::new(self.clone(), None, Some(guard)))
    }

    /// Transaction applying what `origin` sent us
    pub(crate) fn create_replication_transaction(
        self: &Arc<Self>,
        origin: MeshBaseIdentifier,
    ) -> Transaction {
        Transaction::new(self.clone(), Some(origin), None)
    }

    /// Forwards committed changes to the proxies, persists, then notifies listeners
    pub(crate) async fn transaction_committed(
        &self,
        changes: &ChangeSet,
        origin: Option<&MeshBaseIdentifier>,
    ) -> MeshResult<()> {
        if changes.is_empty() {
            return Ok(());
        }
        debug!(
            base = %self.identifier,
            changes = changes.len(),
            origin = ?origin,
            "Publishing committed changes"
        );
        for proxy in self.proxy_manager.proxies() {
            proxy.transaction_committed(changes);
        }
        self.pending_flushes
            .lock()
            .extend(changes.affected_objects());
        self.flush_pending().await;
        self.listeners.fire("transaction_committed", |l| {
            l.transaction_committed(&self.identifier, changes)
        });
        Ok(())
    }

    // ========================================================================
    // Objects
    // ========================================================================

    pub fn find_mesh_object(&self, identifier: &MeshObjectIdentifier) -> Option<Arc<MeshObject>> {
        self.objects.get(identifier).map(|object| object.clone())
    }

    pub fn home_object(&self) -> Option<Arc<MeshObject>> {
        self.find_mesh_object(&MeshObjectIdentifier::home_of(&self.identifier))
    }

    pub fn size(&self) -> usize {
        self.objects.len()
    }

    pub fn objects(&self) -> Vec<Arc<MeshObject>> {
        self.objects.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Whether any local object is replicated to or from another mesh base
    pub fn has_replicas(&self) -> bool {
        self.objects.iter().any(|entry| entry.value().has_replicas())
    }

    pub(crate) fn insert_object(&self, object: Arc<MeshObject>) {
        self.objects.insert(object.identifier().clone(), object);
    }

    pub(crate) fn remove_object(&self, identifier: &MeshObjectIdentifier) -> Option<Arc<MeshObject>> {
        self.objects.remove(identifier).map(|(_, object)| object)
    }

    // ========================================================================
    // Access
    // ========================================================================

    /// Finds the object `path` leads to, replicating it from a partner if needed
    ///
    /// `Ok(None)` means the object does not exist. A partner that does not
    /// answer in time yields `RemoteQueryTimeout`.
    pub async fn access_locally(
        self: &Arc<Self>,
        path: &MeshObjectAccessSpecification,
        timeout: Option<Duration>,
    ) -> MeshResult<Option<Arc<MeshObject>>> {
        let mut found = self
            .access_locally_all(std::slice::from_ref(path), timeout)
            .await?;
        Ok(found.pop().flatten())
    }

    /// Batched `access_locally`: one request per first hop, all hops concurrently
    #[instrument(skip(self, paths), fields(base = %self.identifier, count = paths.len()))]
    pub async fn access_locally_all(
        self: &Arc<Self>,
        paths: &[MeshObjectAccessSpecification],
        timeout: Option<Duration>,
    ) -> MeshResult<Vec<Option<Arc<MeshObject>>>> {
        self.check_alive()?;
        self.access_manager
            .check_permitted_access_locally(&self.identifier, paths)?;

        let corrected: Vec<MeshObjectAccessSpecification> = paths
            .iter()
            .map(|path| path.corrected_for(&self.identifier))
            .collect();
        let mut results: Vec<Option<Arc<MeshObject>>> =
            corrected.iter().map(|path| self.find_mesh_object(&path.object)).collect();

        let mut by_pivot: BTreeMap<MeshBaseIdentifier, (Option<CoherenceSpecification>, Vec<MeshObjectAccessSpecification>)> =
            BTreeMap::new();
        for (path, result) in corrected.iter().zip(&results) {
            if result.is_some() {
                continue;
            }
            let Some(pivot) = path.pivot() else {
                continue;
            };
            let (coherence, requests) = by_pivot.entry(pivot.base.clone()).or_default();
            if coherence.is_none() {
                *coherence = pivot.coherence.clone();
            }
            requests.push(path.without_pivot());
        }
        if by_pivot.is_empty() {
            return Ok(results);
        }

        let synchronizer = Arc::new(ReturnSynchronizer::new());
        let mut calls = Vec::with_capacity(by_pivot.len());
        for (pivot, (coherence, requests)) in by_pivot {
            debug!(%pivot, count = requests.len(), "Requesting replicas");
            let proxy = self.proxy_manager.obtain_for(&pivot)?;
            calls.push(proxy.request_replicas(requests, coherence, &synchronizer)?);
        }

        let timeout = timeout.unwrap_or_else(|| self.config.access_locally_timeout());
        let outcome = synchronizer.join(timeout).await;
        drop(calls);

        for (path, result) in corrected.iter().zip(results.iter_mut()) {
            if result.is_none() {
                *result = self.find_mesh_object(&path.object);
            }
        }
        match outcome {
            JoinOutcome::Completed => Ok(results),
            JoinOutcome::TimedOut => {
                warn!(?timeout, "Remote query timed out");
                Err(MeshError::RemoteQueryTimeout { partial: results })
            }
            JoinOutcome::Failed(error) => Err(MeshError::EndpointDead(error)),
        }
    }

    // ========================================================================
    // Updates and lock refusal
    // ========================================================================

    /// Starts an update covering `objects`
    pub fn begin_update(&self, objects: &[MeshObjectIdentifier]) -> UpdateGuard {
        let mut updates = self.updates.lock();
        updates.next_id += 1;
        let id = updates.next_id;
        updates.active.insert(id, objects.iter().cloned().collect());
        UpdateGuard {
            base: self.self_ref.clone(),
            id,
        }
    }

    /// Whether a lock request for `object` has to wait for a running update
    pub fn refuses_to_give_up_lock(&self, object: &MeshObjectIdentifier) -> bool {
        let updates = self.updates.lock();
        match self.config.lock_refusal_scope {
            LockRefusalScope::MeshBase => !updates.active.is_empty(),
            LockRefusalScope::PerObject => {
                updates.active.values().any(|objects| objects.contains(object))
            }
        }
    }

    /// Waits until no running update refuses to give up `object`; false on timeout
    pub async fn wait_for_lock_release(&self, object: &MeshObjectIdentifier, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut changes = self.updates_changed.subscribe();
        loop {
            if !self.refuses_to_give_up_lock(object) {
                return true;
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return !self.refuses_to_give_up_lock(object),
            }
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Persists `identifier` soon; deleted objects are removed from the store
    pub(crate) fn schedule_flush(&self, identifier: MeshObjectIdentifier) {
        self.pending_flushes.lock().insert(identifier);
        if self.flush_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(base) = self.self_ref.upgrade() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tokio::task::yield_now().await;
                    base.flush_pending().await;
                });
            }
            Err(_) => {
                self.flush_scheduled.store(false, Ordering::SeqCst);
                debug!(base = %self.identifier, "No runtime, flush deferred to next commit");
            }
        }
    }

    /// Writes every object scheduled for persistence
    pub async fn flush_pending(&self) {
        self.flush_scheduled.store(false, Ordering::SeqCst);
        let pending = std::mem::take(&mut *self.pending_flushes.lock());
        for identifier in pending {
            if let Err(error) = self.flush_object(&identifier).await {
                warn!(base = %self.identifier, object = %identifier, error = %error, "Cannot persist mesh object");
            }
        }
    }

    pub async fn flush_object(&self, identifier: &MeshObjectIdentifier) -> MeshResult<()> {
        let key = object_key(identifier);
        match self.find_mesh_object(identifier) {
            Some(object) if !object.is_dead() => {
                let bytes = object.as_externalized(true).to_bytes()?;
                self.store.put_or_update(&key, bytes).await?;
            }
            _ => {
                self.store.remove(&key).await?;
            }
        }
        Ok(())
    }

    async fn restore(&self) -> MeshResult<()> {
        let mut restored_objects = 0;
        for key in self.store.keys_with_prefix(OBJECT_KEY_PREFIX).await? {
            let Some(bytes) = self.store.get(&key).await? else {
                continue;
            };
            match ExternalizedMeshObject::from_bytes(&bytes) {
                Ok(external) => {
                    self.lifecycle.recreate(external)?;
                    restored_objects += 1;
                }
                Err(error) => warn!(base = %self.identifier, %key, error = %error, "Skipping undecodable mesh object"),
            }
        }

        let mut restored_proxies = 0;
        for key in self.store.keys_with_prefix(PROXY_KEY_PREFIX).await? {
            let Some(bytes) = self.store.get(&key).await? else {
                continue;
            };
            match ExternalizedProxy::from_bytes(&bytes) {
                Ok(external) => {
                    self.proxy_manager.restore(external)?;
                    restored_proxies += 1;
                }
                Err(error) => warn!(base = %self.identifier, %key, error = %error, "Skipping undecodable proxy"),
            }
        }

        if restored_objects > 0 || restored_proxies > 0 {
            info!(
                base = %self.identifier,
                objects = restored_objects,
                proxies = restored_proxies,
                "Restored mesh base"
            );
        }
        Ok(())
    }

    // ========================================================================
    // Proxies
    // ========================================================================

    /// Ceases communications on every proxy that no object is replicated through
    pub async fn cease_unused_proxies(&self) -> usize {
        let mut ceased = 0;
        for proxy in self.proxy_manager.proxies() {
            if proxy.is_ceasing() || !proxy.is_idle() {
                continue;
            }
            let partner = proxy.partner().clone();
            let in_use = self
                .objects
                .iter()
                .any(|entry| entry.value().has_replica_in_direction(&partner));
            if in_use {
                continue;
            }
            if let Err(error) = proxy.initiate_cease_communications().await {
                warn!(base = %self.identifier, %partner, error = %error, "Cannot cease unused proxy");
                continue;
            }
            ceased += 1;
        }
        ceased
    }

    /// Shuts the mesh base down; every proxy dies and background tasks stop
    pub fn die(&self) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        self.proxy_manager.die_all();
        info!(base = %self.identifier, "Mesh base died");
    }

    pub(crate) fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}

impl fmt::Debug for MeshBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MeshBase")
            .field("identifier", &self.identifier)
            .field("objects", &self.objects.len())
            .field("proxies", &self.proxy_manager.len())
            .field("dead", &self.is_dead())
            .finish()
    }
}

// ============================================================================
// Builder
// ============================================================================

pub struct MeshBaseBuilder {
    identifier: MeshBaseIdentifier,
    transport_factory: Arc<dyn TransportFactory>,
    config: MeshBaseConfig,
    store: Arc<dyn Store>,
    types: Arc<TypeRegistry>,
    access_manager: Arc<dyn AccessManager>,
}

impl MeshBaseBuilder {
    pub fn config(mut self, config: MeshBaseConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = store;
        self
    }

    pub fn types(mut self, types: Arc<TypeRegistry>) -> Self {
        self.types = types;
        self
    }

    pub fn access_manager(mut self, access_manager: Arc<dyn AccessManager>) -> Self {
        self.access_manager = access_manager;
        self
    }

    /// Opens the mesh base: restores persisted state and creates the home object
    pub async fn build(self) -> MeshResult<Arc<MeshBase>> {
        self.config.validate().map_err(MeshError::InvalidConfig)?;
        let identifier = self.identifier;
        let (shutdown_tx, _) = watch::channel(false);
        let base = Arc::new_cyclic(|weak: &Weak<MeshBase>| MeshBase {
            identifier: identifier.clone(),
            proxy_manager: ProxyManager::new(identifier.clone(), weak.clone(), self.transport_factory),
            lifecycle: LifecycleManager::new(weak.clone()),
            config: self.config,
            store: self.store,
            types: self.types,
            access_manager: self.access_manager,
            objects: DashMap::new(),
            transaction_lock: Arc::new(AsyncMutex::new(())),
            listeners: ListenerSet::new(),
            updates: Mutex::new(UpdateRegistry::default()),
            updates_changed: watch::channel(0).0,
            pending_flushes: Mutex::new(BTreeSet::new()),
            flush_scheduled: AtomicBool::new(false),
            self_ref: weak.clone(),
            shutdown_tx,
            dead: AtomicBool::new(false),
        });

        base.restore().await?;

        if base.home_object().is_none() {
            let tx = base.create_transaction().await?;
            base.lifecycle
                .create_mesh_object(&tx, Some(MeshObjectIdentifier::home_of(&identifier)), &[])
                .await?;
            tx.commit().await?;
        }

        if let Some(interval) = base.config.proxy_sweep_interval() {
            let sweeper = ProxySweeper::new(Arc::downgrade(&base), interval);
            let span = info_span!("proxy_sweeper", base = %identifier);
            tokio::spawn(sweeper.start_sweep_task(base.shutdown_receiver()).instrument(span));
        }

        info!(base = %identifier, objects = base.size(), "Opened mesh base");
        Ok(base)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{MessageTransport, SendError};
    use crate::xpriso::XprisoMessage;
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl MessageTransport<XprisoMessage> for Unreachable {
        async fn send_message(&self, _token: i64, _content: Vec<XprisoMessage>) -> Result<(), SendError> {
            Err(SendError::Transient("unreachable".to_string()))
        }
    }

    impl TransportFactory for Unreachable {
        fn transport_for(
            &self,
            _local: &MeshBaseIdentifier,
            _partner: &MeshBaseIdentifier,
        ) -> Arc<dyn MessageTransport<XprisoMessage>> {
            Arc::new(Unreachable)
        }
    }

    async fn base(scope: LockRefusalScope) -> Arc<MeshBase> {
        let mut config = MeshBaseConfig::default();
        config.lock_refusal_scope = scope;
        MeshBase::builder("a", Arc::new(Unreachable))
            .config(config)
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_home_object() {
        let base = base(LockRefusalScope::PerObject).await;
        let home = base.home_object().unwrap();
        assert!(home.is_home_object());
        assert!(home.has_lock());
        assert!(home.is_home_replica());
        assert_eq!(base.size(), 1);
    }

    #[tokio::test]
    async fn test_per_object_lock_refusal() {
        let base = base(LockRefusalScope::PerObject).await;
        let x = MeshObjectIdentifier::new("a".into(), "x");
        let y = MeshObjectIdentifier::new("a".into(), "y");

        let guard = base.begin_update(&[x.clone()]);
        assert!(base.refuses_to_give_up_lock(&x));
        assert!(!base.refuses_to_give_up_lock(&y));
        guard.cover(&y);
        assert!(base.refuses_to_give_up_lock(&y));
        drop(guard);
        assert!(!base.refuses_to_give_up_lock(&x));
    }

    #[tokio::test]
    async fn test_mesh_base_lock_refusal() {
        let base = base(LockRefusalScope::MeshBase).await;
        let x = MeshObjectIdentifier::new("a".into(), "x");
        let y = MeshObjectIdentifier::new("a".into(), "y");

        let guard = base.begin_update(&[x]);
        assert!(base.refuses_to_give_up_lock(&y));

        let waiter = {
            let base = base.clone();
            tokio::spawn(async move { base.wait_for_lock_release(&y, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(guard);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_for_lock_release_times_out() {
        let base = base(LockRefusalScope::PerObject).await;
        let x = MeshObjectIdentifier::new("a".into(), "x");
        let _guard = base.begin_update(&[x.clone()]);
        assert!(!base.wait_for_lock_release(&x, Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_access_local_and_missing_objects() {
        let base = base(LockRefusalScope::PerObject).await;
        let home = MeshObjectAccessSpecification::of(MeshObjectIdentifier::home_of(base.identifier()));
        let missing = MeshObjectAccessSpecification::of(MeshObjectIdentifier::new("a".into(), "nope"));

        let found = base.access_locally_all(&[home, missing], None).await.unwrap();
        assert!(found[0].is_some());
        assert!(found[1].is_none());
        assert!(base.proxy_manager().is_empty());
    }

    #[tokio::test]
    async fn test_dead_mesh_base_refuses_transactions() {
        let base = base(LockRefusalScope::PerObject).await;
        base.die();
        assert!(matches!(
            base.create_transaction().await,
            Err(MeshError::MeshBaseIsDead(_))
        ));
    }
}
