//! Proxies
//!
//! A `Proxy` is one mesh base's side of the replication relationship with one
//! partner mesh base. It owns the ping-pong endpoint to the partner and runs
//! the Xpriso protocol over it:
//! - replica requests, resynchronization and cancellation
//! - lock and home replica requests, pushes and reclaims, forwarded along the
//!   pointer chain when this replica does not hold what is asked for
//! - forwarding of committed changes to the partner
//! - graceful cease of communications
//!
//! Incoming messages are handled one at a time on a worker task. Calls that
//! wait for the partner use three return-synchronizer endpoints (replica, lock,
//! home) sharing one invocation-id source.

pub mod instructions;
pub mod manager;
pub mod policy;
pub mod sweeper;

use std::{
    collections::BTreeMap,
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, Notify},
    task::JoinHandle,
};
use tracing::{debug, info, info_span, instrument, warn, Instrument};

use self::{
    instructions::ProxyInstructions,
    manager::RequestKind,
    policy::{decide_conveyed, ConveyedAction, LocalPointers},
};
use crate::{
    config::ProxyConfig,
    endpoint::{
        listeners::{ListenerSet, Subscription},
        pingpong::{PingPongEndpoint, PingPongState},
        rpc::{PendingCall, ReturnSynchronizer, ReturnSynchronizerEndpoint},
        MessageEndpointListener, MessageTransport,
    },
    error::{CallError, EndpointError, MeshError, MeshResult},
    identifier::{CoherenceSpecification, MeshBaseIdentifier, MeshObjectAccessSpecification, MeshObjectIdentifier},
    meshbase::MeshBase,
    object::MeshObject,
    store::{proxy_key, StoreValue},
    transaction::{Change, ChangeSet, Transaction},
    xpriso::XprisoMessage,
};

/// Creates the transport a new proxy uses to reach its partner
pub trait TransportFactory: Send + Sync {
    fn transport_for(
        &self,
        local: &MeshBaseIdentifier,
        partner: &MeshBaseIdentifier,
    ) -> Arc<dyn MessageTransport<XprisoMessage>>;
}

/// Proxy events, every method defaults to doing nothing
pub trait ProxyListener: Send + Sync {
    /// A call waiting for the partner timed out or its endpoint died
    fn waiting_send_failed(&self, _partner: &MeshBaseIdentifier, _error: &MeshError) {}

    fn resynchronize_failed(
        &self,
        _partner: &MeshBaseIdentifier,
        _objects: &[MeshObjectIdentifier],
        _error: &MeshError,
    ) {
    }

    fn ceased_communications(&self, _partner: &MeshBaseIdentifier) {}
}

/// Persisted form of a proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalizedProxy {
    pub partner: MeshBaseIdentifier,
    pub state: PingPongState<XprisoMessage>,
}

enum ProxyTask {
    Incoming(XprisoMessage),
    Persist,
    Disabled(EndpointError),
}

/// Forwards endpoint events to the proxy's worker
struct EndpointRelay {
    tasks: mpsc::UnboundedSender<ProxyTask>,
    cease_sent: Arc<Notify>,
}

impl MessageEndpointListener<XprisoMessage> for EndpointRelay {
    fn message_received(&self, message: &XprisoMessage) {
        let _ = self.tasks.send(ProxyTask::Incoming(message.clone()));
    }

    fn message_sent(&self, message: &XprisoMessage) {
        if message.cease_communications {
            self.cease_sent.notify_one();
        }
    }

    fn token_sent(&self, _token: i64) {
        let _ = self.tasks.send(ProxyTask::Persist);
    }

    fn token_received(&self, _token: i64) {
        let _ = self.tasks.send(ProxyTask::Persist);
    }

    fn disabling_error(&self, error: &EndpointError) {
        self.cease_sent.notify_one();
        let _ = self.tasks.send(ProxyTask::Disabled(error.clone()));
    }
}

pub struct Proxy {
    local: MeshBaseIdentifier,
    partner: MeshBaseIdentifier,
    base: Weak<MeshBase>,
    config: ProxyConfig,
    endpoint: PingPongEndpoint<XprisoMessage>,
    replica_waiter: ReturnSynchronizerEndpoint<XprisoMessage>,
    lock_waiter: ReturnSynchronizerEndpoint<XprisoMessage>,
    home_waiter: ReturnSynchronizerEndpoint<XprisoMessage>,
    listeners: ListenerSet<dyn ProxyListener>,
    ceasing: AtomicBool,
    cease_sent: Arc<Notify>,
    subscription: Mutex<Option<Subscription>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Proxy {
    /// Creates a proxy and starts its worker; `state` resumes a persisted endpoint
    pub(crate) fn new(
        base: &Arc<MeshBase>,
        partner: MeshBaseIdentifier,
        transport: Arc<dyn MessageTransport<XprisoMessage>>,
        state: Option<PingPongState<XprisoMessage>>,
    ) -> Arc<Self> {
        let local = base.identifier().clone();
        let config = base.config().proxy.clone();
        let resume = state.is_some();
        let endpoint = PingPongEndpoint::restore(
            format!("{local}->{partner}"),
            config.endpoint.clone(),
            transport,
            state.unwrap_or_default(),
        );
        let ids = Arc::new(AtomicU64::new(0));
        let waiter = |ids: &Arc<AtomicU64>| {
            ReturnSynchronizerEndpoint::with_id_source(endpoint.clone(), ids.clone(), config.rpc_wait())
        };
        let (tasks, receiver) = mpsc::unbounded_channel();
        let cease_sent = Arc::new(Notify::new());

        let proxy = Arc::new(Self {
            replica_waiter: waiter(&ids),
            lock_waiter: waiter(&ids),
            home_waiter: waiter(&ids),
            local: local.clone(),
            partner: partner.clone(),
            base: Arc::downgrade(base),
            config,
            endpoint,
            listeners: ListenerSet::new(),
            ceasing: AtomicBool::new(false),
            cease_sent: cease_sent.clone(),
            subscription: Mutex::new(None),
            worker: Mutex::new(None),
        });

        let subscription = proxy
            .endpoint
            .add_listener(Arc::new(EndpointRelay { tasks, cease_sent }));
        *proxy.subscription.lock() = Some(subscription);

        let span = info_span!("proxy", local = %local, partner = %partner);
        let worker = tokio::spawn(Self::run(Arc::downgrade(&proxy), receiver).instrument(span));
        *proxy.worker.lock() = Some(worker);

        if resume {
            proxy.endpoint.start_communicating();
        }
        proxy
    }

    async fn run(proxy: Weak<Proxy>, mut receiver: mpsc::UnboundedReceiver<ProxyTask>) {
        while let Some(task) = receiver.recv().await {
            let Some(proxy) = proxy.upgrade() else {
                break;
            };
            match task {
                ProxyTask::Incoming(message) => proxy.process_incoming(message).await,
                ProxyTask::Persist => proxy.persist().await,
                ProxyTask::Disabled(error) => proxy.disabled(&error),
            }
        }
        debug!("Proxy worker stopped");
    }

    pub fn partner(&self) -> &MeshBaseIdentifier {
        &self.partner
    }

    pub fn local(&self) -> &MeshBaseIdentifier {
        &self.local
    }

    pub fn endpoint(&self) -> &PingPongEndpoint<XprisoMessage> {
        &self.endpoint
    }

    pub fn is_dead(&self) -> bool {
        self.endpoint.is_dead()
    }

    pub fn is_ceasing(&self) -> bool {
        self.ceasing.load(Ordering::SeqCst)
    }

    /// No call is waiting for the partner and nothing is queued for it
    pub fn is_idle(&self) -> bool {
        self.replica_waiter.pending_calls() == 0
            && self.lock_waiter.pending_calls() == 0
            && self.home_waiter.pending_calls() == 0
            && self.endpoint.messages_to_be_sent().is_empty()
    }

    pub fn add_listener(&self, listener: Arc<dyn ProxyListener>) -> Subscription {
        self.listeners.subscribe(listener)
    }

    pub fn as_externalized(&self) -> ExternalizedProxy {
        ExternalizedProxy {
            partner: self.partner.clone(),
            state: self.endpoint.snapshot(),
        }
    }

    fn base(&self) -> MeshResult<Arc<MeshBase>> {
        self.base
            .upgrade()
            .ok_or_else(|| MeshError::MeshBaseIsDead(self.local.clone()))
    }

    fn new_message(&self) -> XprisoMessage {
        XprisoMessage::new(self.local.clone(), self.partner.clone())
    }

    fn send(&self, message: XprisoMessage) -> MeshResult<()> {
        self.endpoint.enqueue_message_for_send(message)?;
        self.endpoint.start_communicating();
        Ok(())
    }

    /// Sends `message` as a call on `waiter` and waits for the partner's response
    async fn waiting_send(
        &self,
        waiter: &ReturnSynchronizerEndpoint<XprisoMessage>,
        message: XprisoMessage,
        timeout: Duration,
    ) -> MeshResult<()> {
        let error = match waiter.call_and_wait(message, Some(timeout)).await {
            Ok(_) => return Ok(()),
            Err(CallError::Endpoint(error)) => MeshError::EndpointDead(error),
            Err(error) => {
                debug!(partner = %self.partner, error = %error, "No response from partner");
                MeshError::from(error)
            }
        };
        self.listeners.fire("waiting_send_failed", |l| {
            l.waiting_send_failed(&self.partner, &error)
        });
        Err(error)
    }

    // ========================================================================
    // Outgoing operations
    // ========================================================================

    /// Sends a replica request as part of `synchronizer`'s set of queries
    pub(crate) fn request_replicas(
        &self,
        paths: Vec<MeshObjectAccessSpecification>,
        coherence: Option<CoherenceSpecification>,
        synchronizer: &Arc<ReturnSynchronizer<XprisoMessage>>,
    ) -> MeshResult<PendingCall<XprisoMessage>> {
        let mut message = self.new_message();
        message.requested_first_time_objects = paths;
        message.coherence = coherence;
        Ok(self.replica_waiter.call(message, synchronizer)?)
    }

    /// Asks the partner for replicas of `paths`, as seen from the partner
    #[instrument(skip(self, paths), fields(partner = %self.partner, count = paths.len()))]
    pub async fn obtain_replicas(
        &self,
        paths: Vec<MeshObjectAccessSpecification>,
        timeout: Duration,
    ) -> MeshResult<()> {
        let synchronizer = Arc::new(ReturnSynchronizer::new());
        let call = self.request_replicas(paths, None, &synchronizer)?;
        call.wait(timeout).await?;
        Ok(())
    }

    #[instrument(skip(self, objects), fields(partner = %self.partner, count = objects.len()))]
    pub async fn try_to_obtain_locks(
        &self,
        objects: &[Arc<MeshObject>],
        timeout: Duration,
    ) -> MeshResult<()> {
        let mut message = self.new_message();
        message.requested_lock_objects = objects
            .iter()
            .filter(|o| !o.has_lock())
            .map(|o| o.identifier().clone())
            .collect();
        if message.requested_lock_objects.is_empty() {
            return Ok(());
        }
        let base = self.base()?;
        let _in_flight = base
            .proxy_manager()
            .mark_in_flight(RequestKind::Lock, &message.requested_lock_objects);
        self.waiting_send(&self.lock_waiter, message, timeout).await
    }

    /// Hands the locks we hold to the partner
    #[instrument(skip(self, objects), fields(partner = %self.partner, count = objects.len()))]
    pub async fn try_to_push_locks(
        &self,
        objects: &[Arc<MeshObject>],
        timeout: Duration,
    ) -> MeshResult<()> {
        let base = self.base()?;
        let mut message = self.new_message();
        for object in objects {
            if !object.has_lock() {
                continue;
            }
            if !object.has_replica_in_direction(&self.partner) {
                warn!(object = %object.identifier(), partner = %self.partner, "Cannot push lock to a partner without replica");
                continue;
            }
            base.access_manager()
                .check_permitted_lock_transfer(object, &self.partner)?;
            object.surrender_lock(&self.partner, true);
            base.schedule_flush(object.identifier().clone());
            message.pushed_locks.push(object.identifier().clone());
        }
        if message.pushed_locks.is_empty() {
            return Ok(());
        }
        self.waiting_send(&self.lock_waiter, message, timeout).await
    }

    #[instrument(skip(self, objects), fields(partner = %self.partner, count = objects.len()))]
    pub async fn try_to_obtain_home_replicas(
        &self,
        objects: &[Arc<MeshObject>],
        timeout: Duration,
    ) -> MeshResult<()> {
        let mut message = self.new_message();
        message.requested_home_replicas = objects
            .iter()
            .filter(|o| !o.is_home_replica())
            .map(|o| o.identifier().clone())
            .collect();
        if message.requested_home_replicas.is_empty() {
            return Ok(());
        }
        let base = self.base()?;
        let _in_flight = base
            .proxy_manager()
            .mark_in_flight(RequestKind::HomeReplica, &message.requested_home_replicas);
        self.waiting_send(&self.home_waiter, message, timeout).await
    }

    #[instrument(skip(self, objects), fields(partner = %self.partner, count = objects.len()))]
    pub async fn try_to_push_home_replicas(
        &self,
        objects: &[Arc<MeshObject>],
        timeout: Duration,
    ) -> MeshResult<()> {
        let base = self.base()?;
        let mut message = self.new_message();
        for object in objects {
            if !object.is_home_replica() {
                continue;
            }
            if !object.has_replica_in_direction(&self.partner) {
                warn!(object = %object.identifier(), partner = %self.partner, "Cannot push home to a partner without replica");
                continue;
            }
            object.surrender_home_replica(&self.partner, true);
            base.schedule_flush(object.identifier().clone());
            message.pushed_home_replicas.push(object.identifier().clone());
        }
        if message.pushed_home_replicas.is_empty() {
            return Ok(());
        }
        self.waiting_send(&self.home_waiter, message, timeout).await
    }

    /// Tells the partner that we took the locks of `objects` back
    pub fn force_obtain_locks(&self, objects: &[Arc<MeshObject>]) -> MeshResult<()> {
        let mut message = self.new_message();
        message.reclaimed_lock_objects = objects.iter().map(|o| o.identifier().clone()).collect();
        if message.reclaimed_lock_objects.is_empty() {
            return Ok(());
        }
        self.send(message)
    }

    /// Asks the partner to convey its current replicas of `objects`
    #[instrument(skip(self, objects), fields(partner = %self.partner, count = objects.len()))]
    pub async fn try_resynchronize_replicas(
        &self,
        objects: Vec<MeshObjectIdentifier>,
        timeout: Duration,
    ) -> MeshResult<()> {
        if objects.is_empty() {
            return Ok(());
        }
        let mut message = self.new_message();
        message.requested_resynchronize_replicas = objects.clone();
        let result = self
            .replica_waiter
            .call_and_wait(message, Some(timeout))
            .await
            .map(|_| ())
            .map_err(MeshError::from);
        if let Err(error) = &result {
            warn!(partner = %self.partner, error = %error, "Resynchronization failed");
            self.listeners.fire("resynchronize_failed", |l| {
                l.resynchronize_failed(&self.partner, &objects, error)
            });
        }
        result
    }

    /// Stops replicating `objects` through this proxy and tells the partner
    pub fn cancel_replicas(&self, objects: &[Arc<MeshObject>]) -> MeshResult<()> {
        let base = self.base()?;
        let mut message = self.new_message();
        for object in objects {
            object.unregister_replication_towards(&self.partner);
            base.schedule_flush(object.identifier().clone());
            message.requested_canceled_objects.push(object.identifier().clone());
        }
        if message.requested_canceled_objects.is_empty() {
            return Ok(());
        }
        self.send(message)
    }

    /// Tells the partner we are going away, waits until that has been sent,
    /// then removes this proxy from its mesh base
    #[instrument(skip(self), fields(local = %self.local, partner = %self.partner))]
    pub async fn initiate_cease_communications(self: &Arc<Self>) -> MeshResult<()> {
        if self.ceasing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut message = self.new_message();
        message.cease_communications = true;
        if let Err(error) = self.send(message) {
            debug!(error = %error, "Ceasing a proxy whose endpoint is dead");
        } else {
            let flush = self.config.cease_flush();
            if tokio::time::timeout(flush, self.cease_sent.notified()).await.is_err() {
                warn!(?flush, "Cease notice not sent in time, removing proxy anyway");
            }
        }
        info!("Ceased communications");
        self.listeners.fire("ceased_communications", |l| {
            l.ceased_communications(&self.partner)
        });
        match self.base.upgrade() {
            Some(base) => {
                base.proxy_manager().remove(&self.partner).await?;
            }
            None => self.die(),
        }
        Ok(())
    }

    /// Forwards the parts of a committed transaction that concern the partner
    pub fn transaction_committed(&self, changes: &ChangeSet) {
        let Some(base) = self.base.upgrade() else {
            return;
        };
        if self.is_dead() || self.is_ceasing() {
            return;
        }
        let capture = !self.config.points_replicas_to_itself;
        let mut message = self.new_message();
        for event in changes.iter() {
            if !event.should_be_sent_to(&self.partner) {
                continue;
            }
            match &event.change {
                Change::ReplicaPurged { object } => {
                    message.requested_canceled_objects.push(object.clone());
                }
                Change::Created { .. } | Change::ReplicaCreated { .. } => {}
                Change::NeighborAdded { neighbor, .. } => {
                    if let Some(neighbor) = base.find_mesh_object(neighbor) {
                        if !neighbor.has_replica_in_direction(&self.partner) {
                            message.convey(neighbor.as_externalized(capture));
                            neighbor.register_replication_towards(&self.partner);
                            base.schedule_flush(neighbor.identifier().clone());
                        }
                    }
                    message.changes.push(event.change.clone());
                }
                change => message.changes.push(change.clone()),
            }
        }
        if message.is_empty() {
            return;
        }
        if let Err(error) = self.send(message) {
            warn!(partner = %self.partner, error = %error, "Cannot forward committed changes");
        }
    }

    /// Makes this proxy unusable; waiting callers fail
    pub fn die(&self) {
        self.endpoint.die();
        let error = EndpointError::IsDead(self.endpoint.name().to_string());
        self.disabled(&error);
        self.subscription.lock().take();
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
        }
    }

    fn disabled(&self, error: &EndpointError) {
        self.replica_waiter.disabling_error(error);
        self.lock_waiter.disabling_error(error);
        self.home_waiter.disabling_error(error);
    }

    async fn persist(&self) {
        if self.is_dead() || self.is_ceasing() {
            return;
        }
        let Some(base) = self.base.upgrade() else {
            return;
        };
        let bytes = match self.as_externalized().to_bytes() {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(partner = %self.partner, error = %error, "Cannot encode proxy");
                return;
            }
        };
        if let Err(error) = base.store().put_or_update(&proxy_key(&self.partner), bytes).await {
            warn!(partner = %self.partner, error = %error, "Cannot persist proxy");
        }
    }

    // ========================================================================
    // Incoming messages
    // ========================================================================

    fn is_response_to_ongoing_query(&self, id: u64) -> bool {
        self.replica_waiter.is_call_waiting_for(id)
            || self.lock_waiter.is_call_waiting_for(id)
            || self.home_waiter.is_call_waiting_for(id)
    }

    fn route_response(&self, message: &XprisoMessage) -> bool {
        self.replica_waiter.message_received(message)
            || self.lock_waiter.message_received(message)
            || self.home_waiter.message_received(message)
    }

    async fn process_incoming(self: &Arc<Self>, incoming: XprisoMessage) {
        let Ok(base) = self.base() else {
            return;
        };
        debug!(
            request = ?incoming.request_id,
            response = ?incoming.response_id,
            empty = incoming.is_empty(),
            "Processing incoming message"
        );
        let mut outgoing = self.new_message();
        outgoing.response_id = incoming.request_id;
        let mut instructions = ProxyInstructions::new(outgoing, incoming.request_id.is_some());

        self.requested_first_time(&base, &incoming, &mut instructions).await;
        self.requested_resynchronize(&base, &incoming, &mut instructions);
        self.requested_home_replicas(&base, &incoming, &mut instructions).await;
        self.requested_locks(&base, &incoming, &mut instructions).await;
        self.reclaimed_locks(&base, &incoming, &mut instructions);
        self.canceled(&base, &incoming, &mut instructions);
        self.conveyed(&base, &incoming, &mut instructions);
        for id in &incoming.pushed_locks {
            if let Some(object) = base.find_mesh_object(id) {
                object.push_lock(&self.partner);
                instructions.flush.insert(id.clone());
            }
        }
        for id in &incoming.pushed_home_replicas {
            if let Some(object) = base.find_mesh_object(id) {
                object.push_home_replica(&self.partner);
                instructions.flush.insert(id.clone());
            }
        }
        instructions.changes = incoming.changes.clone();

        self.perform(&base, &incoming, instructions).await;
    }

    async fn requested_first_time(
        &self,
        base: &Arc<MeshBase>,
        incoming: &XprisoMessage,
        instructions: &mut ProxyInstructions,
    ) {
        if incoming.requested_first_time_objects.is_empty() {
            return;
        }
        if let Some(coherence) = &incoming.coherence {
            base.listeners().fire("coherence_requested", |l| {
                l.coherence_requested(&self.partner, coherence)
            });
        }
        let found = match base
            .access_locally_all(&incoming.requested_first_time_objects, Some(self.config.rpc_wait()))
            .await
        {
            Ok(found) => found,
            Err(MeshError::RemoteQueryTimeout { partial }) => {
                debug!(partner = %self.partner, "Conveying partial result of a timed out query");
                partial
            }
            Err(error) => {
                warn!(partner = %self.partner, error = %error, "Cannot access requested objects");
                return;
            }
        };
        for object in found.into_iter().flatten() {
            self.convey(&object, instructions);
        }
    }

    fn requested_resynchronize(
        &self,
        base: &Arc<MeshBase>,
        incoming: &XprisoMessage,
        instructions: &mut ProxyInstructions,
    ) {
        for id in &incoming.requested_resynchronize_replicas {
            match base.find_mesh_object(id) {
                Some(object) => self.convey(&object, instructions),
                None => debug!(object = %id, "Resynchronization requested for unknown object"),
            }
        }
    }

    /// Adds `object` to the outgoing message and replicates it towards the partner
    fn convey(&self, object: &Arc<MeshObject>, instructions: &mut ProxyInstructions) {
        let capture = !self.config.points_replicas_to_itself;
        if instructions.outgoing.convey(object.as_externalized(capture))
            && object.register_replication_towards(&self.partner)
        {
            instructions.flush.insert(object.identifier().clone());
        }
    }

    async fn requested_home_replicas(
        &self,
        base: &Arc<MeshBase>,
        incoming: &XprisoMessage,
        instructions: &mut ProxyInstructions,
    ) {
        let mut candidates = Vec::new();
        let mut forwards: BTreeMap<MeshBaseIdentifier, Vec<Arc<MeshObject>>> = BTreeMap::new();
        for id in &incoming.requested_home_replicas {
            let Some(object) = base.find_mesh_object(id) else {
                continue;
            };
            if !object.will_give_up_home_replica() {
                debug!(object = %id, "Refusing to give up home replica");
                continue;
            }
            if let Some(next) = object.proxy_towards_home() {
                if base.proxy_manager().is_in_flight(RequestKind::HomeReplica, id) {
                    debug!(object = %id, "Home replica request came back, not forwarding");
                } else if next != self.partner {
                    forwards.entry(next).or_default().push(object.clone());
                }
            }
            candidates.push(object);
        }
        for (next, objects) in forwards {
            self.forward(base, &next, |proxy, wait| async move {
                proxy.try_to_obtain_home_replicas(&objects, wait).await
            })
            .await;
        }
        for object in candidates {
            if object.is_home_replica() && object.surrender_home_replica(&self.partner, false) {
                instructions
                    .outgoing
                    .pushed_home_replicas
                    .push(object.identifier().clone());
                instructions.flush.insert(object.identifier().clone());
            }
        }
    }

    async fn requested_locks(
        &self,
        base: &Arc<MeshBase>,
        incoming: &XprisoMessage,
        instructions: &mut ProxyInstructions,
    ) {
        let mut candidates = Vec::new();
        let mut forwards: BTreeMap<MeshBaseIdentifier, Vec<Arc<MeshObject>>> = BTreeMap::new();
        for id in &incoming.requested_lock_objects {
            let Some(object) = base.find_mesh_object(id) else {
                continue;
            };
            if !object.will_give_up_lock() {
                debug!(object = %id, "Refusing to give up lock");
                continue;
            }
            if let Err(error) = base
                .access_manager()
                .check_permitted_lock_transfer(&object, &self.partner)
            {
                debug!(object = %id, error = %error, "Lock transfer not permitted");
                continue;
            }
            if let Some(next) = object.proxy_towards_lock() {
                if base.proxy_manager().is_in_flight(RequestKind::Lock, id) {
                    debug!(object = %id, "Lock request came back, not forwarding");
                } else if next != self.partner {
                    forwards.entry(next).or_default().push(object.clone());
                }
            }
            candidates.push(object);
        }
        for (next, objects) in forwards {
            self.forward(base, &next, |proxy, wait| async move {
                proxy.try_to_obtain_locks(&objects, wait).await
            })
            .await;
        }
        for object in candidates {
            if !object.has_lock() {
                continue;
            }
            if base.refuses_to_give_up_lock(object.identifier())
                && !base
                    .wait_for_lock_release(object.identifier(), self.config.rpc_wait())
                    .await
            {
                debug!(object = %object.identifier(), "Update in progress, lock request rejected");
                continue;
            }
            if object.surrender_lock(&self.partner, false) {
                instructions
                    .outgoing
                    .pushed_locks
                    .push(object.identifier().clone());
                instructions.flush.insert(object.identifier().clone());
            }
        }
    }

    /// Runs `op` on the proxy towards `next`, bounded by the RPC wait
    async fn forward<F, Fut>(&self, base: &MeshBase, next: &MeshBaseIdentifier, op: F)
    where
        F: FnOnce(Arc<Proxy>, Duration) -> Fut,
        Fut: std::future::Future<Output = MeshResult<()>>,
    {
        let proxy = match base.proxy_manager().obtain_for(next) {
            Ok(proxy) => proxy,
            Err(error) => {
                warn!(next = %next, error = %error, "Cannot forward request");
                return;
            }
        };
        if let Err(error) = op(proxy, self.config.rpc_wait()).await {
            warn!(next = %next, error = %error, "Forwarded request failed");
        }
    }

    fn reclaimed_locks(
        &self,
        base: &Arc<MeshBase>,
        incoming: &XprisoMessage,
        instructions: &mut ProxyInstructions,
    ) {
        let mut forwards: BTreeMap<MeshBaseIdentifier, Vec<Arc<MeshObject>>> = BTreeMap::new();
        for id in &incoming.reclaimed_lock_objects {
            let Some(object) = base.find_mesh_object(id) else {
                continue;
            };
            let previous = object.proxy_towards_lock();
            object.surrender_lock(&self.partner, true);
            instructions.flush.insert(id.clone());
            if let Some(previous) = previous {
                if previous != self.partner {
                    forwards.entry(previous).or_default().push(object);
                }
            }
        }
        for (previous, objects) in forwards {
            match base.proxy_manager().obtain_for(&previous) {
                Ok(proxy) => {
                    if let Err(error) = proxy.force_obtain_locks(&objects) {
                        warn!(next = %previous, error = %error, "Cannot forward reclaimed locks");
                    }
                }
                Err(error) => warn!(next = %previous, error = %error, "Cannot forward reclaimed locks"),
            }
        }
    }

    fn canceled(
        &self,
        base: &Arc<MeshBase>,
        incoming: &XprisoMessage,
        instructions: &mut ProxyInstructions,
    ) {
        for id in &incoming.requested_canceled_objects {
            if let Some(object) = base.find_mesh_object(id) {
                if object.unregister_replication_towards(&self.partner) {
                    instructions.flush.insert(id.clone());
                    instructions.canceled.push(id.clone());
                }
            }
        }
    }

    fn conveyed(
        &self,
        base: &Arc<MeshBase>,
        incoming: &XprisoMessage,
        instructions: &mut ProxyInstructions,
    ) {
        let is_response = incoming
            .response_id
            .is_some_and(|id| self.is_response_to_ongoing_query(id));
        for external in &incoming.conveyed_objects {
            let id = external.identifier.clone();
            let found = base.find_mesh_object(&id);
            let pointers = found.as_ref().map(|object| LocalPointers {
                home: object.proxy_towards_home(),
                lock: object.proxy_towards_lock(),
            });
            let action = decide_conveyed(
                base.identifier(),
                &self.partner,
                external,
                pointers.as_ref(),
                is_response,
            );
            debug!(object = %id, ?action, "Conveyed object");
            match (action, found) {
                (ConveyedAction::Create { resynchronize_towards }, _) => {
                    instructions.creates.push(external.clone());
                    if let Some(home) = resynchronize_towards {
                        instructions.add_resynchronize_towards(home, id);
                    }
                }
                (ConveyedAction::Resynchronize { resynchronize_towards }, Some(object)) => {
                    instructions.resynchronizations.push((object, external.clone()));
                    if let Some(home) = resynchronize_towards {
                        instructions.add_resynchronize_towards(home, id);
                    }
                }
                (ConveyedAction::ResynchronizeTowards(home), _) => {
                    instructions.add_resynchronize_towards(home, id);
                }
                (ConveyedAction::Tighten { cancel_towards }, Some(object)) => {
                    instructions.resynchronizations.push((object.clone(), external.clone()));
                    instructions.add_cancel_towards(cancel_towards, object);
                }
                (ConveyedAction::CancelOffered, _) => {
                    instructions.outgoing.requested_canceled_objects.push(id);
                }
                _ => {}
            }
        }
    }

    /// Carries out what processing an incoming message has collected
    async fn perform(
        self: &Arc<Self>,
        base: &Arc<MeshBase>,
        incoming: &XprisoMessage,
        mut instructions: ProxyInstructions,
    ) {
        if instructions.needs_transaction() {
            let tx = base.create_replication_transaction(self.partner.clone());
            for external in std::mem::take(&mut instructions.creates) {
                let id = external.identifier.clone();
                match base.lifecycle().ripple_create(&tx, external, &self.partner) {
                    Ok(_) => {
                        instructions.flush.insert(id);
                    }
                    Err(error) => warn!(object = %id, error = %error, "Cannot create replica"),
                }
            }
            for (object, external) in std::mem::take(&mut instructions.resynchronizations) {
                base.lifecycle()
                    .ripple_resynchronize(&tx, &object, &external, &self.partner);
                instructions.flush.insert(object.identifier().clone());
            }
            for change in instructions.take_sorted_changes() {
                self.apply_change(base, &tx, change);
            }
            if let Err(error) = tx.commit().await {
                warn!(partner = %self.partner, error = %error, "Committing replicated changes failed");
            }
        }

        for (partner, objects) in std::mem::take(&mut instructions.cancel_towards) {
            match base.proxy_manager().obtain_for(&partner) {
                Ok(proxy) => {
                    if let Err(error) = proxy.cancel_replicas(&objects) {
                        warn!(towards = %partner, error = %error, "Cannot cancel replication lease");
                    }
                }
                Err(error) => warn!(towards = %partner, error = %error, "Cannot cancel replication lease"),
            }
        }

        for (partner, objects) in std::mem::take(&mut instructions.resynchronize_towards) {
            match base.proxy_manager().obtain_for(&partner) {
                Ok(proxy) => {
                    let wait = self.config.rpc_wait();
                    tokio::spawn(
                        async move {
                            let _ = proxy.try_resynchronize_replicas(objects, wait).await;
                        }
                        .in_current_span(),
                    );
                }
                Err(error) => warn!(towards = %partner, error = %error, "Cannot resynchronize"),
            }
        }

        if instructions.should_send() {
            if let Err(error) = self.send(instructions.outgoing) {
                warn!(partner = %self.partner, error = %error, "Cannot send response");
            }
        }

        if incoming.response_id.is_some() && !self.route_response(incoming) {
            debug!(response = ?incoming.response_id, "Response to a call nobody waits for");
        }

        if !instructions.canceled.is_empty() {
            base.listeners().fire("replicas_canceled", |l| {
                l.replicas_canceled(&self.partner, &instructions.canceled)
            });
        }
        for id in instructions.flush {
            base.schedule_flush(id);
        }

        if incoming.cease_communications {
            info!(partner = %self.partner, "Partner ceased communications");
            let base = base.clone();
            let partner = self.partner.clone();
            tokio::spawn(async move {
                if let Err(error) = base.proxy_manager().remove(&partner).await {
                    warn!(%partner, error = %error, "Cannot remove ceased proxy");
                }
            });
        }
    }

    fn apply_change(&self, base: &MeshBase, tx: &Transaction, change: Change) {
        match change {
            Change::Deleted { object } | Change::ReplicaPurged { object } => {
                base.lifecycle().ripple_delete(tx, &object);
            }
            Change::Created { .. } | Change::ReplicaCreated { .. } => {}
            change => match base.find_mesh_object(change.affected_object()) {
                Some(object) => object.apply_and_record(tx, change),
                None => debug!(
                    object = %change.affected_object(),
                    change = change.as_str(),
                    "Change for an object without local replica"
                ),
            },
        }
    }
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("local", &self.local)
            .field("partner", &self.partner)
            .field("dead", &self.is_dead())
            .field("ceasing", &self.is_ceasing())
            .finish()
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            worker.abort();
        }
    }
}
