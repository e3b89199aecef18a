//! Call/response correlation over a ping-pong endpoint
//!
//! - `ReturnSynchronizer`: a set of open queries plus their results; callers
//!   await completion of one query or of all of them
//! - `ReturnSynchronizerEndpoint`: stamps outgoing calls with fresh invocation
//!   ids and routes responses to the synchronizer that is waiting for them
//! - `PendingCall`: handle of one outstanding call; dropping it unregisters the id

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{sync::watch, time::Instant};
use tracing::debug;

use super::{
    listeners::Subscription, pingpong::PingPongEndpoint, MessageEndpointListener,
};
use crate::error::{CallError, EndpointError};

/// Messages that can carry a request id and the id of the request they answer
pub trait Correlated {
    fn request_id(&self) -> Option<u64>;

    fn set_request_id(&mut self, id: u64);

    fn response_id(&self) -> Option<u64>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Completed,
    TimedOut,
    Failed(EndpointError),
}

struct SyncState<M> {
    open: HashSet<u64>,
    results: HashMap<u64, M>,
    failures: HashMap<u64, EndpointError>,
}

pub struct ReturnSynchronizer<M> {
    state: Mutex<SyncState<M>>,
    changed: watch::Sender<u64>,
}

impl<M: Clone + Send + Sync + 'static> ReturnSynchronizer<M> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SyncState {
                open: HashSet::new(),
                results: HashMap::new(),
                failures: HashMap::new(),
            }),
            changed: watch::channel(0).0,
        }
    }

    pub fn add_open_query(&self, id: u64) {
        self.state.lock().open.insert(id);
    }

    /// Records the response for `id`; false if the query was not open
    pub fn query_has_completed(&self, id: u64, response: M) -> bool {
        let was_open = {
            let mut state = self.state.lock();
            let was_open = state.open.remove(&id);
            if was_open {
                state.results.insert(id, response);
            }
            was_open
        };
        if was_open {
            self.notify();
        }
        was_open
    }

    /// Marks `id` as failed by a transport error
    pub fn query_failed(&self, id: u64, error: EndpointError) {
        {
            let mut state = self.state.lock();
            if !state.open.remove(&id) {
                return;
            }
            state.failures.insert(id, error);
        }
        self.notify();
    }

    /// Stops waiting for `id` without a result
    pub fn abandon_query(&self, id: u64) {
        if self.state.lock().open.remove(&id) {
            self.notify();
        }
    }

    /// Fails every open query
    pub fn disabling_error(&self, error: &EndpointError) {
        {
            let mut state = self.state.lock();
            let open: Vec<u64> = state.open.drain().collect();
            for id in open {
                state.failures.insert(id, error.clone());
            }
        }
        self.notify();
    }

    pub fn is_query_open(&self, id: u64) -> bool {
        self.state.lock().open.contains(&id)
    }

    pub fn open_query_count(&self) -> usize {
        self.state.lock().open.len()
    }

    pub fn take_result(&self, id: u64) -> Option<M> {
        self.state.lock().results.remove(&id)
    }

    pub fn results(&self) -> Vec<M> {
        self.state.lock().results.values().cloned().collect()
    }

    pub fn failure(&self) -> Option<EndpointError> {
        self.state.lock().failures.values().next().cloned()
    }

    /// Waits until no query is open any more
    pub async fn join(&self, timeout: Duration) -> JoinOutcome {
        let completed = self.wait_until(timeout, |state| state.open.is_empty()).await;
        if !completed {
            return JoinOutcome::TimedOut;
        }
        match self.failure() {
            Some(error) => JoinOutcome::Failed(error),
            None => JoinOutcome::Completed,
        }
    }

    /// Waits until query `id` has completed or failed
    pub async fn join_query(&self, id: u64, timeout: Duration) -> JoinOutcome {
        let completed = self
            .wait_until(timeout, |state| !state.open.contains(&id))
            .await;
        if !completed {
            return JoinOutcome::TimedOut;
        }
        match self.state.lock().failures.get(&id) {
            Some(error) => JoinOutcome::Failed(error.clone()),
            None => JoinOutcome::Completed,
        }
    }

    async fn wait_until<F>(&self, timeout: Duration, done: F) -> bool
    where
        F: Fn(&SyncState<M>) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut changes = self.changed.subscribe();
        loop {
            if done(&*self.state.lock()) {
                return true;
            }
            match tokio::time::timeout_at(deadline, changes.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) | Err(_) => return done(&*self.state.lock()),
            }
        }
    }

    fn notify(&self) {
        self.changed.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

impl<M: Clone + Send + Sync + 'static> Default for ReturnSynchronizer<M> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Endpoint
// ============================================================================

type Correlations<M> = Mutex<HashMap<u64, Arc<ReturnSynchronizer<M>>>>;

/// Routes responses to the synchronizer registered for their response id
fn route_response<M: Correlated + Clone + Send + Sync + 'static>(
    correlations: &Correlations<M>,
    message: &M,
) -> bool {
    let Some(id) = message.response_id() else {
        return false;
    };
    let synchronizer = correlations.lock().remove(&id);
    match synchronizer {
        Some(synchronizer) => synchronizer.query_has_completed(id, message.clone()),
        None => {
            debug!(id, "Response for an unknown or abandoned call");
            false
        }
    }
}

fn fail_all<M: Clone + Send + Sync + 'static>(correlations: &Correlations<M>, error: &EndpointError) {
    let drained: Vec<_> = correlations.lock().drain().collect();
    for (id, synchronizer) in drained {
        synchronizer.query_failed(id, error.clone());
    }
}

pub struct ReturnSynchronizerEndpoint<M> {
    endpoint: PingPongEndpoint<M>,
    ids: Arc<AtomicU64>,
    correlations: Arc<Correlations<M>>,
    default_timeout: Duration,
}

impl<M: Correlated + Clone + Send + Sync + 'static> ReturnSynchronizerEndpoint<M> {
    pub fn new(endpoint: PingPongEndpoint<M>, default_timeout: Duration) -> Self {
        Self::with_id_source(endpoint, Arc::new(AtomicU64::new(0)), default_timeout)
    }

    /// Shares `ids` with other synchronizer endpoints over the same endpoint
    pub fn with_id_source(
        endpoint: PingPongEndpoint<M>,
        ids: Arc<AtomicU64>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            ids,
            correlations: Arc::new(Mutex::new(HashMap::new())),
            default_timeout,
        }
    }

    pub fn endpoint(&self) -> &PingPongEndpoint<M> {
        &self.endpoint
    }

    /// Stamps `message` with a fresh id, registers `synchronizer` for it and enqueues it
    pub fn call(
        &self,
        mut message: M,
        synchronizer: &Arc<ReturnSynchronizer<M>>,
    ) -> Result<PendingCall<M>, EndpointError> {
        let id = self.ids.fetch_add(1, Ordering::SeqCst) + 1;
        message.set_request_id(id);
        self.correlations.lock().insert(id, synchronizer.clone());
        synchronizer.add_open_query(id);
        let call = PendingCall {
            id,
            correlations: Arc::downgrade(&self.correlations),
            synchronizer: synchronizer.clone(),
        };
        self.endpoint.enqueue_message_for_send(message)?;
        self.endpoint.start_communicating();
        Ok(call)
    }

    pub async fn call_and_wait(&self, message: M, timeout: Option<Duration>) -> Result<M, CallError> {
        let synchronizer = Arc::new(ReturnSynchronizer::new());
        let call = self.call(message, &synchronizer)?;
        call.wait(timeout.unwrap_or(self.default_timeout)).await
    }

    /// Delivers `message` if it answers one of our calls
    pub fn message_received(&self, message: &M) -> bool {
        route_response(&self.correlations, message)
    }

    pub fn is_call_waiting_for(&self, id: u64) -> bool {
        self.correlations
            .lock()
            .get(&id)
            .is_some_and(|synchronizer| synchronizer.is_query_open(id))
    }

    pub fn pending_calls(&self) -> usize {
        self.correlations.lock().len()
    }

    pub fn disabling_error(&self, error: &EndpointError) {
        fail_all(&self.correlations, error);
    }

    /// Listens on the endpoint: responses go to their callers, everything else to `others`
    pub fn route_incoming(&self, others: Option<Arc<dyn MessageEndpointListener<M>>>) -> Subscription {
        self.endpoint.add_listener(Arc::new(RoutingListener {
            correlations: self.correlations.clone(),
            others,
        }))
    }
}

struct RoutingListener<M> {
    correlations: Arc<Correlations<M>>,
    others: Option<Arc<dyn MessageEndpointListener<M>>>,
}

impl<M: Correlated + Clone + Send + Sync + 'static> MessageEndpointListener<M> for RoutingListener<M> {
    fn message_received(&self, message: &M) {
        if !route_response(&self.correlations, message) {
            if let Some(others) = &self.others {
                others.message_received(message);
            }
        }
    }

    fn disabling_error(&self, error: &EndpointError) {
        fail_all(&self.correlations, error);
        if let Some(others) = &self.others {
            others.disabling_error(error);
        }
    }
}

/// One outstanding call
pub struct PendingCall<M: Clone + Send + Sync + 'static> {
    id: u64,
    correlations: Weak<Correlations<M>>,
    synchronizer: Arc<ReturnSynchronizer<M>>,
}

impl<M: Clone + Send + Sync + 'static> PendingCall<M> {
    pub fn invocation_id(&self) -> u64 {
        self.id
    }

    pub fn synchronizer(&self) -> &Arc<ReturnSynchronizer<M>> {
        &self.synchronizer
    }

    /// Waits for the response to this call only
    pub async fn wait(self, timeout: Duration) -> Result<M, CallError> {
        match self.synchronizer.join_query(self.id, timeout).await {
            JoinOutcome::Completed => self
                .synchronizer
                .take_result(self.id)
                .ok_or(CallError::Abandoned),
            JoinOutcome::TimedOut => Err(CallError::Timeout(timeout)),
            JoinOutcome::Failed(error) => Err(CallError::Endpoint(error)),
        }
    }
}

impl<M: Clone + Send + Sync + 'static> Drop for PendingCall<M> {
    fn drop(&mut self) {
        if let Some(correlations) = self.correlations.upgrade() {
            correlations.lock().remove(&self.id);
        }
        self.synchronizer.abandon_query(self.id);
    }
}
