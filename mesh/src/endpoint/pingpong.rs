//! Ping-pong message endpoint
//!
//! Two endpoints pass a token back and forth. A side only advances the token
//! after it has received the partner's answer to its previous one, so the
//! token doubles as acknowledgment:
//! - token numbers strictly increase and alternate between the two sides
//! - an unacknowledged token is resent unchanged, with its original payload
//! - a token that is not newer than the last one received is a duplicate and dropped
//!
//! Exactly one timer (start, respond, resend or recover) is pending at a time.
//! Timers are tokio tasks holding only a weak reference to the endpoint, and
//! each carries a generation so that a timer replaced in the meantime never acts.

use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use super::{
    listeners::{ListenerSet, Subscription},
    MessageEndpointListener, MessageTransport, SendError,
};
use crate::{
    config::PingPongConfig,
    error::{EndpointError, EndpointResult},
};

pub type Token = i64;

/// Token value meaning "nothing sent or received yet"
pub const NO_TOKEN: Token = -1;

/// Externalizable transport state of an endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingPongState<M> {
    pub last_sent_token: Token,
    pub last_received_token: Token,
    pub messages_sent_last: Vec<M>,
    pub messages_to_be_sent: Vec<M>,
}

impl<M> Default for PingPongState<M> {
    fn default() -> Self {
        Self {
            last_sent_token: NO_TOKEN,
            last_received_token: NO_TOKEN,
            messages_sent_last: Vec::new(),
            messages_to_be_sent: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    Start,
    Respond,
    Resend,
    Recover,
}

impl TimerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerKind::Start => "start",
            TimerKind::Respond => "respond",
            TimerKind::Resend => "resend",
            TimerKind::Recover => "recover",
        }
    }
}

struct ScheduledTimer {
    generation: u64,
    kind: TimerKind,
    handle: AbortHandle,
}

struct EndpointState<M> {
    tokens: PingPongState<M>,
    timer: Option<ScheduledTimer>,
    next_generation: u64,
    dead: bool,
}

impl<M> EndpointState<M> {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.handle.abort();
        }
    }
}

struct Inner<M> {
    name: String,
    config: PingPongConfig,
    transport: Arc<dyn MessageTransport<M>>,
    state: Mutex<EndpointState<M>>,
    listeners: ListenerSet<dyn MessageEndpointListener<M>>,
}

impl<M> Drop for Inner<M> {
    fn drop(&mut self) {
        self.state.get_mut().cancel_timer();
    }
}

pub struct PingPongEndpoint<M> {
    inner: Arc<Inner<M>>,
}

impl<M> Clone for PingPongEndpoint<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M> fmt::Debug for PingPongEndpoint<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PingPongEndpoint")
            .field("name", &self.inner.name)
            .finish()
    }
}

/// Non-owning handle to an endpoint
pub struct WeakPingPongEndpoint<M> {
    inner: Weak<Inner<M>>,
}

impl<M> Clone for WeakPingPongEndpoint<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M> WeakPingPongEndpoint<M> {
    pub fn upgrade(&self) -> Option<PingPongEndpoint<M>> {
        self.inner.upgrade().map(|inner| PingPongEndpoint { inner })
    }
}

impl<M: Clone + Send + Sync + 'static> PingPongEndpoint<M> {
    pub fn new(
        name: impl Into<String>,
        config: PingPongConfig,
        transport: Arc<dyn MessageTransport<M>>,
    ) -> Self {
        Self::restore(name, config, transport, PingPongState::default())
    }

    /// Resumes an endpoint from a previously taken snapshot
    pub fn restore(
        name: impl Into<String>,
        config: PingPongConfig,
        transport: Arc<dyn MessageTransport<M>>,
        tokens: PingPongState<M>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                config,
                transport,
                state: Mutex::new(EndpointState {
                    tokens,
                    timer: None,
                    next_generation: 0,
                    dead: false,
                }),
                listeners: ListenerSet::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &PingPongConfig {
        &self.inner.config
    }

    pub fn downgrade(&self) -> WeakPingPongEndpoint<M> {
        WeakPingPongEndpoint {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn MessageEndpointListener<M>>) -> Subscription {
        self.inner.listeners.subscribe(listener)
    }

    pub fn is_dead(&self) -> bool {
        self.inner.state.lock().dead
    }

    pub fn is_communicating(&self) -> bool {
        self.inner.state.lock().timer.is_some()
    }

    pub fn last_sent_token(&self) -> Token {
        self.inner.state.lock().tokens.last_sent_token
    }

    pub fn last_received_token(&self) -> Token {
        self.inner.state.lock().tokens.last_received_token
    }

    pub fn messages_sent_last(&self) -> Vec<M> {
        self.inner.state.lock().tokens.messages_sent_last.clone()
    }

    pub fn messages_to_be_sent(&self) -> Vec<M> {
        self.inner.state.lock().tokens.messages_to_be_sent.clone()
    }

    /// Kind of the currently pending timer, if any
    pub fn pending_timer(&self) -> Option<TimerKind> {
        self.inner.state.lock().timer.as_ref().map(|timer| timer.kind)
    }

    pub fn snapshot(&self) -> PingPongState<M> {
        self.inner.state.lock().tokens.clone()
    }

    /// Appends `message` to the queue sent with the next fresh token
    pub fn enqueue_message_for_send(&self, message: M) -> EndpointResult<()> {
        {
            let mut state = self.inner.state.lock();
            if state.dead {
                return Err(EndpointError::IsDead(self.inner.name.clone()));
            }
            state.tokens.messages_to_be_sent.push(message.clone());
        }
        self.inner
            .listeners
            .fire("message_enqueued", |l| l.message_enqueued(&message));
        Ok(())
    }

    /// Starts the cycle unless a timer is already pending
    pub fn start_communicating(&self) {
        let mut state = self.inner.state.lock();
        if state.dead || state.timer.is_some() {
            return;
        }
        self.schedule(&mut state, TimerKind::Start, Duration::ZERO);
    }

    /// Cancels the pending timer; incoming traffic resumes the cycle
    pub fn stop_communicating(&self) {
        self.inner.state.lock().cancel_timer();
    }

    /// Makes the endpoint permanently unusable
    pub fn die(&self) {
        let mut state = self.inner.state.lock();
        state.dead = true;
        state.cancel_timer();
        debug!(endpoint = %self.inner.name, "Endpoint died");
    }

    /// Delivers a token received from the partner
    pub fn incoming_message(&self, token: Token, content: Vec<M>) -> EndpointResult<()> {
        let fresh = {
            let mut state = self.inner.state.lock();
            if state.dead {
                return Err(EndpointError::IsDead(self.inner.name.clone()));
            }
            if token > state.tokens.last_received_token {
                state.cancel_timer();
                state.tokens.last_received_token = token;
                true
            } else {
                false
            }
        };

        if fresh {
            self.inner
                .listeners
                .fire("token_received", |l| l.token_received(token));
            for message in &content {
                self.inner
                    .listeners
                    .fire("message_received", |l| l.message_received(message));
            }
        } else {
            debug!(endpoint = %self.inner.name, token, "Ignoring duplicate token");
        }

        let mut state = self.inner.state.lock();
        if !state.dead {
            let delay = self.inner.config.delta_respond();
            self.schedule(&mut state, TimerKind::Respond, delay);
        }
        Ok(())
    }

    fn schedule(&self, state: &mut EndpointState<M>, kind: TimerKind, base: Duration) {
        state.cancel_timer();
        state.next_generation += 1;
        let generation = state.next_generation;
        let delay = randomize(base, self.inner.config.random_variation);
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                PingPongEndpoint { inner }.timer_fired(generation).await;
            }
        });
        state.timer = Some(ScheduledTimer {
            generation,
            kind,
            handle: handle.abort_handle(),
        });
    }

    async fn timer_fired(&self, generation: u64) {
        let kind = {
            let mut state = self.inner.state.lock();
            match &state.timer {
                Some(timer) if timer.generation == generation => {
                    let kind = timer.kind;
                    state.timer = None;
                    kind
                }
                _ => return,
            }
        };
        debug!(endpoint = %self.inner.name, timer = kind.as_str(), "Timer fired");
        self.do_action().await;
    }

    /// Computes the token to send, sends it and schedules the follow-up timer
    async fn do_action(&self) {
        let (token, content) = {
            let mut state = self.inner.state.lock();
            if state.dead {
                return;
            }
            let last_sent = state.tokens.last_sent_token;
            let last_received = state.tokens.last_received_token;

            let token = if last_received < 0 {
                // we have not heard from the partner: (re)send the first token
                1
            } else if last_sent < 0 || last_received == last_sent + 1 {
                last_received + 1
            } else if last_received + 1 == last_sent {
                last_sent
            } else {
                error!(
                    endpoint = %self.inner.name,
                    last_sent,
                    last_received,
                    "Unexpected token state, not sending"
                );
                return;
            };

            let content = if token == last_sent {
                state.tokens.messages_sent_last.clone()
            } else {
                std::mem::take(&mut state.tokens.messages_to_be_sent)
            };
            state.tokens.last_sent_token = token;
            state.tokens.messages_sent_last = content.clone();

            let recover = self.inner.config.delta_recover();
            self.schedule(&mut state, TimerKind::Recover, recover);
            (token, content)
        };

        match self.inner.transport.send_message(token, content.clone()).await {
            Ok(()) => {
                self.inner
                    .listeners
                    .fire("token_sent", |l| l.token_sent(token));
                for message in &content {
                    self.inner
                        .listeners
                        .fire("message_sent", |l| l.message_sent(message));
                }
            }
            Err(SendError::Dead(reason)) => {
                warn!(endpoint = %self.inner.name, token, %reason, "Partner is dead");
                {
                    let mut state = self.inner.state.lock();
                    state.dead = true;
                    state.cancel_timer();
                }
                let error = EndpointError::PartnerDead {
                    endpoint: self.inner.name.clone(),
                    reason,
                };
                self.inner
                    .listeners
                    .fire("disabling_error", |l| l.disabling_error(&error));
            }
            Err(SendError::Transient(reason)) => {
                debug!(endpoint = %self.inner.name, token, %reason, "Send failed, will resend");
                {
                    let mut state = self.inner.state.lock();
                    if !state.dead {
                        let resend = self.inner.config.delta_resend();
                        self.schedule(&mut state, TimerKind::Resend, resend);
                    }
                }
                for message in &content {
                    self.inner
                        .listeners
                        .fire("message_sending_failed", |l| l.message_sending_failed(message));
                }
            }
        }
    }
}

/// Perturbs `base` by up to half of `variation` in either direction
fn randomize(base: Duration, variation: f64) -> Duration {
    if base.is_zero() || variation <= 0.0 {
        return base;
    }
    let factor = (rand::random::<f64>() - 0.5) * variation + 1.0;
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    /// Records what is sent, failing transiently for the first `failures` attempts
    struct RecordingTransport {
        sent: Mutex<Vec<(Token, Vec<String>)>>,
        failures: AtomicUsize,
    }

    impl RecordingTransport {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                failures: AtomicUsize::new(failures),
            })
        }
    }

    #[async_trait]
    impl MessageTransport<String> for RecordingTransport {
        async fn send_message(&self, token: Token, content: Vec<String>) -> Result<(), SendError> {
            self.sent.lock().push((token, content));
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SendError::Transient("flaky".to_string()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Received(Mutex<Vec<String>>);

    impl MessageEndpointListener<String> for Received {
        fn message_received(&self, message: &String) {
            self.0.lock().push(message.clone());
        }
    }

    fn config() -> PingPongConfig {
        PingPongConfig {
            delta_respond_ms: 50,
            delta_resend_ms: 20,
            delta_recover_ms: 200,
            random_variation: 0.0,
        }
    }

    #[test]
    fn test_randomize_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..100 {
            let delay = randomize(base, 0.02);
            assert!(delay >= Duration::from_millis(990) && delay <= Duration::from_millis(1010));
        }
        assert_eq!(randomize(base, 0.0), base);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_send_uses_token_one() {
        let transport = RecordingTransport::new(0);
        let endpoint = PingPongEndpoint::new("a", config(), transport.clone());
        endpoint.enqueue_message_for_send("m1".to_string()).unwrap();
        endpoint.start_communicating();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(endpoint.last_sent_token(), 1);
        assert_eq!(transport.sent.lock()[0], (1, vec!["m1".to_string()]));
        assert!(endpoint.messages_to_be_sent().is_empty());
        assert_eq!(endpoint.pending_timer(), Some(TimerKind::Recover));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recover_resends_same_payload() {
        let transport = RecordingTransport::new(0);
        let endpoint = PingPongEndpoint::new("a", config(), transport.clone());
        endpoint.enqueue_message_for_send("m1".to_string()).unwrap();
        endpoint.start_communicating();
        tokio::time::sleep(Duration::from_millis(1)).await;

        // enqueued after the first send, must not leak into the resend
        endpoint.enqueue_message_for_send("m2".to_string()).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let sent = transport.sent.lock().clone();
        assert!(sent.len() >= 2);
        assert_eq!(sent[1], (1, vec!["m1".to_string()]));
        assert_eq!(endpoint.messages_to_be_sent(), vec!["m2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_schedules_resend() {
        let transport = RecordingTransport::new(2);
        let endpoint = PingPongEndpoint::new("a", config(), transport.clone());
        endpoint.enqueue_message_for_send("m1".to_string()).unwrap();
        endpoint.start_communicating();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(endpoint.pending_timer(), Some(TimerKind::Resend));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let sent = transport.sent.lock().clone();
        assert_eq!(sent.len(), 3);
        assert!(sent.iter().all(|(token, content)| *token == 1 && content == &["m1"]));
        assert_eq!(endpoint.pending_timer(), Some(TimerKind::Recover));
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_token_is_ignored() {
        let transport = RecordingTransport::new(0);
        let endpoint = PingPongEndpoint::new("b", config(), transport.clone());
        let received = Arc::new(Received::default());
        endpoint.add_listener(received.clone()).detach();

        endpoint.incoming_message(1, vec!["x".to_string()]).unwrap();
        endpoint.incoming_message(1, vec!["x".to_string()]).unwrap();
        endpoint.incoming_message(0, vec!["y".to_string()]).unwrap();

        assert_eq!(*received.0.lock(), vec!["x".to_string()]);
        assert_eq!(endpoint.last_received_token(), 1);
        assert_eq!(endpoint.pending_timer(), Some(TimerKind::Respond));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(transport.sent.lock()[0], (2, Vec::new()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_endpoint_rejects_traffic() {
        let transport = RecordingTransport::new(0);
        let endpoint = PingPongEndpoint::new("a", config(), transport.clone());
        endpoint.start_communicating();
        endpoint.die();

        assert!(matches!(
            endpoint.enqueue_message_for_send("m".to_string()),
            Err(EndpointError::IsDead(_))
        ));
        assert!(endpoint.incoming_message(1, Vec::new()).is_err());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_resumes_sequence() {
        let transport = RecordingTransport::new(0);
        let state = PingPongState {
            last_sent_token: 6,
            last_received_token: 7,
            messages_sent_last: vec!["old".to_string()],
            messages_to_be_sent: vec!["new".to_string()],
        };
        let endpoint = PingPongEndpoint::restore("a", config(), transport.clone(), state);
        endpoint.start_communicating();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(transport.sent.lock()[0], (8, vec!["new".to_string()]));
        assert_eq!(endpoint.snapshot().messages_sent_last, vec!["new".to_string()]);
    }
}
