//! In-process transport
//!
//! Hands every token directly to the partner endpoint. The partner is held
//! weakly, so a dropped partner shows up as a dead endpoint.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{
    pingpong::{PingPongEndpoint, Token, WeakPingPongEndpoint},
    MessageTransport, SendError,
};
use crate::config::PingPongConfig;

pub struct MemoryTransport<M> {
    partner: RwLock<Option<WeakPingPongEndpoint<M>>>,
}

impl<M: Clone + Send + Sync + 'static> MemoryTransport<M> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            partner: RwLock::new(None),
        })
    }

    pub fn connect(&self, partner: &PingPongEndpoint<M>) {
        *self.partner.write() = Some(partner.downgrade());
    }
}

#[async_trait]
impl<M: Clone + Send + Sync + 'static> MessageTransport<M> for MemoryTransport<M> {
    async fn send_message(&self, token: Token, content: Vec<M>) -> Result<(), SendError> {
        let partner = match self.partner.read().as_ref() {
            None => return Err(SendError::Transient("not connected yet".to_string())),
            Some(partner) => partner.upgrade(),
        };
        match partner {
            Some(partner) => partner
                .incoming_message(token, content)
                .map_err(|e| SendError::Dead(e.to_string())),
            None => Err(SendError::Dead("partner endpoint is gone".to_string())),
        }
    }
}

/// Two endpoints connected to each other
pub fn pair<M: Clone + Send + Sync + 'static>(
    name_a: &str,
    name_b: &str,
    config: PingPongConfig,
) -> (PingPongEndpoint<M>, PingPongEndpoint<M>) {
    let transport_a = MemoryTransport::new();
    let transport_b = MemoryTransport::new();
    let a = PingPongEndpoint::new(name_a, config.clone(), transport_a.clone());
    let b = PingPongEndpoint::new(name_b, config, transport_b.clone());
    transport_a.connect(&b);
    transport_b.connect(&a);
    (a, b)
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use parking_lot::Mutex;

    use super::*;
    use crate::endpoint::MessageEndpointListener;

    /// Delivers, silently drops and fails send attempts in turn
    struct Lossy {
        inner: Arc<MemoryTransport<String>>,
        attempts: AtomicUsize,
    }

    impl Lossy {
        fn new(inner: Arc<MemoryTransport<String>>) -> Arc<Self> {
            Arc::new(Self {
                inner,
                attempts: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl MessageTransport<String> for Lossy {
        async fn send_message(&self, token: Token, content: Vec<String>) -> Result<(), SendError> {
            match self.attempts.fetch_add(1, Ordering::SeqCst) % 3 {
                0 => self.inner.send_message(token, content).await,
                1 => Ok(()),
                _ => Err(SendError::Transient("link down".to_string())),
            }
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
            delta_recover_ms: 500,
            random_variation: 0.02,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_delivered_in_order_with_one_token() {
        let (a, b) = pair::<String>("a", "b", config());
        let received = Arc::new(Received::default());
        b.add_listener(received.clone()).detach();

        a.enqueue_message_for_send("m1".to_string()).unwrap();
        a.enqueue_message_for_send("m2".to_string()).unwrap();
        a.start_communicating();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*received.0.lock(), vec!["m1".to_string(), "m2".to_string()]);
        assert_eq!(a.last_sent_token(), 1);
        assert_eq!(b.last_received_token(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_stay_monotonic() {
        let (a, b) = pair::<String>("a", "b", config());
        let received = Arc::new(Received::default());
        b.add_listener(received.clone()).detach();
        a.start_communicating();

        let mut previous = (a.last_sent_token(), a.last_received_token());
        for round in 0..20 {
            a.enqueue_message_for_send(format!("m{round}")).unwrap();
            tokio::time::sleep(Duration::from_millis(60)).await;
            let current = (a.last_sent_token(), a.last_received_token());
            assert!(current.0 >= previous.0 && current.1 >= previous.1);
            assert!((a.last_sent_token() - b.last_received_token()).abs() <= 1);
            previous = current;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(received.0.lock().len(), 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lossy_link_delivers_each_message_once_in_order() {
        let transport_a = MemoryTransport::new();
        let transport_b = MemoryTransport::new();
        let a = PingPongEndpoint::new("a", config(), Lossy::new(transport_a.clone()));
        let b = PingPongEndpoint::new("b", config(), Lossy::new(transport_b.clone()));
        transport_a.connect(&b);
        transport_b.connect(&a);
        let at_a = Arc::new(Received::default());
        let at_b = Arc::new(Received::default());
        a.add_listener(at_a.clone()).detach();
        b.add_listener(at_b.clone()).detach();
        a.start_communicating();

        for i in 0..30 {
            a.enqueue_message_for_send(format!("a{i}")).unwrap();
            b.enqueue_message_for_send(format!("b{i}")).unwrap();
            tokio::time::sleep(Duration::from_millis(35)).await;
        }
        tokio::time::sleep(Duration::from_secs(30)).await;

        let from_a: Vec<String> = (0..30).map(|i| format!("a{i}")).collect();
        let from_b: Vec<String> = (0..30).map(|i| format!("b{i}")).collect();
        assert_eq!(*at_b.0.lock(), from_a);
        assert_eq!(*at_a.0.lock(), from_b);
        assert!(!a.is_dead() && !b.is_dead());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_partner_is_dead() {
        let (a, b) = pair::<String>("a", "b", config());
        drop(b);
        a.enqueue_message_for_send("m1".to_string()).unwrap();
        a.start_communicating();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(a.is_dead());
    }
}
