//! Message endpoints
//!
//! - `pingpong`: token-based reliable delivery with respond, resend and recover timers
//! - `rpc`: call/response correlation on top of a ping-pong endpoint
//! - `memory`: transport that hands tokens straight to an in-process partner
//! - `listeners`: listener registry with subscription handles

pub mod listeners;
pub mod memory;
pub mod pingpong;
pub mod rpc;

use async_trait::async_trait;
pub use listeners::{ListenerSet, Subscription};
use thiserror::Error;

use crate::error::EndpointError;

/// Why a single send attempt failed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    /// The partner can never be reached again
    #[error("partner is dead: {0}")]
    Dead(String),
    /// This attempt failed, a later one may succeed
    #[error("transient send failure: {0}")]
    Transient(String),
}

/// Carries one token and its payload to the partner endpoint
#[async_trait]
pub trait MessageTransport<M>: Send + Sync {
    async fn send_message(&self, token: i64, content: Vec<M>) -> Result<(), SendError>;
}

/// Receives endpoint events, every method defaults to doing nothing
pub trait MessageEndpointListener<M>: Send + Sync {
    fn message_received(&self, _message: &M) {}

    fn message_sent(&self, _message: &M) {}

    fn message_enqueued(&self, _message: &M) {}

    fn message_sending_failed(&self, _message: &M) {}

    fn token_sent(&self, _token: i64) {}

    fn token_received(&self, _token: i64) {}

    fn disabling_error(&self, _error: &EndpointError) {}
}
