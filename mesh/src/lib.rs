//! Replicated Mesh Object Store
//!
//! This crate provides a distributed graph-object store in which every mesh object
//! may be replicated across several mesh bases:
//! - Ping-pong message endpoints with respond/resend/recover timers
//! - Call/response correlation on top of those endpoints
//! - Proxies executing the replication, lock and home-replica protocol
//! - Mesh bases with transactions, persistence and multi-hop access
//! - Shadow mesh bases mirroring external data sources through probes

pub mod access;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod identifier;
pub mod lifecycle;
pub mod meshbase;
pub mod model;
pub mod nameserver;
pub mod object;
pub mod proxy;
pub mod shadow;
pub mod store;
pub mod transaction;
pub mod xpriso;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use access::{AccessManager, PermitAll};
pub use config::{
    LockRefusalScope, MeshBaseConfig, PingPongConfig, ProxyConfig, ShadowConfig,
};
pub use endpoint::{
    memory::MemoryTransport,
    pingpong::{PingPongEndpoint, PingPongState, Token},
    rpc::{Correlated, JoinOutcome, PendingCall, ReturnSynchronizer, ReturnSynchronizerEndpoint},
    MessageEndpointListener, MessageTransport, SendError, Subscription,
};
pub use error::{CallError, EndpointError, MeshError, MeshResult, StoreError};
pub use identifier::{
    CoherenceSpecification, MeshBaseAccessSpecification, MeshBaseIdentifier,
    MeshObjectAccessSpecification, MeshObjectIdentifier,
};
pub use lifecycle::LifecycleManager;
pub use meshbase::{MeshBase, MeshBaseBuilder, MeshBaseListener, UpdateGuard};
pub use model::{EntityType, EntityTypeId, PropertyTypeId, PropertyValue, RoleTypeId, TypeRegistry};
pub use nameserver::{MeshBaseFactory, MeshBaseNameServer, NameServerTransportFactory};
pub use object::{externalized::ExternalizedMeshObject, MeshObject};
pub use proxy::{manager::ProxyManager, Proxy, ProxyListener, TransportFactory};
pub use shadow::{
    dispatcher::ProbeDispatcher,
    factory::{ShadowFactoryListener, ShadowMeshBaseFactory},
    probe::{
        ApiProbe, Document, DocumentFetcher, DocumentProbe, ProbeDirectory, ProbeError, ProbeObject,
        ProbeOutput, ProbeRelationship,
    },
    ShadowListener, ShadowMeshBase,
};
pub use store::{MemoryStore, NoopStore, Store};
pub use transaction::{Change, ChangeEvent, ChangeSet, Transaction};
pub use xpriso::XprisoMessage;

/// Current wall-clock time in milliseconds since the epoch
pub(crate) fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
