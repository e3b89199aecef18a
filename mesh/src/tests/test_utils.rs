//! Shared helpers for the scenario tests

use std::{
    future::Future,
    sync::{Arc, Once},
    time::Duration,
};

use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::{
    config::{MeshBaseConfig, PingPongConfig, ProxyConfig},
    meshbase::MeshBase,
    nameserver::{MeshBaseNameServer, NameServerTransportFactory},
    store::Store,
};

static INIT: Once = Once::new();

/// Initialize test logging infrastructure
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .try_init();
    });
}

/// Short timers so that scenarios finish in well under a second
pub fn fast_config() -> MeshBaseConfig {
    MeshBaseConfig {
        access_locally_timeout_ms: 2000,
        obtain_lock_timeout_ms: 2000,
        proxy: ProxyConfig {
            rpc_wait_ms: 1000,
            cease_flush_ms: 500,
            endpoint: PingPongConfig {
                delta_respond_ms: 20,
                delta_resend_ms: 20,
                delta_recover_ms: 500,
                random_variation: 0.0,
            },
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Opens a mesh base reachable through `name_server`
pub async fn create_test_base(
    name_server: &Arc<MeshBaseNameServer>,
    name: &str,
    store: Option<Arc<dyn Store>>,
) -> Arc<MeshBase> {
    let mut builder = MeshBase::builder(name, NameServerTransportFactory::new(name_server.clone()))
        .config(fast_config());
    if let Some(store) = store {
        builder = builder.store(store);
    }
    let base = builder.build().await.unwrap();
    name_server.register(&base);
    base
}

/// Like `create_test_base`, with an in-memory store and the given config
pub async fn create_configured_base(
    name_server: &Arc<MeshBaseNameServer>,
    name: &str,
    config: MeshBaseConfig,
) -> Arc<MeshBase> {
    let base = MeshBase::builder(name, NameServerTransportFactory::new(name_server.clone()))
        .config(config)
        .build()
        .await
        .unwrap();
    name_server.register(&base);
    base
}

/// Polls `condition` until it holds or `timeout` passes
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
