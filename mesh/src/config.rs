//! Configuration for endpoints, proxies, mesh bases and shadows
//!
//! All structs deserialize from JSON with per-field defaults, so a partial
//! document such as `{"proxy": {"rpc_wait_ms": 200}}` is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::identifier::CoherenceSpecification;

// ============================================================================
// Ping-Pong Endpoint
// ============================================================================

/// Timer configuration of a ping-pong message endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingPongConfig {
    /// Delay before answering an incoming token when nothing else triggers a send
    #[serde(default = "default_delta_respond_ms")]
    pub delta_respond_ms: u64,
    /// Delay before retrying after a transient send failure
    #[serde(default = "default_delta_resend_ms")]
    pub delta_resend_ms: u64,
    /// Delay after which an unacknowledged token is sent again
    #[serde(default = "default_delta_recover_ms")]
    pub delta_recover_ms: u64,
    /// Fraction by which every delay is randomly perturbed
    #[serde(default = "default_random_variation")]
    pub random_variation: f64,
}

fn default_delta_respond_ms() -> u64 {
    1000
}

fn default_delta_resend_ms() -> u64 {
    500
}

fn default_delta_recover_ms() -> u64 {
    5000
}

fn default_random_variation() -> f64 {
    0.02
}

impl Default for PingPongConfig {
    fn default() -> Self {
        Self {
            delta_respond_ms: default_delta_respond_ms(),
            delta_resend_ms: default_delta_resend_ms(),
            delta_recover_ms: default_delta_recover_ms(),
            random_variation: default_random_variation(),
        }
    }
}

impl PingPongConfig {
    pub fn delta_respond(&self) -> Duration {
        Duration::from_millis(self.delta_respond_ms)
    }

    pub fn delta_resend(&self) -> Duration {
        Duration::from_millis(self.delta_resend_ms)
    }

    pub fn delta_recover(&self) -> Duration {
        Duration::from_millis(self.delta_recover_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(0.0..1.0).contains(&self.random_variation) {
            return Err(format!(
                "random_variation must be in [0, 1), got {}",
                self.random_variation
            ));
        }
        if self.delta_recover_ms == 0 {
            return Err("delta_recover_ms must be greater than 0".to_string());
        }
        Ok(())
    }
}

// ============================================================================
// Proxy
// ============================================================================

/// Protocol configuration of a proxy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// How long waiting calls (lock, home, replica requests) wait for the partner
    #[serde(default = "default_rpc_wait_ms")]
    pub rpc_wait_ms: u64,
    /// Convey objects without our proxy pointers, making the partner point at us
    #[serde(default)]
    pub points_replicas_to_itself: bool,
    /// How long a ceasing partner waits for its acknowledgment to be sent
    #[serde(default = "default_cease_flush_ms")]
    pub cease_flush_ms: u64,
    #[serde(default)]
    pub endpoint: PingPongConfig,
}

fn default_rpc_wait_ms() -> u64 {
    5000
}

fn default_cease_flush_ms() -> u64 {
    5000
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            rpc_wait_ms: default_rpc_wait_ms(),
            points_replicas_to_itself: false,
            cease_flush_ms: default_cease_flush_ms(),
            endpoint: PingPongConfig::default(),
        }
    }
}

impl ProxyConfig {
    pub fn rpc_wait(&self) -> Duration {
        Duration::from_millis(self.rpc_wait_ms)
    }

    pub fn cease_flush(&self) -> Duration {
        Duration::from_millis(self.cease_flush_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.rpc_wait_ms == 0 {
            return Err("rpc_wait_ms must be greater than 0".to_string());
        }
        self.endpoint.validate()
    }
}

// ============================================================================
// Mesh Base
// ============================================================================

/// Granularity at which an update in progress refuses lock requests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockRefusalScope {
    /// Only objects touched by the running update refuse
    #[default]
    PerObject,
    /// Every object of the mesh base refuses while any update runs
    MeshBase,
}

impl LockRefusalScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LockRefusalScope::PerObject => "per_object",
            LockRefusalScope::MeshBase => "mesh_base",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshBaseConfig {
    #[serde(default = "default_access_locally_timeout_ms")]
    pub access_locally_timeout_ms: u64,
    #[serde(default = "default_obtain_lock_timeout_ms")]
    pub obtain_lock_timeout_ms: u64,
    #[serde(default = "default_true")]
    pub default_will_give_up_lock: bool,
    #[serde(default = "default_true")]
    pub default_will_give_up_home_replica: bool,
    #[serde(default)]
    pub lock_refusal_scope: LockRefusalScope,
    /// Interval of the unused-proxy sweep, 0 disables it
    #[serde(default)]
    pub proxy_sweep_interval_ms: u64,
    #[serde(default)]
    pub proxy: ProxyConfig,
}

fn default_access_locally_timeout_ms() -> u64 {
    5000
}

fn default_obtain_lock_timeout_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

impl Default for MeshBaseConfig {
    fn default() -> Self {
        Self {
            access_locally_timeout_ms: default_access_locally_timeout_ms(),
            obtain_lock_timeout_ms: default_obtain_lock_timeout_ms(),
            default_will_give_up_lock: true,
            default_will_give_up_home_replica: true,
            lock_refusal_scope: LockRefusalScope::default(),
            proxy_sweep_interval_ms: 0,
            proxy: ProxyConfig::default(),
        }
    }
}

impl MeshBaseConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn access_locally_timeout(&self) -> Duration {
        Duration::from_millis(self.access_locally_timeout_ms)
    }

    pub fn obtain_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.obtain_lock_timeout_ms)
    }

    pub fn proxy_sweep_interval(&self) -> Option<Duration> {
        (self.proxy_sweep_interval_ms > 0)
            .then(|| Duration::from_millis(self.proxy_sweep_interval_ms))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.access_locally_timeout_ms == 0 {
            return Err("access_locally_timeout_ms must be greater than 0".to_string());
        }
        self.proxy.validate()
    }
}

// ============================================================================
// Shadow Mesh Base
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShadowConfig {
    /// Grace period between becoming unneeded and being removed, negative means never
    #[serde(default = "default_time_not_needed_till_expires_ms")]
    pub time_not_needed_till_expires_ms: i64,
    /// Coherence used when a request does not carry one
    #[serde(default)]
    pub default_coherence: CoherenceSpecification,
    /// Lower bound for any scheduled re-run
    #[serde(default = "default_min_update_delay_ms")]
    pub min_update_delay_ms: u64,
    #[serde(default)]
    pub mesh_base: MeshBaseConfig,
}

fn default_time_not_needed_till_expires_ms() -> i64 {
    600_000
}

fn default_min_update_delay_ms() -> u64 {
    1000
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            time_not_needed_till_expires_ms: default_time_not_needed_till_expires_ms(),
            default_coherence: CoherenceSpecification::default(),
            min_update_delay_ms: default_min_update_delay_ms(),
            mesh_base: MeshBaseConfig::default(),
        }
    }
}

impl ShadowConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn min_update_delay(&self) -> Duration {
        Duration::from_millis(self.min_update_delay_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.default_coherence.validate()?;
        self.mesh_base.validate()
    }
}
