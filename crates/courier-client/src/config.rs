// Client-side defaults and option handling.
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use courier_transport::TransportConfig;
use serde::Deserialize;
use thiserror::Error;

pub(crate) const DEFAULT_MAX_PAYLOAD_SIZE: usize = courier_wire::DEFAULT_MAX_PAYLOAD;
pub(crate) const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);
pub(crate) const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// How long the worker waits for the gateway's residual error frame while
/// closing a session. The peer sends it, if at all, right before closing,
/// so the bytes are already in flight by the time we look.
pub(crate) const RESIDUAL_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// Pacing delay before retrying a requeued frame after a failed connect.
/// Not a backoff policy; it only keeps the worker from spinning against a
/// dead endpoint.
pub(crate) const RECONNECT_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum OptionsError {
    #[error("read client options {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parse client options yaml: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Tunables for one [`Client`](crate::Client) instance.
#[derive(Clone)]
pub struct ClientOptions {
    /// Upper bound on payload byte length at enqueue time. Raising it past
    /// 256 is the explicit escape hatch for peers that accept more; the
    /// wire format caps it at 65 535 regardless.
    pub max_payload_size: usize,
    /// The worker closes the gateway session after this long without a new
    /// frame.
    pub idle_timeout: Duration,
    /// Bounded capacity of the dispatch queue.
    pub queue_capacity: usize,
    pub transport: TransportConfig,
    /// Produces the 32-bit identifier assigned at enqueue time. Identifiers
    /// correlate error responses with notifications; the default is a
    /// uniform-random draw, swap in a counter if collisions matter to you.
    pub identifier_supplier: Arc<dyn Fn() -> u32 + Send + Sync>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            transport: TransportConfig::default(),
            identifier_supplier: Arc::new(rand::random::<u32>),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
struct ClientOptionsOverride {
    max_payload_size: Option<usize>,
    idle_timeout_ms: Option<u64>,
    queue_capacity: Option<usize>,
    connect_timeout_ms: Option<u64>,
}

impl ClientOptions {
    /// Defaults, then `COURIER_*` environment overrides, then an optional
    /// YAML override file (explicit path or `COURIER_CLIENT_CONFIG`).
    pub fn from_env_or_yaml(config_path: Option<&str>) -> Result<Self, OptionsError> {
        let mut options = Self::from_env();
        let override_path = config_path
            .map(|value| value.to_string())
            .or_else(|| std::env::var("COURIER_CLIENT_CONFIG").ok());
        if let Some(path) = override_path {
            let contents = fs::read_to_string(&path).map_err(|source| OptionsError::Read {
                path: path.clone(),
                source,
            })?;
            let override_options: ClientOptionsOverride = serde_yaml::from_str(&contents)?;
            override_options.apply(&mut options);
        }
        Ok(options)
    }

    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(value) = read_usize_env("COURIER_MAX_PAYLOAD_SIZE") {
            options.max_payload_size = value;
        }
        if let Some(value) = read_u64_env("COURIER_IDLE_TIMEOUT_MS") {
            options.idle_timeout = Duration::from_millis(value);
        }
        if let Some(value) = read_usize_env("COURIER_QUEUE_CAPACITY") {
            options.queue_capacity = value;
        }
        if let Some(value) = read_u64_env("COURIER_CONNECT_TIMEOUT_MS") {
            options.transport.connect_timeout = Duration::from_millis(value);
        }
        options
    }
}

impl ClientOptionsOverride {
    fn apply(&self, options: &mut ClientOptions) {
        if let Some(value) = self.max_payload_size
            && value > 0
        {
            options.max_payload_size = value;
        }
        if let Some(value) = self.idle_timeout_ms
            && value > 0
        {
            options.idle_timeout = Duration::from_millis(value);
        }
        if let Some(value) = self.queue_capacity
            && value > 0
        {
            options.queue_capacity = value;
        }
        if let Some(value) = self.connect_timeout_ms
            && value > 0
        {
            options.transport.connect_timeout = Duration::from_millis(value);
        }
    }
}

fn read_u64_env(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
}

fn read_usize_env(key: &str) -> Option<usize> {
    std::env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .filter(|value| *value > 0)
}
