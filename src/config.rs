//! Runtime configuration loaded from environment variables.
//!
//! Every knob has a default; unparsable values fall back to the default
//! rather than failing startup. `.env` is read by `main` before this runs.

use std::time::Duration;

use crate::services::presence::{DEFAULT_ACTIVITY_TIMEOUT, DEFAULT_CURSOR_DEBOUNCE, PresenceSettings};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
const DEFAULT_WS_OUTBOUND_CAPACITY: usize = 256;
const DEFAULT_STALE_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_STALE_CONNECTION_TIMEOUT_SECS: u64 = 90;
const DEFAULT_FLUSH_EVERY_OPS: u64 = 20;
const DEFAULT_FLUSH_INTERVAL_MS: u64 = 1000;

/// When the write-behind cache pushes working copies to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPolicy {
    /// After the Nth unflushed operation on a document.
    EveryOps(u64),
    /// From a background task on a fixed period.
    Interval(Duration),
    /// Only through `persist_document` / `flush_dirty`.
    OnDemand,
}

impl FlushPolicy {
    /// Whether a document with `unflushed` pending ops should be written now.
    #[must_use]
    pub fn due(&self, unflushed: u64) -> bool {
        match self {
            Self::EveryOps(n) => unflushed >= (*n).max(1),
            Self::Interval(_) | Self::OnDemand => false,
        }
    }

    /// Parse `every_ops`, `interval` or `on_demand` with their parameters.
    #[must_use]
    pub fn parse(kind: &str, every_ops: u64, interval_ms: u64) -> Option<Self> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "every_ops" => Some(Self::EveryOps(every_ops.max(1))),
            "interval" => Some(Self::Interval(Duration::from_millis(interval_ms.max(1)))),
            "on_demand" => Some(Self::OnDemand),
            _ => None,
        }
    }

    fn from_env() -> Self {
        let every_ops = env_parse("DOCUMENT_FLUSH_EVERY_OPS", DEFAULT_FLUSH_EVERY_OPS);
        let interval_ms = env_parse("DOCUMENT_FLUSH_INTERVAL_MS", DEFAULT_FLUSH_INTERVAL_MS);
        let Ok(kind) = std::env::var("DOCUMENT_FLUSH_POLICY") else {
            return Self::EveryOps(every_ops.max(1));
        };
        Self::parse(&kind, every_ops, interval_ms).unwrap_or_else(|| {
            tracing::warn!(value = %kind, "unknown DOCUMENT_FLUSH_POLICY; using every_ops");
            Self::EveryOps(every_ops.max(1))
        })
    }
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self::EveryOps(DEFAULT_FLUSH_EVERY_OPS)
    }
}

#[derive(Debug, Clone)]
pub struct CollabConfig {
    pub port: u16,
    /// Postgres URL. Unset means the in-memory store.
    pub database_url: Option<String>,
    pub heartbeat_interval: Duration,
    /// Bounded capacity of each connection's outbound channel.
    pub outbound_capacity: usize,
    pub stale_sweep_interval: Duration,
    pub stale_connection_timeout: Duration,
    pub presence: PresenceSettings,
    /// Periodic presence cleanup. `None` leaves it to the admin route.
    pub presence_cleanup_interval: Option<Duration>,
    pub flush_policy: FlushPolicy,
}

impl CollabConfig {
    #[must_use]
    pub fn from_env() -> Self {
        let presence = PresenceSettings {
            cursor_debounce: Duration::from_millis(env_parse(
                "CURSOR_DEBOUNCE_MS",
                u64::try_from(DEFAULT_CURSOR_DEBOUNCE.as_millis()).unwrap_or(100),
            )),
            activity_timeout: Duration::from_secs(env_parse("PRESENCE_TIMEOUT_SECS", DEFAULT_ACTIVITY_TIMEOUT.as_secs())),
        };
        let presence_cleanup_interval = std::env::var("PRESENCE_CLEANUP_INTERVAL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            heartbeat_interval: Duration::from_secs(env_parse("HEARTBEAT_INTERVAL_SECS", DEFAULT_HEARTBEAT_INTERVAL_SECS).max(1)),
            outbound_capacity: env_parse("WS_OUTBOUND_CAPACITY", DEFAULT_WS_OUTBOUND_CAPACITY).max(1),
            stale_sweep_interval: Duration::from_secs(
                env_parse("STALE_SWEEP_INTERVAL_SECS", DEFAULT_STALE_SWEEP_INTERVAL_SECS).max(1),
            ),
            stale_connection_timeout: Duration::from_secs(env_parse(
                "STALE_CONNECTION_TIMEOUT_SECS",
                DEFAULT_STALE_CONNECTION_TIMEOUT_SECS,
            )),
            presence,
            presence_cleanup_interval,
            flush_policy: FlushPolicy::from_env(),
        }
    }
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            database_url: None,
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_INTERVAL_SECS),
            outbound_capacity: DEFAULT_WS_OUTBOUND_CAPACITY,
            stale_sweep_interval: Duration::from_secs(DEFAULT_STALE_SWEEP_INTERVAL_SECS),
            stale_connection_timeout: Duration::from_secs(DEFAULT_STALE_CONNECTION_TIMEOUT_SECS),
            presence: PresenceSettings::default(),
            presence_cleanup_interval: None,
            flush_policy: FlushPolicy::default(),
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}
