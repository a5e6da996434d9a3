//! Configuration for the realtime stream client

use std::time::Duration;

use rand::Rng;
use realtime_core::{DispatchKey, StreamError, StreamResult};
use url::Url;

/// Server base used when nothing is configured
pub const DEFAULT_WS_URL: &str = "ws://localhost:8000";

/// Fixed sub-path of the realtime channel
pub const STREAM_PATH: &str = "/api/ws/ws";

/// Delay between reconnect attempts
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Ping interval while connected
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Capacity of the raw frame broadcast channel
const FRAME_CHANNEL_CAPACITY: usize = 1024;

/// Delay strategy between reconnect attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backoff {
    /// Same delay before every attempt
    Fixed(Duration),
    /// Doubling delay capped at `max`, optionally jittered
    Exponential {
        base: Duration,
        max: Duration,
        jitter: bool,
    },
}

impl Backoff {
    /// Delay before retry number `attempt` (1-based, reset after a successful connect)
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential { base, max, jitter } => {
                let exponent = attempt.saturating_sub(1).min(16);
                let capped = base.saturating_mul(1u32 << exponent).min(*max);

                if *jitter && !capped.is_zero() {
                    // Keep at least half the delay so retries never spin
                    let half = capped.as_millis() as u64 / 2;
                    let spread = rand::rng().random_range(0..=half);
                    Duration::from_millis(half + spread)
                } else {
                    capped
                }
            }
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Fixed(RECONNECT_DELAY)
    }
}

/// Configuration for StreamClient
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Full WebSocket URL of the realtime channel
    pub url: Url,
    pub backoff: Backoff,
    pub heartbeat_interval: Duration,
    /// Frame field handlers are keyed by
    pub dispatch_key: DispatchKey,
    /// Topics seeded into the subscription set at construction
    pub default_topics: Vec<String>,
    pub frame_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: resolve_url(DEFAULT_WS_URL).expect("default realtime URL is valid"),
            backoff: Backoff::default(),
            heartbeat_interval: HEARTBEAT_INTERVAL,
            dispatch_key: DispatchKey::default(),
            default_topics: Vec::new(),
            frame_capacity: FRAME_CHANNEL_CAPACITY,
        }
    }
}

impl StreamConfig {
    /// Default configuration pointed at another server
    pub fn with_url(url: &str) -> StreamResult<Self> {
        Ok(Self {
            url: resolve_url(url)?,
            ..Self::default()
        })
    }

    /// Load configuration from environment variables
    ///
    /// Reads:
    /// - REALTIME_WS_URL: server base or full channel URL
    /// - REALTIME_RECONNECT_DELAY_SECS: delay between reconnect attempts
    /// - REALTIME_RECONNECT_MAX_SECS: switches to capped exponential backoff
    /// - REALTIME_HEARTBEAT_SECS: ping interval
    /// - REALTIME_DISPATCH_KEY: `type` or `topic`
    /// - REALTIME_TOPICS: comma-separated topics subscribed at startup
    pub fn from_env() -> StreamResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`StreamConfig::from_env`] with a custom variable source
    pub fn from_lookup<F>(lookup: F) -> StreamResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(url) = lookup("REALTIME_WS_URL") {
            config.url = resolve_url(&url)?;
        }

        let delay = match lookup("REALTIME_RECONNECT_DELAY_SECS") {
            Some(raw) => Duration::from_secs(parse_secs("REALTIME_RECONNECT_DELAY_SECS", &raw)?),
            None => RECONNECT_DELAY,
        };

        config.backoff = match lookup("REALTIME_RECONNECT_MAX_SECS") {
            Some(raw) => {
                let max =
                    Duration::from_secs(parse_secs("REALTIME_RECONNECT_MAX_SECS", &raw)?);
                Backoff::Exponential {
                    base: delay,
                    max,
                    jitter: true,
                }
            }
            None => Backoff::Fixed(delay),
        };

        if let Some(raw) = lookup("REALTIME_HEARTBEAT_SECS") {
            config.heartbeat_interval =
                Duration::from_secs(parse_secs("REALTIME_HEARTBEAT_SECS", &raw)?);
        }

        if let Some(raw) = lookup("REALTIME_DISPATCH_KEY") {
            config.dispatch_key = raw.parse().map_err(StreamError::config)?;
        }

        if let Some(raw) = lookup("REALTIME_TOPICS") {
            config.default_topics = raw
                .split(',')
                .map(str::trim)
                .filter(|topic| !topic.is_empty())
                .map(String::from)
                .collect();
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the connection task cannot run with
    pub fn validate(&self) -> StreamResult<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(StreamError::config("heartbeat interval must be positive"));
        }

        match &self.backoff {
            Backoff::Fixed(delay) if delay.is_zero() => {
                Err(StreamError::config("reconnect delay must be positive"))
            }
            Backoff::Exponential { base, .. } if base.is_zero() => {
                Err(StreamError::config("reconnect delay must be positive"))
            }
            Backoff::Exponential { base, max, .. } if max < base => Err(StreamError::config(
                "reconnect delay cap must not be below the base delay",
            )),
            _ => Ok(()),
        }
    }
}

/// Turn a server base or full URL into the realtime channel URL
///
/// A URL without a path gets the fixed channel sub-path appended.
pub fn resolve_url(raw: &str) -> StreamResult<Url> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| StreamError::config(format!("Invalid realtime URL '{}': {}", raw, e)))?;

    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(StreamError::config(format!(
            "Realtime URL must use ws:// or wss://, got '{}'",
            raw
        )));
    }

    if url.path().is_empty() || url.path() == "/" {
        url.set_path(STREAM_PATH);
    }

    Ok(url)
}

fn parse_secs(name: &str, raw: &str) -> StreamResult<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|e| StreamError::config(format!("{} must be a whole number of seconds: {}", name, e)))
}
