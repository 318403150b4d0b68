use crate::error::AppError;
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// How fired events reach queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Direct dispatch to the queues owned by this process.
    Local,
    /// Publish on a Redis channel; every node dispatches to its own queues.
    Redis,
}

impl FromStr for DeliveryMode {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(DeliveryMode::Local),
            "redis" | "bus" => Ok(DeliveryMode::Redis),
            other => Err(AppError::Config(format!(
                "PUSH_DELIVERY must be 'local' or 'redis', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub bus_channel: String,
    pub directory_prefix: String,
    pub directory_ttl_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            bus_channel: "push:events".to_string(),
            directory_prefix: "push:directory".to_string(),
            directory_ttl_secs: 60,
        }
    }
}

/// Tuning knobs for connections, heartbeats and sessions.
#[derive(Debug, Clone)]
pub struct PushConfig {
    pub heartbeat_ms: u64,
    pub min_heartbeat_ms: u64,
    pub session_keepalive_secs: u64,
    pub session_idle_secs: u64,
    pub event_ttl_secs: u64,
    pub connection_buffer: usize,
    pub session_pending_limit: usize,
    pub max_frame_bytes: usize,
    pub legacy_user_agents: Vec<String>,
    pub legacy_max_bytes: usize,
    pub legacy_collect_every: usize,
    pub padding_bytes: usize,
    pub sse_retry_ms: u64,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: 15_000,
            min_heartbeat_ms: 5_000,
            session_keepalive_secs: 60,
            session_idle_secs: 1_800,
            event_ttl_secs: 60,
            connection_buffer: 256,
            session_pending_limit: 1_000,
            max_frame_bytes: 1024 * 1024,
            legacy_user_agents: vec!["MSIE".to_string(), "Trident".to_string()],
            legacy_max_bytes: 1024 * 1024,
            legacy_collect_every: 32,
            padding_bytes: 2048,
            sse_retry_ms: 3_000,
        }
    }
}

impl PushConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn min_heartbeat(&self) -> Duration {
        Duration::from_millis(self.min_heartbeat_ms)
    }

    pub fn event_ttl(&self) -> Duration {
        Duration::from_secs(self.event_ttl_secs)
    }

    pub fn session_keepalive(&self) -> Duration {
        Duration::from_secs(self.session_keepalive_secs)
    }

    pub fn session_idle(&self) -> Duration {
        Duration::from_secs(self.session_idle_secs)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub node_id: String,
    pub delivery: DeliveryMode,
    /// `None` keeps the directory in memory and delivery process-local.
    pub redis: Option<RedisConfig>,
    pub push: PushConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            node_id: format!("node-{}", Uuid::new_v4()),
            delivery: DeliveryMode::Local,
            redis: None,
            push: PushConfig::default(),
        }
    }
}

fn parse_var<T: FromStr>(key: &str, default: T) -> Result<T, AppError> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| AppError::Config(format!("{key} has invalid value '{raw}'"))),
        _ => Ok(default),
    }
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();

        let port = parse_var("PORT", 8080u16)?;
        let node_id = env::var("NODE_ID")
            .or_else(|_| env::var("HOSTNAME"))
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| format!("node-{}", Uuid::new_v4()));

        let redis = match env::var("REDIS_URL") {
            Ok(url) if !url.trim().is_empty() => {
                let defaults = RedisConfig::default();
                Some(RedisConfig {
                    url,
                    bus_channel: env::var("PUSH_BUS_CHANNEL").unwrap_or(defaults.bus_channel),
                    directory_prefix: env::var("PUSH_DIRECTORY_PREFIX")
                        .unwrap_or(defaults.directory_prefix),
                    directory_ttl_secs: parse_var(
                        "PUSH_DIRECTORY_TTL_SECS",
                        defaults.directory_ttl_secs,
                    )?,
                })
            }
            _ => None,
        };

        let delivery = match env::var("PUSH_DELIVERY") {
            Ok(raw) => raw.parse()?,
            Err(_) if redis.is_some() => DeliveryMode::Redis,
            Err(_) => DeliveryMode::Local,
        };
        if delivery == DeliveryMode::Redis && redis.is_none() {
            return Err(AppError::Config(
                "PUSH_DELIVERY=redis requires REDIS_URL".into(),
            ));
        }

        let defaults = PushConfig::default();
        let push = PushConfig {
            heartbeat_ms: parse_var("PUSH_HEARTBEAT_MS", defaults.heartbeat_ms)?,
            min_heartbeat_ms: parse_var("PUSH_MIN_HEARTBEAT_MS", defaults.min_heartbeat_ms)?,
            session_keepalive_secs: parse_var(
                "PUSH_SESSION_KEEPALIVE_SECS",
                defaults.session_keepalive_secs,
            )?,
            session_idle_secs: parse_var("PUSH_SESSION_IDLE_SECS", defaults.session_idle_secs)?,
            event_ttl_secs: parse_var("PUSH_EVENT_TTL_SECS", defaults.event_ttl_secs)?,
            connection_buffer: parse_var("PUSH_CONNECTION_BUFFER", defaults.connection_buffer)?
                .max(8),
            session_pending_limit: parse_var(
                "PUSH_SESSION_PENDING_LIMIT",
                defaults.session_pending_limit,
            )?,
            max_frame_bytes: parse_var("PUSH_MAX_FRAME_BYTES", defaults.max_frame_bytes)?,
            legacy_user_agents: env::var("PUSH_LEGACY_USER_AGENTS")
                .map(|v| parse_list(&v))
                .unwrap_or(defaults.legacy_user_agents),
            legacy_max_bytes: parse_var("PUSH_LEGACY_MAX_BYTES", defaults.legacy_max_bytes)?,
            legacy_collect_every: parse_var(
                "PUSH_LEGACY_COLLECT_EVERY",
                defaults.legacy_collect_every,
            )?
            .max(1),
            padding_bytes: parse_var("PUSH_PADDING_BYTES", defaults.padding_bytes)?,
            sse_retry_ms: parse_var("PUSH_SSE_RETRY_MS", defaults.sse_retry_ms)?,
        };

        if push.min_heartbeat_ms == 0 || push.heartbeat_ms < push.min_heartbeat_ms {
            return Err(AppError::Config(format!(
                "PUSH_HEARTBEAT_MS ({}) must be >= PUSH_MIN_HEARTBEAT_MS ({}) and non-zero",
                push.heartbeat_ms, push.min_heartbeat_ms
            )));
        }

        Ok(Self {
            port,
            node_id,
            delivery,
            redis,
            push,
        })
    }
}
