use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

use murmur_gateway::GatewayConfig;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_DB_PATH: &str = "murmur.db";
const DEFAULT_EXPIRY_SWEEP_MS: u64 = 100;

/// Process configuration, read once from `MURMUR_*` variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    /// Active expiry period of the in-process fast store.
    pub expiry_sweep: Duration,
    pub gateway: GatewayConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source. Unparseable tunables fall back to
    /// their defaults; only an unusable listen address is fatal.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let host = lookup("MURMUR_HOST").unwrap_or_else(|| DEFAULT_HOST.into());
        let port: u16 = parse_or(&lookup, "MURMUR_PORT", DEFAULT_PORT);
        let addr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("parse MURMUR_HOST {:?}", host))?;

        let db_path = lookup("MURMUR_DB_PATH")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_DB_PATH.into())
            .into();

        let defaults = GatewayConfig::default();
        let secs = |name: &str, default: Duration| {
            Duration::from_secs(parse_or(&lookup, name, default.as_secs()).max(1))
        };
        let gateway = GatewayConfig {
            flush_interval: secs("MURMUR_FLUSH_INTERVAL_SECS", defaults.flush_interval),
            batch_size: parse_or(&lookup, "MURMUR_BATCH_SIZE", defaults.batch_size).max(1),
            flush_lock_ttl: secs("MURMUR_FLUSH_LOCK_SECS", defaults.flush_lock_ttl),
            presence_ttl: secs("MURMUR_PRESENCE_TTL_SECS", defaults.presence_ttl),
            heartbeat_interval: secs("MURMUR_HEARTBEAT_SECS", defaults.heartbeat_interval),
            participant_cache_ttl: secs("MURMUR_PARTICIPANT_CACHE_SECS", defaults.participant_cache_ttl),
            typing_ttl: defaults.typing_ttl,
        };
        if gateway.heartbeat_interval >= gateway.presence_ttl {
            warn!(
                "Heartbeat ({:?}) is not shorter than the presence TTL ({:?}); users will flap offline",
                gateway.heartbeat_interval, gateway.presence_ttl
            );
        }

        let expiry_sweep = Duration::from_millis(
            parse_or(&lookup, "MURMUR_EXPIRY_SWEEP_MS", DEFAULT_EXPIRY_SWEEP_MS).max(1),
        );

        Ok(Self {
            addr,
            db_path,
            expiry_sweep,
            gateway,
        })
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T
where
    T: FromStr + Copy,
{
    match lookup(name) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}={:?}", name, raw);
            default
        }),
    }
}
