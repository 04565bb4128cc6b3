use std::time::Duration;

/// Tunables shared by every gateway component.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Time trigger of the durable buffer.
    pub flush_interval: Duration,
    /// Size trigger of the durable buffer.
    pub batch_size: usize,
    pub flush_lock_ttl: Duration,
    pub presence_ttl: Duration,
    /// Presence refresh period; keep it below `presence_ttl`.
    pub heartbeat_interval: Duration,
    /// Process-local participant cache lifetime.
    pub participant_cache_ttl: Duration,
    pub typing_ttl: Duration,
}

impl GatewayConfig {
    /// Lifetime of the participant list shared through the fast store.
    pub fn participant_shared_ttl(&self) -> Duration {
        self.flush_interval * 10
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(2),
            batch_size: 100,
            flush_lock_ttl: Duration::from_secs(3),
            presence_ttl: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(25),
            participant_cache_ttl: Duration::from_secs(5 * 60),
            typing_ttl: Duration::from_secs(5),
        }
    }
}
