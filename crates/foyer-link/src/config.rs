use std::env;
use std::time::Duration;

/// Client-side tuning. Every field has a sensible default; `from_env` lets
/// deployments override them without recompiling.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// STUN servers handed to the media layer.
    pub stun_servers: Vec<String>,
    /// Per-peer cap on signals held for a link that does not exist yet.
    pub pending_signal_cap: usize,
    /// Per-link cap on remote candidates held before the remote description.
    pub candidate_queue_cap: usize,
    /// Seconds between signaling heartbeats.
    pub heartbeat_interval: u64,
}

impl LinkConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            stun_servers: env::var("FOYER_STUN_SERVERS")
                .ok()
                .map(|raw| {
                    raw.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .filter(|servers: &Vec<String>| !servers.is_empty())
                .unwrap_or(defaults.stun_servers),
            pending_signal_cap: env::var("FOYER_PENDING_SIGNAL_CAP")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.pending_signal_cap),
            candidate_queue_cap: env::var("FOYER_CANDIDATE_QUEUE_CAP")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.candidate_queue_cap),
            heartbeat_interval: env::var("FOYER_HEARTBEAT_INTERVAL")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.heartbeat_interval),
        }
    }

    pub(crate) fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            pending_signal_cap: 64,
            candidate_queue_cap: 64,
            heartbeat_interval: 30,
        }
    }
}
