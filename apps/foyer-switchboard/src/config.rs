use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Seconds between idle-connection sweeps.
    pub heartbeat_interval: u64,
    /// Seconds of silence after which a connection is dropped.
    pub heartbeat_timeout: u64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("FOYER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            heartbeat_interval: env::var("FOYER_HEARTBEAT_INTERVAL")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(60),
            heartbeat_timeout: env::var("FOYER_HEARTBEAT_TIMEOUT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(600),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            heartbeat_interval: 60,
            heartbeat_timeout: 600,
        }
    }
}
