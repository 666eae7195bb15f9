//! Environment-driven configuration.
//!
//! Values come from a `.env` file when present, otherwise the process
//! environment. Everything has a default so the server starts with no
//! configuration at all.

use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP listen address, e.g. "0.0.0.0:8080".
    pub listen_addr: String,
    /// Directory where context archives are stored.
    pub context_store_path: String,
    /// Rate limit: allowed requests per hour per project.
    pub rate_limit_per_hour: u32,
    /// Rate limit: burst capacity per project.
    pub rate_limit_burst: u32,
    /// Max concurrent RUNNING sessions per project.
    pub project_concurrency: usize,
    /// Command used to spawn the per-session sidecar process.
    /// The session's connect URL is appended as the final argument.
    pub sidecar_command: Vec<String>,
}

impl Config {
    /// Load configuration, falling back to defaults for anything unset.
    pub fn from_env() -> Self {
        Self {
            listen_addr: env_or("LISTEN_ADDR", "0.0.0.0:8080"),
            context_store_path: env_or("CONTEXT_STORE_PATH", "./storage/contexts"),
            rate_limit_per_hour: env_parse("RATE_LIMIT_PER_HOUR", 100),
            rate_limit_burst: env_parse("RATE_LIMIT_BURST", 10),
            project_concurrency: env_parse("PROJECT_CONCURRENCY", 10),
            sidecar_command: env::var("SIDECAR_COMMAND")
                .ok()
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .filter(|v: &Vec<String>| !v.is_empty())
                .unwrap_or_else(|| vec!["node".into(), "sidecar/sidecar.js".into()]),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::from_env();
        assert_eq!(cfg.rate_limit_per_hour, 100);
        assert_eq!(cfg.rate_limit_burst, 10);
        assert_eq!(cfg.project_concurrency, 10);
        assert_eq!(cfg.sidecar_command[0], "node");
    }
}
