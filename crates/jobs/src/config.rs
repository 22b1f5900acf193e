use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use catapult_comfyui::reconnect::ReconnectConfig;

/// Orchestrator timing and diagnostics configuration.
///
/// Defaults match a ComfyUI instance on the local network. Override via
/// environment variables with [`from_env`](Self::from_env).
#[derive(Debug, Clone)]
pub struct CatapultConfig {
    /// Delay between reconciliation passes (default: 5 s).
    pub poll_interval: Duration,
    /// Lifetime of one event-stream connection before it is recycled
    /// (default: 20 s). ComfyUI only re-announces the executing prompt on
    /// a fresh connection.
    pub ws_connect_interval: Duration,
    /// Backoff for event-stream connect failures (1 s doubling to 30 s).
    pub reconnect: ReconnectConfig,
    /// Pause after an undecodable event-stream frame (default: 100 ms).
    pub decode_error_delay: Duration,
    /// How long `close` waits for each background task (default: 5 s).
    pub shutdown_timeout: Duration,
    /// Directory for `{job_id}.status.json` dumps of failed jobs. Jobs
    /// submitted without their own debug path use this one.
    pub debug_path: Option<PathBuf>,
}

impl Default for CatapultConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(5000),
            ws_connect_interval: Duration::from_secs(20),
            reconnect: ReconnectConfig::default(),
            decode_error_delay: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(5),
            debug_path: None,
        }
    }
}

impl CatapultConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                             | Default |
    /// |-------------------------------------|---------|
    /// | `CATAPULT_POLL_INTERVAL_MS`         | `5000`  |
    /// | `CATAPULT_WS_CONNECT_INTERVAL_SECS` | `20`    |
    /// | `CATAPULT_SHUTDOWN_TIMEOUT_SECS`    | `5`     |
    /// | `CATAPULT_DEBUG_PATH`               | unset   |
    ///
    /// Unparseable values are logged and replaced by the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`from_env`](Self::from_env), reading variables through
    /// `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let poll_interval = Duration::from_millis(parse_or(
            &lookup,
            "CATAPULT_POLL_INTERVAL_MS",
            defaults.poll_interval.as_millis() as u64,
        ));

        let ws_connect_interval = Duration::from_secs(parse_or(
            &lookup,
            "CATAPULT_WS_CONNECT_INTERVAL_SECS",
            defaults.ws_connect_interval.as_secs(),
        ));

        let shutdown_timeout = Duration::from_secs(parse_or(
            &lookup,
            "CATAPULT_SHUTDOWN_TIMEOUT_SECS",
            defaults.shutdown_timeout.as_secs(),
        ));

        let debug_path = lookup("CATAPULT_DEBUG_PATH")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .map(PathBuf::from);

        Self {
            poll_interval,
            ws_connect_interval,
            shutdown_timeout,
            debug_path,
            ..defaults
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    let Some(raw) = lookup(name) else {
        return default;
    };
    match raw.trim().parse() {
        Ok(value) => value,
        Err(_) => {
            tracing::warn!(var = name, value = %raw, default = %default, "Invalid config value, using default");
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let config = CatapultConfig::from_lookup(lookup(&[]));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.ws_connect_interval, Duration::from_secs(20));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
        assert_eq!(config.decode_error_delay, Duration::from_millis(100));
        assert!(config.debug_path.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = CatapultConfig::from_lookup(lookup(&[
            ("CATAPULT_POLL_INTERVAL_MS", "250"),
            ("CATAPULT_WS_CONNECT_INTERVAL_SECS", "60"),
            ("CATAPULT_SHUTDOWN_TIMEOUT_SECS", "1"),
            ("CATAPULT_DEBUG_PATH", "/tmp/catapult"),
        ]));
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.ws_connect_interval, Duration::from_secs(60));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
        assert_eq!(config.debug_path, Some(PathBuf::from("/tmp/catapult")));
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = CatapultConfig::from_lookup(lookup(&[
            ("CATAPULT_POLL_INTERVAL_MS", "soon"),
            ("CATAPULT_DEBUG_PATH", "  "),
        ]));
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert!(config.debug_path.is_none());
    }
}
