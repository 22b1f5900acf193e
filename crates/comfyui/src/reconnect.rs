//! Retrying event-stream connections with exponential backoff.
//!
//! The job tracker's stream consumer falls back to [`reconnect_loop`]
//! whenever opening a stream fails. The loop keeps trying, waiting longer
//! after each failure, until a stream opens or shutdown is requested.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::EventStream;
use crate::engine::EngineClient;

/// Backoff parameters for stream reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Wait before the first retry. Also the pause between two regular
    /// stream sessions.
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor applied after every failed attempt.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Delay schedule for one run of retries.
#[derive(Debug)]
pub struct Backoff<'a> {
    config: &'a ReconnectConfig,
    current: Duration,
    attempt: u32,
}

impl<'a> Backoff<'a> {
    pub fn new(config: &'a ReconnectConfig) -> Self {
        Self {
            config,
            current: config.initial_delay.min(config.max_delay),
            attempt: 0,
        }
    }

    /// Number of delays handed out so far.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// The delay to wait before the next attempt. Each call grows the
    /// following delay by `multiplier`, capped at `max_delay`.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.attempt += 1;
        self.current = grow(self.current, self.config.multiplier, self.config.max_delay);
        delay
    }
}

/// `current * multiplier`, capped at `max` before converting back so a
/// huge or non-finite factor cannot overflow `Duration`.
fn grow(current: Duration, multiplier: f64, max: Duration) -> Duration {
    let factor = if multiplier.is_finite() { multiplier.max(1.0) } else { 1.0 };
    let secs = current.as_secs_f64() * factor;
    if secs >= max.as_secs_f64() {
        return max;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(max)
}

/// Keep trying to open an event stream for `client_id`.
///
/// Sleeps before every attempt, starting with `initial_delay`. Returns
/// `None` once `cancel` fires, whether mid-sleep or mid-connect.
pub async fn reconnect_loop(
    engine: &dyn EngineClient,
    client_id: &str,
    config: &ReconnectConfig,
    cancel: &CancellationToken,
) -> Option<EventStream> {
    let mut backoff = Backoff::new(config);

    loop {
        let delay = backoff.next_delay();
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        let attempt = backoff.attempt();
        tracing::debug!(client_id = %client_id, attempt, "Retrying event stream");

        let opened = tokio::select! {
            _ = cancel.cancelled() => return None,
            opened = engine.open_event_stream(client_id) => opened,
        };
        match opened {
            Ok(stream) => {
                tracing::info!(client_id = %client_id, attempt, "Event stream reopened");
                return Some(stream);
            }
            Err(e) => tracing::warn!(
                client_id = %client_id,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                error = %e,
                "Event stream retry failed",
            ),
        }
    }
}
