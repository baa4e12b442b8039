//! Event bus configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

/// Event bus delivery, persistence, and retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EventBusConfig {
    /// Total delivery attempts per handler (first try included).
    #[serde(default = "default_retry_attempts")]
    #[validate(range(min = 1, max = 10))]
    pub retry_attempts: u32,
    /// Base delay between attempts; attempt `n` waits `n × delay`.
    #[serde(default = "default_retry_delay_ms")]
    #[validate(range(max = 60_000))]
    pub retry_delay_ms: u64,
    /// Interval of the safety-net timer that resumes an idle, non-empty queue.
    #[serde(default = "default_drain_interval_ms")]
    #[validate(range(min = 10))]
    pub drain_interval_ms: u64,
    /// Whether published events are appended to the event log.
    #[serde(default = "default_true")]
    pub persist: bool,
    /// Path of the append-only JSON-lines event log.
    #[serde(default = "default_log_path")]
    pub log_path: String,
    /// Capacity of the immediate-listener broadcast channel.
    #[serde(default = "default_listener_capacity")]
    #[validate(range(min = 1))]
    pub listener_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            drain_interval_ms: default_drain_interval_ms(),
            persist: default_true(),
            log_path: default_log_path(),
            listener_capacity: default_listener_capacity(),
        }
    }
}

impl EventBusConfig {
    /// Base retry delay as a `Duration`.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Safety-net drain interval as a `Duration`.
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_drain_interval_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_log_path() -> String {
    "./data/events.jsonl".to_string()
}

fn default_listener_capacity() -> usize {
    256
}
