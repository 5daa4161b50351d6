use std::time::Duration;
use backoff::ExponentialBackoff;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AnnouncerConfig {
    /// Upper bound on waiting for the directory to confirm a withdraw
    #[serde(default = "default_withdraw_timeout")]
    pub withdraw_timeout_ms: u64,
    #[serde(default = "default_reannounce_backoff")]
    pub reannounce_backoff_ms: u64,
    #[serde(default = "default_reannounce_backoff_max")]
    pub reannounce_backoff_max_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrowserConfig {
    /// Resolution attempts per appearance before the peer is dropped
    #[serde(default = "default_resolve_attempts")]
    pub resolve_attempts: u32,
    #[serde(default = "default_resolve_backoff")]
    pub resolve_backoff_ms: u64,
    #[serde(default = "default_resolve_backoff_max")]
    pub resolve_backoff_max_ms: u64,
    #[serde(default = "default_resubscribe_delay")]
    pub resubscribe_delay_ms: u64,
    #[serde(default = "default_resubscribe_delay_max")]
    pub resubscribe_delay_max_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MdnsConfig {
    /// Restrict mDNS to one interface; all interfaces when unset
    #[serde(default)]
    pub interface: Option<String>,
    /// Address to publish; the interfaces' own addresses when unset
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_resolve_timeout")]
    pub resolve_timeout_ms: u64,
    /// How long to watch for a conflicting name after registering
    #[serde(default = "default_probe_window")]
    pub probe_window_ms: u64,
    #[serde(default = "default_health_interval")]
    pub health_interval_ms: u64,
}

fn default_withdraw_timeout() -> u64 {
    2000
}

fn default_reannounce_backoff() -> u64 {
    500
}

fn default_reannounce_backoff_max() -> u64 {
    30_000
}

fn default_resolve_attempts() -> u32 {
    3
}

fn default_resolve_backoff() -> u64 {
    250
}

fn default_resolve_backoff_max() -> u64 {
    2000
}

fn default_resubscribe_delay() -> u64 {
    1000
}

fn default_resubscribe_delay_max() -> u64 {
    30_000
}

fn default_resolve_timeout() -> u64 {
    3000
}

fn default_probe_window() -> u64 {
    1500
}

fn default_health_interval() -> u64 {
    5000
}

impl Default for AnnouncerConfig {
    fn default() -> Self {
        Self {
            withdraw_timeout_ms: default_withdraw_timeout(),
            reannounce_backoff_ms: default_reannounce_backoff(),
            reannounce_backoff_max_ms: default_reannounce_backoff_max(),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            resolve_attempts: default_resolve_attempts(),
            resolve_backoff_ms: default_resolve_backoff(),
            resolve_backoff_max_ms: default_resolve_backoff_max(),
            resubscribe_delay_ms: default_resubscribe_delay(),
            resubscribe_delay_max_ms: default_resubscribe_delay_max(),
        }
    }
}

impl Default for MdnsConfig {
    fn default() -> Self {
        Self {
            interface: None,
            address: None,
            resolve_timeout_ms: default_resolve_timeout(),
            probe_window_ms: default_probe_window(),
            health_interval_ms: default_health_interval(),
        }
    }
}

impl AnnouncerConfig {
    pub fn withdraw_timeout(&self) -> Duration {
        Duration::from_millis(self.withdraw_timeout_ms)
    }

    pub fn reannounce_backoff(&self) -> ExponentialBackoff {
        exponential(self.reannounce_backoff_ms, self.reannounce_backoff_max_ms)
    }
}

impl BrowserConfig {
    pub fn resolve_backoff(&self) -> ExponentialBackoff {
        exponential(self.resolve_backoff_ms, self.resolve_backoff_max_ms)
    }

    pub fn resubscribe_backoff(&self) -> ExponentialBackoff {
        exponential(self.resubscribe_delay_ms, self.resubscribe_delay_max_ms)
    }
}

impl MdnsConfig {
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    pub fn probe_window(&self) -> Duration {
        Duration::from_millis(self.probe_window_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }
}

/// Jittered doubling with no elapsed-time limit; callers that need a bound
/// count attempts themselves.
fn exponential(initial_ms: u64, max_ms: u64) -> ExponentialBackoff {
    let initial = Duration::from_millis(initial_ms);
    ExponentialBackoff {
        current_interval: initial,
        initial_interval: initial,
        max_interval: Duration::from_millis(max_ms.max(initial_ms)),
        multiplier: 2.0,
        max_elapsed_time: None,
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backoff::backoff::Backoff;

    #[test]
    fn test_backoff_grows_until_cap() {
        let config = AnnouncerConfig {
            reannounce_backoff_ms: 100,
            reannounce_backoff_max_ms: 350,
            ..AnnouncerConfig::default()
        };
        let mut backoff = config.reannounce_backoff();

        let first = backoff.next_backoff().unwrap();
        assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(150));

        for _ in 0..50 {
            let delay = backoff.next_backoff().expect("backoff must not give up");
            // jitter is applied on top of the capped interval
            assert!(delay <= Duration::from_millis(525));
        }
        assert_eq!(backoff.current_interval, Duration::from_millis(350));
    }

    #[test]
    fn test_backoff_reset_returns_to_initial() {
        let config = BrowserConfig {
            resubscribe_delay_ms: 10,
            resubscribe_delay_max_ms: 1000,
            ..BrowserConfig::default()
        };
        let mut backoff = config.resubscribe_backoff();
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.reset();

        assert_eq!(backoff.current_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_max_below_initial_is_raised() {
        let config = BrowserConfig {
            resolve_backoff_ms: 500,
            resolve_backoff_max_ms: 100,
            ..BrowserConfig::default()
        };
        let backoff = config.resolve_backoff();

        assert_eq!(backoff.max_interval, Duration::from_millis(500));
    }
}
