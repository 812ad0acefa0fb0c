/// Rate limiting for the HTTP surface
/// Per-client (authenticated user or forwarded address) and global limits

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub per_client_per_second: u32,
    pub per_client_per_minute: u32,
    pub global_per_second: u32,
    pub burst_allowance: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            enabled: true,
            per_client_per_second: 10,
            per_client_per_minute: 300,
            global_per_second: 1000,
            burst_allowance: 20,
        }
    }
}

struct RateLimitEntry {
    second_count: u32,
    second_start: Instant,
    minute_count: u32,
    minute_start: Instant,
    last_request: Instant,
}

impl RateLimitEntry {
    fn new(now: Instant) -> Self {
        RateLimitEntry {
            second_count: 0,
            second_start: now,
            minute_count: 0,
            minute_start: now,
            last_request: now,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now.duration_since(self.second_start) >= Duration::from_secs(1) {
            self.second_count = 0;
            self.second_start = now;
        }
        if now.duration_since(self.minute_start) >= Duration::from_secs(60) {
            self.minute_count = 0;
            self.minute_start = now;
        }
    }

    fn increment(&mut self, now: Instant) {
        self.second_count += 1;
        self.minute_count += 1;
        self.last_request = now;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{scope} rate limit exceeded ({limit} per {window:?})")]
pub struct RateLimitError {
    pub scope: &'static str,
    pub limit: u32,
    pub window: Duration,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    clients: RwLock<HashMap<String, RateLimitEntry>>,
    global: RwLock<RateLimitEntry>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        RateLimiter {
            config,
            clients: RwLock::new(HashMap::new()),
            global: RwLock::new(RateLimitEntry::new(Instant::now())),
        }
    }

    /// Check and count one request from `client`
    pub fn check_rate_limit(&self, client: &str) -> Result<(), RateLimitError> {
        if !self.config.enabled {
            return Ok(());
        }
        let now = Instant::now();

        let mut global = self.global.write();
        global.roll(now);
        if global.second_count >= self.config.global_per_second {
            return Err(RateLimitError {
                scope: "global",
                limit: self.config.global_per_second,
                window: Duration::from_secs(1),
            });
        }

        let mut clients = self.clients.write();
        let entry = clients
            .entry(client.to_string())
            .or_insert_with(|| RateLimitEntry::new(now));
        entry.roll(now);

        let per_second = self.config.per_client_per_second + self.config.burst_allowance;
        if entry.second_count >= per_second {
            return Err(RateLimitError {
                scope: "client",
                limit: per_second,
                window: Duration::from_secs(1),
            });
        }
        if entry.minute_count >= self.config.per_client_per_minute {
            return Err(RateLimitError {
                scope: "client",
                limit: self.config.per_client_per_minute,
                window: Duration::from_secs(60),
            });
        }

        entry.increment(now);
        global.increment(now);
        Ok(())
    }

    /// Drop clients idle for more than an hour (call periodically)
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        self.clients
            .write()
            .retain(|_, entry| now.duration_since(entry.last_request) < Duration::from_secs(3600));
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_client_rate_limit() {
        let limiter = RateLimiter::new(RateLimitConfig {
            per_client_per_second: 5,
            burst_allowance: 0,
            ..Default::default()
        });

        for _ in 0..5 {
            assert!(limiter.check_rate_limit("10.0.0.1").is_ok());
        }
        let err = limiter.check_rate_limit("10.0.0.1").unwrap_err();
        assert_eq!(err.window, Duration::from_secs(1));

        // other clients are unaffected
        assert!(limiter.check_rate_limit("10.0.0.2").is_ok());

        thread::sleep(Duration::from_millis(1100));
        assert!(limiter.check_rate_limit("10.0.0.1").is_ok());
    }

    #[test]
    fn test_minute_limit() {
        let limiter = RateLimiter::new(RateLimitConfig {
            per_client_per_second: 100,
            per_client_per_minute: 3,
            ..Default::default()
        });
        for _ in 0..3 {
            assert!(limiter.check_rate_limit("token").is_ok());
        }
        assert_eq!(
            limiter.check_rate_limit("token").unwrap_err().window,
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_global_limit() {
        let limiter = RateLimiter::new(RateLimitConfig {
            global_per_second: 2,
            ..Default::default()
        });
        assert!(limiter.check_rate_limit("a").is_ok());
        assert!(limiter.check_rate_limit("b").is_ok());
        assert_eq!(limiter.check_rate_limit("c").unwrap_err().scope, "global");
    }

    #[test]
    fn test_disabled_limiter_allows_everything() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: false,
            global_per_second: 0,
            ..Default::default()
        });
        assert!(limiter.check_rate_limit("a").is_ok());
        assert_eq!(limiter.tracked_clients(), 0);
    }

    #[test]
    fn test_cleanup_expired() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        limiter.check_rate_limit("192.168.1.1").ok();
        limiter.check_rate_limit("192.168.1.2").ok();
        limiter.cleanup_expired();
        // entries are recent, nothing is dropped
        assert_eq!(limiter.tracked_clients(), 2);
    }
}
