//! Configuration for both sides.
//!
//! Durations follow the convention from [`crate::net`]: a zero duration
//! disables that timeout.

use std::time::Duration;

/// At-most-once vs at-least-once delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    /// One attempt; any failure propagates.
    NoRetry,
    /// Timed-out attempts are resent until the retry budget runs out.
    /// Only timeouts re-enter the loop.
    Retry,
}

/// Client-side call settings.
#[derive(Clone, Debug)]
pub struct RpcConfig {
    /// Per-attempt response timeout.
    pub timeout: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
    pub retry_policy: RetryPolicy,
    /// Retry rounds after the first attempt; -1 means unbounded.
    pub max_retries: i32,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            retry_policy: RetryPolicy::Retry,
            max_retries: 10,
        }
    }
}

impl RpcConfig {
    #[inline]
    pub fn no_retry(&self) -> bool {
        self.retry_policy == RetryPolicy::NoRetry
    }

    /// Whether retry round `i` (1-based) may run.
    #[inline]
    pub fn need_retry(&self, i: i32) -> bool {
        if self.no_retry() {
            return false;
        }
        self.max_retries == -1 || i <= self.max_retries
    }
}

/// General config for the server side.
#[derive(Clone)]
pub struct ServerConfig {
    /// socket read timeout once a request frame has started arriving
    pub read_timeout: Duration,
    /// socket write timeout
    pub write_timeout: Duration,
    /// idle connections are dropped after this long without a request
    pub idle_timeout: Duration,
    /// wait for live connections to drain on close(), with a timeout
    pub server_close_wait: Duration,
    /// pipelined mode: requests dispatched concurrently per connection
    pub max_inflight: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            server_close_wait: Duration::from_secs(5),
            max_inflight: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_need_retry_bounds() {
        let config = RpcConfig::default();
        assert!(!config.no_retry());
        assert!(config.need_retry(1));
        assert!(config.need_retry(10));
        assert!(!config.need_retry(11));
    }

    #[test]
    fn test_need_retry_unbounded() {
        let config = RpcConfig { max_retries: -1, ..Default::default() };
        assert!(config.need_retry(1));
        assert!(config.need_retry(1_000_000));
    }

    #[test]
    fn test_no_retry() {
        let config = RpcConfig { retry_policy: RetryPolicy::NoRetry, ..Default::default() };
        assert!(config.no_retry());
        assert!(!config.need_retry(1));
    }
}
