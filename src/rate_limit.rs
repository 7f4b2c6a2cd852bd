//! Fixed-window request limiting.
//!
//! Windows are one minute wide and keyed by `scope:key`, where the key is
//! the verified client address when one is known and the peer IP otherwise.
//! Exceeding any window yields 429 with the seconds remaining in the
//! window. This is the only backpressure the relay applies; there is no
//! queueing layer.

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::ApiError;

pub const GENERAL_PER_MINUTE: u32 = 100;
pub const ESTIMATE_PER_MINUTE: u32 = 200;
pub const RELAY_PER_MINUTE: u32 = 30;

const WINDOW_SECS: u64 = 60;

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    window: u64,
    count: u32,
}

#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: DashMap<String, WindowEntry>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one request against `scope:key`. On rejection returns the
    /// seconds until the current window rolls over.
    pub fn check(&self, scope: &str, key: &str, limit: u32) -> Result<(), u64> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.check_at(scope, key, limit, now)
    }

    fn check_at(&self, scope: &str, key: &str, limit: u32, now: u64) -> Result<(), u64> {
        let window = now / WINDOW_SECS;
        let mut entry = self
            .windows
            .entry(format!("{scope}:{key}"))
            .or_insert(WindowEntry { window, count: 0 });
        if entry.window != window {
            entry.window = window;
            entry.count = 0;
        }
        if entry.count >= limit {
            return Err(WINDOW_SECS - (now % WINDOW_SECS));
        }
        entry.count += 1;
        Ok(())
    }
}

/// Per-route window parameters, derived from the request path.
fn route_scope(path: &str) -> (&'static str, u32) {
    if path.starts_with("/estimate") {
        ("estimate", ESTIMATE_PER_MINUTE)
    } else if path.starts_with("/meta/relay") || path.starts_with("/meta/batch") {
        ("relay", RELAY_PER_MINUTE)
    } else {
        ("general", GENERAL_PER_MINUTE)
    }
}

/// Axum middleware applying the per-route window keyed by peer IP. Relay
/// handlers apply the relay window a second time keyed by the verified
/// agent address.
pub async fn middleware(
    State(limiter): State<Arc<RateLimiter>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let (scope, limit) = route_scope(request.uri().path());
    match limiter.check(scope, &peer.ip().to_string(), limit) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => ApiError::RateLimited { retry_after }.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_limit_then_rejects() {
        let limiter = RateLimiter::new();
        for _ in 0..30 {
            assert!(limiter.check_at("relay", "1.2.3.4", 30, 1000).is_ok());
        }
        let retry_after = limiter.check_at("relay", "1.2.3.4", 30, 1000).unwrap_err();
        assert_eq!(retry_after, 60 - (1000 % 60));
    }

    #[test]
    fn window_rollover_resets_the_count() {
        let limiter = RateLimiter::new();
        for _ in 0..5 {
            limiter.check_at("general", "k", 5, 100).unwrap();
        }
        assert!(limiter.check_at("general", "k", 5, 100).is_err());
        // 61 seconds later is the next window.
        assert!(limiter.check_at("general", "k", 5, 161).is_ok());
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new();
        limiter.check_at("relay", "a", 1, 0).unwrap();
        assert!(limiter.check_at("relay", "a", 1, 0).is_err());
        assert!(limiter.check_at("relay", "b", 1, 0).is_ok());
    }

    #[test]
    fn scopes_are_independent() {
        let limiter = RateLimiter::new();
        limiter.check_at("relay", "a", 1, 0).unwrap();
        assert!(limiter.check_at("estimate", "a", 1, 0).is_ok());
    }

    #[test]
    fn route_scopes_use_per_endpoint_limits() {
        assert_eq!(route_scope("/estimate"), ("estimate", 200));
        assert_eq!(route_scope("/meta/relay"), ("relay", 30));
        assert_eq!(route_scope("/meta/batch"), ("relay", 30));
        assert_eq!(route_scope("/health"), ("general", 100));
        assert_eq!(route_scope("/meta/nonce/0xabc"), ("general", 100));
    }
}
