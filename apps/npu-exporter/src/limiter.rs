// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! Request admission: per-IP rate marks, the global token bucket, the
//! method allow-list and the access log. Applied to every request before
//! the routed handler runs.
//!
//! The bucket is returned to exactly once per admitted request: either when
//! the handler finishes, or by a watchdog once the handler has been stuck
//! for five seconds (a wedged scrape must not pin tokens forever).

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::oneshot;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use ascend_cache::ShardedCache;

/// Request bodies above this are rejected outright.
pub const BODY_LIMIT: usize = 10 * 1024 * 1024;

/// How long a handler may hold a token before the watchdog reclaims it.
const TOKEN_WATCHDOG: Duration = Duration::from_secs(5);

/// Peer address of the accepted connection, set by the accept loop.
#[derive(Clone, Copy, Debug)]
pub struct ClientAddr(pub SocketAddr);

static IP_REQ_RULE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[1-9]\d{0,2}/[1-9]\d{0,2}$").expect("static pattern"));

/// Per-IP request allowance, parsed from `burst/seconds` (e.g. `20/1`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IpRate {
    pub burst: u64,
    pub window_secs: u64,
}

impl IpRate {
    /// Admission TTL: one request allowed per `window/burst`.
    pub fn mark_ttl(&self) -> Duration {
        Duration::from_nanos(self.window_secs * 1_000_000_000 / self.burst)
    }
}

impl FromStr for IpRate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !IP_REQ_RULE.is_match(s) {
            return Err(format!("{s:?} does not match burst/seconds"));
        }
        let (burst, window) = s.split_once('/').ok_or_else(|| "missing '/'".to_string())?;
        let burst: u64 = burst.parse().map_err(|_| "burst is not a number")?;
        let window_secs: u64 = window.parse().map_err(|_| "window is not a number")?;
        Ok(IpRate { burst, window_secs })
    }
}

pub struct Admission {
    tokens: Arc<Semaphore>,
    ip_cache: Arc<ShardedCache<i64>>,
    ip_mark_ttl: Duration,
    method: Option<Method>,
    access_log: bool,
}

/// Witness that a token was taken; dropping it signals handler completion
/// to the watchdog, which owns the token itself.
pub struct TokenGuard {
    done: Option<oneshot::Sender<()>>,
}

impl Drop for TokenGuard {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

impl Admission {
    pub fn new(
        concurrency: usize,
        rate: IpRate,
        ip_cache: Arc<ShardedCache<i64>>,
        method: Option<Method>,
        access_log: bool,
    ) -> Self {
        Admission {
            tokens: Arc::new(Semaphore::new(concurrency)),
            ip_cache,
            ip_mark_ttl: rate.mark_ttl(),
            method,
            access_log,
        }
    }

    /// First admission gate: one request per IP per window.
    pub fn admit_ip(&self, ip: &str) -> bool {
        self.ip_cache
            .set_if_absent(&format!("req-{ip}"), 1, Some(self.ip_mark_ttl))
            .unwrap_or(false)
    }

    /// Non-blocking token acquisition with the reclaim watchdog armed.
    pub fn try_enter(&self) -> Option<TokenGuard> {
        let permit = Arc::clone(&self.tokens).try_acquire_owned().ok()?;
        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(TOKEN_WATCHDOG) => {
                    tracing::debug!("token reclaimed from a slow handler");
                }
                _ = done_rx => {}
            }
            drop(permit);
        });
        Some(TokenGuard {
            done: Some(done_tx),
        })
    }

    pub fn available_tokens(&self) -> usize {
        self.tokens.available_permits()
    }
}

/// Best client-address guess: forwarding headers first, then the socket.
pub fn client_ip(headers: &HeaderMap, peer: Option<&ClientAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        if !real.is_empty() {
            return real.to_string();
        }
    }
    peer.map(|p| p.0.ip().to_string()).unwrap_or_default()
}

fn too_busy() -> Response {
    (StatusCode::SERVICE_UNAVAILABLE, "503 too busy").into_response()
}

/// The admission middleware, applied to every routed request.
pub async fn admit(
    State(admission): State<Arc<Admission>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let agent = request
        .headers()
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let ip = client_ip(request.headers(), request.extensions().get::<ClientAddr>());

    if !ip.is_empty() && !admission.admit_ip(&ip) {
        tracing::warn!(%method, path, ip, agent, "single IP request rejected");
        return too_busy();
    }

    let Some(guard) = admission.try_enter() else {
        tracing::warn!(%method, path, ip, agent, "total concurrency exceeded");
        return too_busy();
    };

    if let Some(allowed) = &admission.method {
        if method != *allowed {
            return StatusCode::NOT_FOUND.into_response();
        }
    }

    let start = Instant::now();
    let response = next.run(request).await;
    drop(guard);
    if admission.access_log {
        tracing::info!(
            %method,
            path,
            status = response.status().as_u16(),
            latency_ms = start.elapsed().as_millis() as u64,
            ip,
            agent,
            "request served"
        );
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admission(concurrency: usize) -> Admission {
        Admission::new(
            concurrency,
            IpRate {
                burst: 20,
                window_secs: 1,
            },
            Arc::new(ShardedCache::new(1024)),
            Some(Method::GET),
            false,
        )
    }

    #[test]
    fn ip_rate_parses_and_rejects() {
        let rate: IpRate = "20/1".parse().unwrap();
        assert_eq!(rate.burst, 20);
        assert_eq!(rate.mark_ttl(), Duration::from_millis(50));
        assert!("0/1".parse::<IpRate>().is_err());
        assert!("20".parse::<IpRate>().is_err());
        assert!("20/1000".parse::<IpRate>().is_err());
    }

    #[tokio::test]
    async fn third_concurrent_request_is_rejected() {
        let admission = admission(2);
        let first = admission.try_enter();
        let second = admission.try_enter();
        assert!(first.is_some());
        assert!(second.is_some());
        assert!(admission.try_enter().is_none());
        drop(first);
        // completion returns the token via the watchdog task
        tokio::task::yield_now().await;
        assert!(admission.try_enter().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn watchdog_reclaims_token_from_stuck_handler() {
        let admission = admission(1);
        let guard = admission.try_enter().expect("token available");
        assert!(admission.try_enter().is_none());
        tokio::time::advance(TOKEN_WATCHDOG + Duration::from_millis(1)).await;
        tokio::task::yield_now().await;
        // the stuck handler still holds its guard, yet the token is back
        assert_eq!(admission.available_tokens(), 1);
        drop(guard);
        tokio::task::yield_now().await;
        // late completion must not mint a second token
        assert_eq!(admission.available_tokens(), 1);
    }

    #[tokio::test]
    async fn ip_marks_expire_with_the_window() {
        let admission = admission(4);
        assert!(admission.admit_ip("10.0.0.1"));
        assert!(!admission.admit_ip("10.0.0.1"));
        assert!(admission.admit_ip("10.0.0.2"));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(admission.admit_ip("10.0.0.1"));
    }

    #[test]
    fn client_ip_prefers_forwarding_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "1.2.3.4, 5.6.7.8".parse().unwrap());
        headers.insert("x-real-ip", "9.9.9.9".parse().unwrap());
        let peer = ClientAddr("127.0.0.1:9000".parse().unwrap());
        assert_eq!(client_ip(&headers, Some(&peer)), "1.2.3.4");
        headers.remove("x-forwarded-for");
        assert_eq!(client_ip(&headers, Some(&peer)), "9.9.9.9");
        headers.remove("x-real-ip");
        assert_eq!(client_ip(&headers, Some(&peer)), "127.0.0.1");
    }
}
