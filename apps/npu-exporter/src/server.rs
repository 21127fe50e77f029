// SPDX-FileCopyrightText: © 2024 Tenstorrent Inc.
// SPDX-License-Identifier: Apache-2.0

//! The HTTP front: an owned accept loop so that connection-level limiting
//! and the TLS handshake both happen before any HTTP bytes are parsed.
//! Rejected connections are reset immediately (linger 0) to keep half-open
//! sockets from accumulating.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::header::CONTENT_TYPE;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tower::Service;

use ascend_cache::ShardedCache;

use crate::limiter::{self, Admission, ClientAddr};
use crate::tlsconf::{chain_serials, CertStatus, PeerSerials, RevocationState, TlsGate};

const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection-level limits applied in the accept loop.
pub struct ConnLimits {
    total: Arc<tokio::sync::Semaphore>,
    per_ip: i64,
    counts: Arc<ShardedCache<i64>>,
}

/// Counted TTL on release so an address that stops connecting eventually
/// leaves the cache.
const CONN_COUNT_TTL: Duration = Duration::from_secs(3600);

impl ConnLimits {
    pub fn new(total: usize, per_ip: i64, counts: Arc<ShardedCache<i64>>) -> Self {
        ConnLimits {
            total: Arc::new(tokio::sync::Semaphore::new(total)),
            per_ip,
            counts,
        }
    }

    /// Admit one connection from `ip`, or `None` when either limit is hit.
    fn admit(&self, ip: &str) -> Option<ConnTicket> {
        let key = format!("conn-{ip}");
        match self.counts.increment(&key, None) {
            Ok(count) if count > self.per_ip => {
                let _ = self.counts.decrement(&key, Some(CONN_COUNT_TTL));
                tracing::warn!(ip, count, "per-IP connection limit reached");
                return None;
            }
            Err(err) => {
                tracing::warn!(ip, %err, "connection count unavailable");
            }
            Ok(_) => {}
        }
        match Arc::clone(&self.total).try_acquire_owned() {
            Ok(permit) => Some(ConnTicket {
                _permit: permit,
                key,
                counts: Arc::clone(&self.counts),
            }),
            Err(_) => {
                let _ = self.counts.decrement(&key, Some(CONN_COUNT_TTL));
                tracing::warn!(ip, "total connection limit reached");
                None
            }
        }
    }
}

/// Held for the lifetime of one admitted connection.
struct ConnTicket {
    _permit: tokio::sync::OwnedSemaphorePermit,
    key: String,
    counts: Arc<ShardedCache<i64>>,
}

impl Drop for ConnTicket {
    fn drop(&mut self) {
        let _ = self.counts.decrement(&self.key, Some(CONN_COUNT_TTL));
    }
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Registry,
    pub cert_status: Arc<BTreeMap<String, CertStatus>>,
    pub port: u16,
}

pub fn build_router(
    state: AppState,
    admission: Arc<Admission>,
    revocation: Arc<RevocationState>,
) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/", get(index_handler))
        .route("/v1/certstatus", get(certstatus_handler))
        .layer(DefaultBodyLimit::max(limiter::BODY_LIMIT))
        .layer(axum::middleware::from_fn_with_state(admission, limiter::admit))
        .layer(axum::middleware::from_fn_with_state(
            revocation,
            crate::tlsconf::revocation_gate,
        ))
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    let registry = state.registry.clone();
    let encoded = tokio::task::spawn_blocking(move || {
        let families = registry.gather();
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&families, &mut buf).map(|_| buf)
    })
    .await;
    match encoded {
        Ok(Ok(body)) => ([(CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Ok(Err(err)) => {
            tracing::error!(%err, "metric encoding failed");
            axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(err) => {
            tracing::error!(%err, "metric gathering task failed");
            axum::http::StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn index_handler(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        r#"<html>
<head><title>NPU-Exporter</title></head>
<body>
<h1 align="center">NPU-Exporter</h1>
<p align="center">Welcome to use NPU-Exporter, the Prometheus metrics url is https://ip:{}/metrics: <a href="./metrics">Metrics</a></p>
</body>
</html>"#,
        state.port
    ))
}

async fn certstatus_handler(State(state): State<AppState>) -> Json<BTreeMap<String, CertStatus>> {
    Json((*state.cert_status).clone())
}

/// Accept loop: connection limits, optional TLS, then per-connection HTTP
/// serving with the peer address (and any peer certificates) attached to
/// every request.
pub async fn serve(
    listener: TcpListener,
    router: Router,
    limits: ConnLimits,
    tls: Option<Arc<TlsGate>>,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = shutdown.changed() => {
                tracing::warn!("listener shutting down");
                return Ok(());
            }
        };

        let Some(ticket) = limits.admit(&peer.ip().to_string()) else {
            reset_now(stream);
            continue;
        };

        let router = router.clone();
        let tls = tls.clone();
        tokio::spawn(async move {
            let _ticket = ticket;
            match tls {
                Some(gate) => match gate.acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        let serials = {
                            let (_, session) = tls_stream.get_ref();
                            session
                                .peer_certificates()
                                .map(chain_serials)
                                .unwrap_or_default()
                        };
                        serve_connection(TokioIo::new(tls_stream), router, peer, serials).await;
                    }
                    Err(err) => {
                        tracing::warn!(%peer, %err, "TLS handshake failed");
                    }
                },
                None => {
                    serve_connection(TokioIo::new(stream), router, peer, Vec::new()).await;
                }
            }
        });
    }
}

async fn serve_connection<I>(io: I, router: Router, peer: SocketAddr, serials: Vec<Vec<u8>>)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let serials = PeerSerials(Arc::new(serials));
    let service = hyper::service::service_fn(move |request: hyper::Request<hyper::body::Incoming>| {
        let mut router = router.clone();
        let serials = serials.clone();
        async move {
            let mut request = request.map(axum::body::Body::new);
            request.extensions_mut().insert(ClientAddr(peer));
            request.extensions_mut().insert(serials);
            router.call(request).await
        }
    });

    let mut builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT);
    if let Err(err) = builder.serve_connection(io, service).await {
        tracing::debug!(%peer, %err, "connection closed with error");
    }
}

/// Reset-immediate close: linger 0 makes the kernel send RST instead of
/// holding the socket in FIN_WAIT.
fn reset_now(stream: TcpStream) {
    if let Err(err) = stream.set_linger(Some(Duration::ZERO)) {
        tracing::warn!(%err, "setting linger failed");
    }
    drop(stream);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_limits_enforce_total_and_per_ip() {
        let cache = Arc::new(ShardedCache::new(1024));
        let limits = ConnLimits::new(2, 1, cache);
        let first = limits.admit("10.0.0.1");
        assert!(first.is_some());
        // second connection from the same address exceeds the per-IP cap
        assert!(limits.admit("10.0.0.1").is_none());
        let second = limits.admit("10.0.0.2");
        assert!(second.is_some());
        // total cap of two is now exhausted
        assert!(limits.admit("10.0.0.3").is_none());
        drop(first);
        assert!(limits.admit("10.0.0.3").is_some());
    }

    #[test]
    fn closing_a_connection_releases_the_ip_count() {
        let cache = Arc::new(ShardedCache::new(1024));
        let limits = ConnLimits::new(8, 1, cache);
        let ticket = limits.admit("10.0.0.9");
        assert!(limits.admit("10.0.0.9").is_none());
        drop(ticket);
        assert!(limits.admit("10.0.0.9").is_some());
    }
}
