//! Pooled HTTP clients for the local backends
//!
//! Every backend lives on `127.0.0.1:<port>`. Proxied traffic and readiness
//! probes use separate clients.

use crate::error::ProxyBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum PoolError {
    /// The backend failed before a response head arrived
    #[error("Backend request failed: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    /// The incoming request could not be turned into a backend request
    #[error("Could not build backend request: {0}")]
    RequestBuild(String),
}

impl PoolError {
    /// Connect refused, reset or closed before any response head.
    ///
    /// Nothing has been written to the client at this point.
    pub fn is_backend_failure(&self) -> bool {
        matches!(self, PoolError::Client(_))
    }
}

/// Counters shared with whoever holds the pool
#[derive(Debug, Default)]
pub struct PoolStats {
    proxied: AtomicU64,
    probes: AtomicU64,
}

impl PoolStats {
    /// Requests forwarded to a backend
    pub fn proxied(&self) -> u64 {
        self.proxied.load(Ordering::Relaxed)
    }

    /// Health requests sent
    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

pub struct ConnectionPool {
    proxy: Client<HttpConnector, Incoming>,
    probe: Client<HttpConnector, Empty<Bytes>>,
    stats: Arc<PoolStats>,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let mut builder = Client::builder(TokioExecutor::new());
        builder
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Backend clients ready"
        );

        Self {
            proxy: builder.build(connector.clone()),
            probe: builder.build(connector),
            stats: Arc::new(PoolStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Forward a request to `127.0.0.1:<port><path_and_query>`.
    ///
    /// Headers are copied as-is; the caller has already set the forwarding
    /// headers. The response body is handed back unbuffered.
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
        port: u16,
        path_and_query: &str,
    ) -> Result<Response<ProxyBody>, PoolError> {
        let (parts, body) = req.into_parts();

        let mut builder = Request::builder()
            .method(parts.method)
            .uri(format!("http://127.0.0.1:{}{}", port, path_and_query));
        for (name, value) in &parts.headers {
            builder = builder.header(name, value);
        }
        let outgoing = builder
            .body(body)
            .map_err(|e| PoolError::RequestBuild(e.to_string()))?;

        self.stats.proxied.fetch_add(1, Ordering::Relaxed);
        let response = self.proxy.request(outgoing).await?;
        Ok(response.map(|body| body.boxed()))
    }

    /// GET `path` on the backend; true only for a 200 answered within `timeout`
    pub async fn check_backend(&self, port: u16, path: &str, timeout: Duration) -> bool {
        let Ok(req) = Request::get(format!("http://127.0.0.1:{}{}", port, path)).body(Empty::<Bytes>::new()) else {
            return false;
        };

        self.stats.probes.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(timeout, self.probe.request(req)).await {
            Ok(Ok(response)) => response.status() == StatusCode::OK,
            Ok(Err(e)) => {
                debug!(port, path, error = %e, "Health request failed");
                false
            }
            Err(_) => {
                debug!(port, path, timeout_ms = timeout.as_millis() as u64, "Health request timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot-per-connection server answering `status`
    async fn answering(status: u16) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let head = format!("HTTP/1.1 {} X\r\nContent-Length: 0\r\nConnection: close\r\n\r\n", status);
                let _ = stream.write_all(head.as_bytes()).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn test_only_200_counts_as_healthy() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let timeout = Duration::from_secs(1);

        assert!(pool.check_backend(answering(200).await, "/_stcore/health", timeout).await);
        assert!(!pool.check_backend(answering(503).await, "/_stcore/health", timeout).await);
        assert_eq!(pool.stats().probes(), 2);
        assert_eq!(pool.stats().proxied(), 0);
    }

    #[tokio::test]
    async fn test_check_backend_refused() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(!pool.check_backend(port, "/health", Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn test_check_backend_gives_up_on_silent_backend() {
        let pool = ConnectionPool::new(PoolConfig::default());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let started = std::time::Instant::now();
        assert!(!pool.check_backend(port, "/health", Duration::from_millis(200)).await);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_request_build_errors_are_not_backend_failures() {
        assert!(!PoolError::RequestBuild("bad header".into()).is_backend_failure());
    }
}
