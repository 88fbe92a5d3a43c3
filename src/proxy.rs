//! Live request router: health, upgrades, chat, prefix proxying, static assets

use crate::assets::StaticAssets;
use crate::chat::{ChatClient, CHAT_PATH};
use crate::config::Config;
use crate::error::{json_error_response, ok_response, LoadingPage, ProxyBody, ProxyErrorCode};
use crate::pool::ConnectionPool;
use crate::probe::{ProbeSchedule, Prober};
use crate::routes::{ProxyRoute, RouteTable};
use crate::sockets::SocketRegistry;
use crate::supervisor::{Supervisor, TargetState};
use crate::upgrade::{self, HandshakeError, UpgradeTarget};
use dashmap::DashSet;
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::{Request, Response, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

const WARMING_UP_MESSAGE: &str = "This page is warming up. It will load automatically in a moment.";

pub struct Router {
    supervisor: Arc<Supervisor>,
    prober: Arc<Prober>,
    pool: Arc<ConnectionPool>,
    routes: RouteTable,
    sockets: Arc<SocketRegistry>,
    assets: StaticAssets,
    chat: ChatClient,
    loading_page: LoadingPage,
    health_path: String,
    request_timeout: Duration,
    request_probe: ProbeSchedule,
    /// Backends already reported unreachable since they were last ready
    reported_unreachable: DashSet<String>,
}

impl Router {
    pub fn new(
        config: &Config,
        supervisor: Arc<Supervisor>,
        prober: Arc<Prober>,
        pool: Arc<ConnectionPool>,
        sockets: Arc<SocketRegistry>,
    ) -> anyhow::Result<Self> {
        let server = &config.server;
        Ok(Self {
            routes: RouteTable::from_backends(&config.backends),
            assets: StaticAssets::new(&server.static_dir, server.index_file.clone()),
            chat: ChatClient::new(config.chat.clone())?,
            loading_page: LoadingPage::new(server.brand.clone(), server.loading_refresh_secs),
            health_path: server.health_path.clone(),
            request_timeout: server.request_timeout(),
            request_probe: ProbeSchedule::on_request(&config.defaults),
            reported_unreachable: DashSet::new(),
            supervisor,
            prober,
            pool,
            sockets,
        })
    }

    pub async fn handle(&self, mut req: Request<Incoming>, client_addr: SocketAddr) -> Response<ProxyBody> {
        let path = req.uri().path().to_string();

        if path == self.health_path {
            return ok_response();
        }

        let request_id = set_forwarding_headers(&mut req, client_addr);
        debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

        if upgrade::is_upgrade_request(&req) {
            return self.handle_upgrade(req, &path, client_addr, &request_id).await;
        }

        if path == CHAT_PATH {
            return self.chat.handle(req).await;
        }

        match self.routes.match_path(&path) {
            Some(route) => self.forward(req, route, &path, &request_id).await,
            None => self.assets.serve(&req).await,
        }
    }

    async fn handle_upgrade(
        &self,
        req: Request<Incoming>,
        path: &str,
        client_addr: SocketAddr,
        request_id: &str,
    ) -> Response<ProxyBody> {
        let Some(route) = self.routes.match_path(path) else {
            debug!(path, request_id, "Upgrade request without a route");
            return upgrade::unmatched_response();
        };

        if !self.ensure_ready(&route.target).await {
            return self.loading_page.response(StatusCode::SERVICE_UNAVAILABLE, WARMING_UP_MESSAGE);
        }

        let Some(port) = self.supervisor.get_config(&route.target).map(|c| c.port) else {
            return json_error_response(ProxyErrorCode::InternalError, "Backend configuration not found");
        };

        let backend = route.target.as_str();
        let path_and_query = route.rewrite_path(path, req.uri().query());
        let target = UpgradeTarget {
            backend,
            port,
            path_and_query: &path_and_query,
        };
        let result = upgrade::forward_upgrade(
            req,
            target,
            client_addr,
            Arc::clone(&self.sockets),
            request_id,
            self.request_timeout,
        )
        .await;

        match result {
            Ok(response) => response,
            Err(HandshakeError::Unreachable(e)) => {
                if self.supervisor.mark_not_ready(backend) {
                    warn!(backend, port, error = %e, "Backend dropped upgrade, marking not ready");
                }
                self.loading_page.response(StatusCode::SERVICE_UNAVAILABLE, WARMING_UP_MESSAGE)
            }
            Err(e @ HandshakeError::TimedOut(_)) => {
                warn!(backend, port, request_id, error = %e, "Upgrade timed out");
                json_error_response(ProxyErrorCode::RequestTimeout, e.to_string())
            }
            Err(e @ HandshakeError::InvalidResponse(_)) => {
                warn!(backend, port, request_id, error = %e, "Upgrade failed");
                json_error_response(ProxyErrorCode::ConnectionFailed, e.to_string())
            }
        }
    }

    async fn forward(
        &self,
        req: Request<Incoming>,
        route: &ProxyRoute,
        path: &str,
        request_id: &str,
    ) -> Response<ProxyBody> {
        let backend = route.target.as_str();

        if !self.ensure_ready(backend).await {
            return self.loading_page.response(StatusCode::SERVICE_UNAVAILABLE, WARMING_UP_MESSAGE);
        }

        let Some(port) = self.supervisor.get_config(backend).map(|c| c.port) else {
            return json_error_response(ProxyErrorCode::InternalError, "Backend configuration not found");
        };

        let path_and_query = route.rewrite_path(path, req.uri().query());
        let result = tokio::time::timeout(
            self.request_timeout,
            self.pool.send_request(req, port, &path_and_query),
        )
        .await;

        match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) if e.is_backend_failure() => {
                // Nothing reached the client yet; let the next request re-probe
                if self.supervisor.mark_not_ready(backend) {
                    warn!(backend, port, error = %e, "Backend failed before responding, marking not ready");
                }
                self.loading_page.response(StatusCode::SERVICE_UNAVAILABLE, WARMING_UP_MESSAGE)
            }
            Ok(Err(e)) => {
                warn!(backend, port, request_id, error = %e, "Failed to forward request");
                json_error_response(ProxyErrorCode::ConnectionFailed, "Failed to reach backend")
            }
            Err(_) => {
                warn!(
                    backend,
                    port,
                    request_id,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Request timed out"
                );
                json_error_response(
                    ProxyErrorCode::RequestTimeout,
                    format!("Request timed out after {} seconds", self.request_timeout.as_secs()),
                )
            }
        }
    }

    /// Ready now, or after a short bounded probe
    async fn ensure_ready(&self, backend: &str) -> bool {
        if self.supervisor.accepts_traffic(backend) {
            self.reported_unreachable.remove(backend);
            return true;
        }

        match self.supervisor.state(backend) {
            TargetState::Failed => {
                debug!(backend, "Backend has failed permanently");
                return false;
            }
            TargetState::Restarting => {
                debug!(backend, "Backend is restarting");
                return false;
            }
            _ => {}
        }

        if self.prober.wait_until_ready(backend, self.request_probe).await {
            self.reported_unreachable.remove(backend);
            return true;
        }

        if self.reported_unreachable.insert(backend.to_string()) {
            warn!(
                backend,
                attempts = self.request_probe.max_attempts,
                "Backend still not ready after probing, serving loading page"
            );
        } else {
            debug!(backend, "Backend still not ready");
        }
        false
    }
}

/// Overwrite the X-Forwarded-* headers and return the request ID.
///
/// Client-supplied forwarding headers are replaced, not appended to.
fn set_forwarding_headers<B>(req: &mut Request<B>, client_addr: SocketAddr) -> String {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    if let Ok(value) = HeaderValue::from_str(&client_addr.ip().to_string()) {
        headers.insert(X_FORWARDED_FOR, value);
    }

    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

    request_id
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> SocketAddr {
        "10.1.2.3:5555".parse().unwrap()
    }

    #[test]
    fn test_forwarding_headers_overwrite_client_values() {
        let mut req = Request::builder()
            .uri("/enroll")
            .header("Host", "enroll.example.com")
            .header("X-Forwarded-For", "1.1.1.1")
            .header("X-Forwarded-Proto", "gopher")
            .body(())
            .unwrap();

        let request_id = set_forwarding_headers(&mut req, client());

        let headers = req.headers();
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "10.1.2.3");
        assert_eq!(headers.get(X_FORWARDED_HOST).unwrap(), "enroll.example.com");
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "http");
        assert_eq!(headers.get(X_REQUEST_ID).unwrap().to_str().unwrap(), request_id);
        assert!(Uuid::parse_str(&request_id).is_ok());
    }

    #[test]
    fn test_request_id_is_propagated() {
        let mut req = Request::builder()
            .uri("/")
            .header("X-Request-ID", "abc-123")
            .body(())
            .unwrap();

        assert_eq!(set_forwarding_headers(&mut req, client()), "abc-123");
        assert_eq!(req.headers().get_all(X_REQUEST_ID).iter().count(), 1);
    }
}
