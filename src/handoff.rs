//! Public listener and the placeholder → router handoff
//!
//! The public socket is bound once and never closed. Every request looks up
//! the current [`Phase`]; the startup task flips it from `Placeholder` to
//! `Live` exactly once, after every backend has either answered its health
//! check or exhausted its startup probe budget.

use crate::config::Config;
use crate::error::{is_client_disconnect, ProxyBody};
use crate::placeholder::Placeholder;
use crate::pool::{ConnectionPool, PoolConfig, PoolStats};
use crate::probe::{ProbeSchedule, Prober};
use crate::proxy::Router;
use crate::sockets::SocketRegistry;
use crate::supervisor::{shutdown_requested, Supervisor};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Which handler owns the public socket
#[derive(Clone)]
pub enum Phase {
    Placeholder(Arc<Placeholder>),
    Live(Arc<Router>),
}

impl Phase {
    pub fn is_live(&self) -> bool {
        matches!(self, Phase::Live(_))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandoffError {
    #[error("The router is already live")]
    AlreadyLive,
}

/// One-way switch from placeholder to router
pub struct Handoff {
    phase_tx: watch::Sender<Phase>,
}

impl Handoff {
    pub fn new(placeholder: Placeholder) -> Self {
        let (phase_tx, _) = watch::channel(Phase::Placeholder(Arc::new(placeholder)));
        Self { phase_tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    pub fn is_live(&self) -> bool {
        self.phase_tx.borrow().is_live()
    }

    /// Install the router. Fails if one is already installed.
    pub fn go_live(&self, router: Arc<Router>) -> Result<(), HandoffError> {
        let mut router = Some(router);
        let switched = self.phase_tx.send_if_modified(|phase| {
            if phase.is_live() {
                return false;
            }
            match router.take() {
                Some(router) => {
                    *phase = Phase::Live(router);
                    true
                }
                None => false,
            }
        });

        if switched {
            info!("Router is live");
            Ok(())
        } else {
            Err(HandoffError::AlreadyLive)
        }
    }
}

/// The public TCP listener
pub struct PublicListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl PublicListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Public listener bound");
        Ok(Self { listener, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept until shutdown; each connection is served on its own task
    pub async fn run(self, phase_rx: watch::Receiver<Phase>, mut shutdown_rx: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let phase_rx = phase_rx.clone();
                            tokio::spawn(async move {
                                handle_connection(stream, addr, phase_rx).await;
                            });
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_requested(&mut shutdown_rx) => {
                    info!("Public listener shutting down");
                    break;
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, phase_rx: watch::Receiver<Phase>) {
    let _ = stream.set_nodelay(true);
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let phase = phase_rx.borrow().clone();
        async move { Ok::<_, Infallible>(dispatch(phase, req, addr).await) }
    });

    let result = AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await;

    if let Err(e) = result {
        let err: &(dyn std::error::Error + 'static) = &*e;
        if is_client_disconnect(err) {
            trace!(addr = %addr, error = %e, "Client disconnected");
        } else {
            warn!(addr = %addr, error = %e, "Connection error");
        }
    }
}

async fn dispatch(phase: Phase, req: Request<Incoming>, addr: SocketAddr) -> Response<ProxyBody> {
    match phase {
        Phase::Placeholder(placeholder) => placeholder.respond(&req),
        Phase::Live(router) => router.handle(req, addr).await,
    }
}

/// A running front door
pub struct Launched {
    local_addr: SocketAddr,
    supervisor: Arc<Supervisor>,
    handoff: Arc<Handoff>,
    pool_stats: Arc<PoolStats>,
    sockets: Arc<SocketRegistry>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl Launched {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn pool_stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.pool_stats)
    }

    pub fn is_live(&self) -> bool {
        self.handoff.is_live()
    }

    /// Sockets held by upgraded sessions right now
    pub fn open_sockets(&self) -> usize {
        self.sockets.len()
    }

    /// Wait for the router to go live; false on timeout
    pub async fn wait_live(&self, timeout: Duration) -> bool {
        let mut rx = self.handoff.subscribe();
        let live = matches!(tokio::time::timeout(timeout, rx.wait_for(Phase::is_live)).await, Ok(Ok(_)));
        live
    }

    /// Stop accepting, stop every backend, then wait for the tasks to finish
    pub async fn shutdown(self) {
        self.shutdown_tx.send_replace(true);

        info!("Stopping all backends...");
        self.supervisor.stop_all().await;

        let joined = tokio::time::timeout(self.shutdown_timeout, futures::future::join_all(self.tasks)).await;
        if joined.is_err() {
            warn!(
                timeout_secs = self.shutdown_timeout.as_secs(),
                "Background tasks did not stop in time"
            );
        }
    }
}

/// Bind the public port, start the backends and hand off once they are up
pub async fn launch(config: Config) -> anyhow::Result<Launched> {
    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid bind address {}:{}: {}", config.server.bind, config.server.port, e))?;

    let listener = PublicListener::bind(addr).await?;
    let local_addr = listener.local_addr();

    let handoff = Arc::new(Handoff::new(Placeholder::from_config(&config.server)));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut tasks = Vec::new();
    tasks.push(tokio::spawn(listener.run(handoff.subscribe(), shutdown_rx.clone())));

    let pool = Arc::new(ConnectionPool::new(PoolConfig {
        max_idle_per_host: config.server.pool_max_idle_per_host,
        idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
    }));
    let supervisor = Supervisor::new(config.backends.clone(), config.defaults.clone());
    let prober = Arc::new(Prober::new(Arc::clone(&supervisor), Arc::clone(&pool)));
    let sockets = SocketRegistry::new();
    let router = Arc::new(Router::new(
        &config,
        Arc::clone(&supervisor),
        Arc::clone(&prober),
        Arc::clone(&pool),
        Arc::clone(&sockets),
    )?);

    supervisor.start_all();

    let startup = {
        let supervisor = Arc::clone(&supervisor);
        let handoff = Arc::clone(&handoff);
        let schedule = ProbeSchedule::startup(&config.defaults);
        let keepalive_interval = config.defaults.keepalive_interval();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let names = supervisor.target_names();
            let waits = names.iter().map(|name| {
                let prober = Arc::clone(&prober);
                async move { (name.clone(), prober.wait_until_ready(name, schedule).await) }
            });

            let outcomes = tokio::select! {
                outcomes = futures::future::join_all(waits) => outcomes,
                _ = shutdown_requested(&mut shutdown_rx) => {
                    debug!("Shutdown requested during startup");
                    return;
                }
            };

            for (name, ready) in &outcomes {
                if !ready {
                    warn!(backend = %name, "Backend not ready after startup probing, continuing without it");
                }
            }

            if let Err(e) = handoff.go_live(router) {
                error!(error = %e, "Handoff failed");
                return;
            }

            let keepalives = names.into_iter().map(|name| {
                let prober = Arc::clone(&prober);
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move {
                    prober.keepalive(&name, keepalive_interval, shutdown_rx).await;
                })
            });
            futures::future::join_all(keepalives).await;
        })
    };
    tasks.push(startup);

    Ok(Launched {
        local_addr,
        supervisor,
        handoff,
        pool_stats: pool.stats(),
        sockets,
        shutdown_tx,
        tasks,
        shutdown_timeout: config.server.shutdown_timeout(),
    })
}
