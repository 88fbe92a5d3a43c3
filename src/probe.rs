//! Readiness probing for backend targets
//!
//! Two flavours share one health request: a bounded backoff loop used at
//! startup and while a request waits for its backend, and a fixed-interval
//! keepalive that runs for the lifetime of the process once a backend is up.

use crate::config::BackendDefaults;
use crate::pool::ConnectionPool;
use crate::supervisor::{shutdown_requested, Supervisor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Growth factor of the delay between probe attempts
pub const BACKOFF_MULTIPLIER: f64 = 1.5;

/// Attempt budget and backoff of a readiness wait
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeSchedule {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Timeout of each health request
    pub request_timeout: Duration,
}

impl ProbeSchedule {
    /// Budget used while the public listener waits for backends at startup
    pub fn startup(defaults: &BackendDefaults) -> Self {
        Self {
            max_attempts: defaults.startup_probe_attempts,
            initial_delay: Duration::from_millis(defaults.startup_probe_delay_ms),
            max_delay: Duration::from_millis(defaults.probe_max_delay_ms),
            request_timeout: Duration::from_millis(defaults.probe_timeout_ms),
        }
    }

    /// Short budget used while a client request is held
    pub fn on_request(defaults: &BackendDefaults) -> Self {
        Self {
            max_attempts: defaults.request_probe_attempts,
            initial_delay: Duration::from_millis(defaults.request_probe_delay_ms),
            max_delay: Duration::from_millis(defaults.probe_max_delay_ms),
            request_timeout: Duration::from_millis(defaults.probe_timeout_ms),
        }
    }

    /// Delays slept between consecutive attempts (one fewer than attempts)
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let max_delay = self.max_delay;
        let count = self.max_attempts.saturating_sub(1) as usize;
        std::iter::successors(Some(self.initial_delay.min(max_delay)), move |delay| {
            Some(delay.mul_f64(BACKOFF_MULTIPLIER).min(max_delay))
        })
        .take(count)
    }

    /// Upper bound on the wall-clock time a wait can take
    pub fn worst_case(&self) -> Duration {
        let sleeping: Duration = self.delays().sum();
        sleeping + self.request_timeout * self.max_attempts
    }
}

/// Issues health requests against backends and records the results
pub struct Prober {
    supervisor: Arc<Supervisor>,
    pool: Arc<ConnectionPool>,
}

impl Prober {
    pub fn new(supervisor: Arc<Supervisor>, pool: Arc<ConnectionPool>) -> Self {
        Self { supervisor, pool }
    }

    /// One health request. Logs only when readiness flips.
    pub async fn probe_once(&self, name: &str, timeout: Duration) -> bool {
        let Some(config) = self.supervisor.get_config(name) else {
            return false;
        };
        let health_path = config.health_path(self.supervisor.defaults());

        let healthy = self.pool.check_backend(config.port, health_path, timeout).await;

        if self.supervisor.record_probe(name, healthy) {
            if healthy {
                info!(backend = name, port = config.port, "Backend is ready");
            } else {
                warn!(backend = name, port = config.port, "Backend stopped answering its health check");
            }
        }

        // A refused success (target restarting or failed) does not count
        healthy && self.supervisor.accepts_traffic(name)
    }

    /// Probe with backoff until ready or the attempt budget runs out.
    ///
    /// Never errors; `false` means the caller should proceed degraded.
    pub async fn wait_until_ready(&self, name: &str, schedule: ProbeSchedule) -> bool {
        if self.supervisor.get_config(name).is_none() {
            return false;
        }

        let mut delays = schedule.delays();
        for attempt in 1..=schedule.max_attempts {
            if self.probe_once(name, schedule.request_timeout).await {
                debug!(backend = name, attempt, "Readiness probe succeeded");
                return true;
            }

            match delays.next() {
                Some(delay) => {
                    debug!(
                        backend = name,
                        attempt,
                        max_attempts = schedule.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Backend not ready, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => break,
            }
        }

        false
    }

    /// Poll on a fixed interval until shutdown so idle backends stay warm
    pub async fn keepalive(&self, name: &str, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        let timeout = Duration::from_millis(self.supervisor.defaults().probe_timeout_ms);
        debug!(backend = name, interval_secs = interval.as_secs(), "Keepalive started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.probe_once(name, timeout).await;
                }
                _ = shutdown_requested(&mut shutdown_rx) => {
                    debug!(backend = name, "Keepalive stopped");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendConfig;
    use crate::pool::PoolConfig;
    use std::collections::BTreeMap;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn schedule(max_attempts: u32, initial_ms: u64, max_ms: u64) -> ProbeSchedule {
        ProbeSchedule {
            max_attempts,
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            request_timeout: Duration::from_millis(200),
        }
    }

    fn prober_for(port: u16) -> (Prober, Arc<Supervisor>) {
        let mut configs = BTreeMap::new();
        configs.insert("app".to_string(), BackendConfig::external(port, "/app"));
        let supervisor = Supervisor::new(configs, BackendDefaults::default());
        let pool = Arc::new(ConnectionPool::new(PoolConfig::default()));
        (Prober::new(Arc::clone(&supervisor), pool), supervisor)
    }

    /// Minimal HTTP/1.1 server answering every request with `status`
    async fn status_server(status: u16) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    let _ = stream.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {} Status\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
                        status
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                });
            }
        });
        port
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[test]
    fn test_delays_grow_and_are_capped() {
        let delays: Vec<Duration> = schedule(8, 300, 2000).delays().collect();
        assert_eq!(delays.len(), 7);
        assert_eq!(delays[0], Duration::from_millis(300));
        assert_eq!(delays[1], Duration::from_millis(450));
        assert_eq!(delays[2], Duration::from_millis(675));

        for pair in delays.windows(2) {
            assert!(pair[0] <= pair[1], "delays must not decrease: {:?}", delays);
        }
        assert!(delays.iter().all(|d| *d <= Duration::from_millis(2000)));
        assert_eq!(*delays.last().unwrap(), Duration::from_millis(2000));
    }

    #[test]
    fn test_initial_delay_above_cap_is_clamped() {
        let delays: Vec<Duration> = schedule(3, 5000, 2000).delays().collect();
        assert_eq!(delays, vec![Duration::from_millis(2000); 2]);
    }

    #[test]
    fn test_worst_case_is_bounded() {
        let s = schedule(40, 500, 2000);
        assert!(s.worst_case() <= (Duration::from_millis(2000) + s.request_timeout) * 40);
        assert_eq!(schedule(1, 500, 2000).delays().count(), 0);
        assert_eq!(schedule(0, 500, 2000).delays().count(), 0);
    }

    #[test]
    fn test_schedules_from_defaults() {
        let defaults = BackendDefaults::default();
        let on_request = ProbeSchedule::on_request(&defaults);
        assert_eq!(on_request.max_attempts, 6);
        assert_eq!(on_request.initial_delay, Duration::from_millis(250));

        let startup = ProbeSchedule::startup(&defaults);
        assert_eq!(startup.max_attempts, 40);
        assert_eq!(startup.max_delay, Duration::from_millis(2000));
        assert_eq!(startup.request_timeout, Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_wait_until_ready_succeeds_on_200() {
        let port = status_server(200).await;
        let (prober, supervisor) = prober_for(port);

        assert!(prober.wait_until_ready("app", schedule(3, 10, 50)).await);
        assert!(supervisor.accepts_traffic("app"));
    }

    #[tokio::test]
    async fn test_wait_until_ready_gives_up_without_error() {
        let port = unused_port().await;
        let (prober, supervisor) = prober_for(port);

        let started = std::time::Instant::now();
        assert!(!prober.wait_until_ready("app", schedule(3, 10, 50)).await);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!supervisor.is_ready("app"));
        assert!(supervisor.readiness("app").unwrap().last_checked_at.is_some());
    }

    #[tokio::test]
    async fn test_non_200_is_not_ready() {
        let port = status_server(204).await;
        let (prober, _supervisor) = prober_for(port);

        assert!(!prober.wait_until_ready("app", schedule(2, 10, 10)).await);
    }

    #[tokio::test]
    async fn test_unknown_target_is_not_ready() {
        let (prober, _supervisor) = prober_for(1);
        assert!(!prober.wait_until_ready("missing", schedule(3, 10, 10)).await);
    }

    #[tokio::test]
    async fn test_keepalive_marks_backend_down_and_stops_on_shutdown() {
        let port = unused_port().await;
        let (prober, supervisor) = prober_for(port);
        supervisor.mark_ready("app");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let prober = Arc::new(prober);
        let task = {
            let prober = Arc::clone(&prober);
            tokio::spawn(async move {
                prober.keepalive("app", Duration::from_millis(20), shutdown_rx).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!supervisor.is_ready("app"));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("keepalive should stop on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn test_keepalive_stops_when_shutdown_sender_is_dropped() {
        let (prober, _supervisor) = prober_for(unused_port().await);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        drop(shutdown_tx);

        tokio::time::timeout(
            Duration::from_secs(2),
            prober.keepalive("app", Duration::from_secs(60), shutdown_rx),
        )
        .await
        .expect("keepalive should return once the sender is gone");
    }
}
