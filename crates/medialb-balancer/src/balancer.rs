use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use medialb_common::protocol::{collect_errors, MedialbError, Message, Protocol, Result};
use medialb_common::transport::UdpTransport;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::backend::BackendServer;
use crate::fault_detector::{
    FaultCallback, FaultDetectorConfig, FaultDetectorFactory, Health, PingDetectorFactory,
};
use crate::load_balancer::LoadBalancer;
use crate::session::{BalancingSession, BalancingSessionHandler, SessionParameter};

/// Balancer configuration.
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Number of backups reserved for each session
    pub backup_servers: usize,
    /// Load a backup reservation adds to a backend
    pub backup_weight: f64,
    /// Probing of backends
    pub detector: FaultDetectorConfig,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            backup_servers: 1,
            backup_weight: 0.1,
            detector: FaultDetectorConfig::default(),
        }
    }
}

/// Outcome of failing over the sessions of one backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FailoverReport {
    /// Sessions now served by another backend
    pub migrated: Vec<String>,
    /// Sessions that could not be moved and were torn down
    pub failed: Vec<String>,
}

struct FailoverOutcome<M> {
    session: Arc<BalancingSession<M>>,
    result: Result<Arc<BackendServer<M>>>,
}

struct BalancerInner<M> {
    protocol: Arc<Protocol<M>>,
    factory: Arc<dyn FaultDetectorFactory>,
    pool: RwLock<LoadBalancer<M>>,
    sessions: RwLock<HashMap<String, Arc<BalancingSession<M>>>>,
    closed: AtomicBool,
}

/// Places client sessions on media backends and moves them when a backend
/// fails.
///
/// Every backend is watched by a fault detector behind its circuit breaker.
/// A new session goes to the least loaded online backend, with the next
/// least loaded ones reserved as backups. When a detector reports its
/// backend offline, every session whose primary it was is failed over
/// concurrently: the old primary is fenced off, and the session's handler
/// brings the session up on a replacement. Results are applied one at a time
/// as they come in; a session that cannot be moved is torn down, the rest of
/// the balancer is unaffected.
///
/// Lock order is pool, then session table. Pool bookkeeping and a session's
/// backend references only change with the pool write lock held.
///
/// Cloning is cheap; clones share the same state.
pub struct Balancer<M> {
    inner: Arc<BalancerInner<M>>,
}

impl<M> Clone for Balancer<M> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<M: Message> Balancer<M> {
    pub fn new(
        protocol: Arc<Protocol<M>>,
        factory: Arc<dyn FaultDetectorFactory>,
        config: BalancerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(BalancerInner {
                protocol,
                factory,
                pool: RwLock::new(LoadBalancer::new(
                    config.backup_servers,
                    config.backup_weight,
                )),
                sessions: RwLock::new(HashMap::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Creates a balancer probing backends with pings.
    ///
    /// # Errors
    ///
    /// Fails if `protocol` does not include the ping fragment.
    pub fn with_ping_detection(protocol: Arc<Protocol<M>>, config: BalancerConfig) -> Result<Self> {
        let factory = PingDetectorFactory::new(protocol.clone(), config.detector.clone())?;
        Ok(Self::new(protocol, Arc::new(factory), config))
    }

    pub fn protocol(&self) -> &Arc<Protocol<M>> {
        &self.inner.protocol
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(MedialbError::Closed("balancer".to_string()));
        }
        Ok(())
    }

    /// Adds the backend at `addr` and starts watching it.
    ///
    /// `callback`, if any, is subscribed to the backend's health transitions
    /// with `addr` as key. The backend takes sessions once its first probe
    /// succeeds.
    pub async fn add_backend(
        &self,
        addr: &str,
        callback: Option<FaultCallback>,
    ) -> Result<Arc<BackendServer<M>>> {
        self.check_open()?;
        let resolved = UdpTransport::resolve(addr).await?;
        if self.inner.pool.read().await.contains(resolved) {
            return Err(MedialbError::BackendExists(addr.to_string()));
        }

        let backend = Arc::new(
            BackendServer::connect(
                self.inner.protocol.clone(),
                addr,
                self.inner.factory.as_ref(),
            )
            .await?,
        );
        if !self.inner.pool.write().await.add_backend(backend.clone()) {
            return Err(MedialbError::BackendExists(addr.to_string()));
        }

        let detector = backend.breaker().detector();
        detector.add_callback(self.failover_trigger(backend.addr()), addr);
        if let Some(callback) = callback {
            detector.add_callback(callback, addr);
        }
        backend.breaker().start();

        info!("Added backend {}", backend);
        Ok(backend)
    }

    fn failover_trigger(&self, addr: SocketAddr) -> FaultCallback {
        let balancer = Arc::downgrade(&self.inner);
        Arc::new(move |_key: &str, health: &Health| {
            if health.is_online() {
                return;
            }
            let Some(inner) = balancer.upgrade() else {
                return;
            };
            if inner.closed.load(Ordering::Acquire) {
                return;
            }

            let balancer = Balancer { inner };
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        balancer.handle_backend_down(addr).await;
                    });
                }
                Err(e) => error!("Cannot fail over backend {}: {}", addr, e),
            }
        })
    }

    pub async fn backends(&self) -> Vec<Arc<BackendServer<M>>> {
        self.inner.pool.read().await.backends()
    }

    pub async fn backend_load(&self, addr: SocketAddr) -> Option<f64> {
        self.inner.pool.read().await.load(addr)
    }

    pub async fn session(&self, client_key: &str) -> Option<Arc<BalancingSession<M>>> {
        self.inner.sessions.read().await.get(client_key).cloned()
    }

    pub async fn sessions(&self) -> Vec<Arc<BalancingSession<M>>> {
        self.inner.sessions.read().await.values().cloned().collect()
    }

    /// Starts a session for `param` on the least loaded online backend.
    ///
    /// # Errors
    ///
    /// `SessionExists` if the client already has a session,
    /// `NoServerAvailable` if no backend is online, or the handler's error
    /// if the primary refuses the session (which is then dropped).
    pub async fn start_session(
        &self,
        param: &dyn SessionParameter,
        handler: Arc<dyn BalancingSessionHandler<M>>,
    ) -> Result<Arc<BalancingSession<M>>> {
        self.check_open()?;
        let key = param.client_key();

        let session = {
            let mut pool = self.inner.pool.write().await;
            let mut sessions = self.inner.sessions.write().await;
            if sessions.contains_key(&key) {
                return Err(MedialbError::SessionExists(key));
            }

            let selection = pool.pick_server()?;
            pool.register_session(&key, &selection);
            let session = Arc::new(BalancingSession::new(key.clone(), handler, selection));
            // Held until the primary has accepted the session, so a failover
            // cannot migrate a session that never started
            session.begin_failover();
            sessions.insert(key.clone(), session.clone());
            session
        };

        let primary = session.primary();
        if let Err(e) = session.handler().start_remote(&primary).await {
            warn!("Backend {} refused session {}: {}", primary, key, e);
            self.remove_session(&session).await;
            session.stopped().enable();
            return Err(e);
        }
        session.end_failover();

        // A failover of the primary that ran meanwhile skipped this session
        if primary.breaker().error().is_some() && !self.is_closed() {
            warn!("Backend {} went down while session {} started", primary, key);
            let balancer = self.clone();
            let failed = primary.clone();
            let pending = session.clone();
            tokio::spawn(async move {
                balancer.fail_over_sessions(failed, vec![pending]).await;
            });
        }

        info!(
            "Session {} started on {} (backups: {:?})",
            key,
            primary,
            session.backup_addrs()
        );
        Ok(session)
    }

    /// Stops the session of `client_key` and releases its backends.
    pub async fn stop_session(&self, client_key: &str) -> Result<()> {
        let session = self
            .session(client_key)
            .await
            .ok_or_else(|| MedialbError::SessionNotFound(client_key.to_string()))?;
        if !self.remove_session(&session).await {
            return Err(MedialbError::SessionNotFound(client_key.to_string()));
        }

        let primary = session.primary();
        let result = session.handler().stop_remote(&primary).await;
        session.stopped().enable();

        match &result {
            Ok(()) => info!("Session {} stopped on {}", client_key, primary),
            Err(e) => warn!("Session {} stopped, but {} failed to stop it: {}", client_key, primary, e),
        }
        result
    }

    /// Drops `session` from the table and the pool bookkeeping; `false` if
    /// it was already gone.
    async fn remove_session(&self, session: &Arc<BalancingSession<M>>) -> bool {
        let mut pool = self.inner.pool.write().await;
        let key = session.client_key();

        let removed = {
            let mut sessions = self.inner.sessions.write().await;
            match sessions.get(key) {
                Some(current) if Arc::ptr_eq(current, session) => {
                    sessions.remove(key);
                    true
                }
                _ => false,
            }
        };
        if removed {
            pool.unregister_session(key, session.primary().addr(), &session.backup_addrs());
        }
        removed
    }

    /// Fails over every session whose primary is `failed`.
    ///
    /// Called when the backend's detector reports it offline. Sessions
    /// already failing over are left to the running failover.
    pub async fn handle_backend_down(&self, failed: SocketAddr) -> FailoverReport {
        let (failed_backend, keys) = {
            let pool = self.inner.pool.read().await;
            (pool.backend(failed), pool.sessions_on(failed))
        };
        let Some(failed_backend) = failed_backend else {
            warn!("Unknown backend {} reported down", failed);
            return FailoverReport::default();
        };
        if keys.is_empty() {
            info!("Backend {} is down with no sessions, nothing to fail over", failed);
            return FailoverReport::default();
        }

        let sessions: Vec<_> = {
            let table = self.inner.sessions.read().await;
            keys.iter().filter_map(|key| table.get(key).cloned()).collect()
        };
        self.fail_over_sessions(failed_backend, sessions).await
    }

    /// Fails `sessions` over from `failed_backend`, one task per session.
    async fn fail_over_sessions(
        &self,
        failed_backend: Arc<BackendServer<M>>,
        sessions: Vec<Arc<BalancingSession<M>>>,
    ) -> FailoverReport {
        let failed = failed_backend.addr();
        info!(
            "Backend {} is down, failing over {} sessions",
            failed,
            sessions.len()
        );

        let (tx, rx) = mpsc::unbounded_channel();
        let collector = tokio::spawn(self.clone().collect_failovers(failed, rx));

        for session in sessions {
            if !session.begin_failover() {
                debug!("Session {} is already failing over", session.client_key());
                continue;
            }
            let tx = tx.clone();
            let failed_backend = failed_backend.clone();
            tokio::spawn(async move {
                let result = fail_over(&session, &failed_backend).await;
                let _ = tx.send(FailoverOutcome { session, result });
            });
        }
        // Each failover task owns a sender, so the collector sees the
        // channel close only after the last one has reported.
        drop(tx);

        match collector.await {
            Ok(report) => report,
            Err(e) => {
                error!("Failover collector for {} failed: {}", failed, e);
                FailoverReport::default()
            }
        }
    }

    async fn collect_failovers(
        self,
        failed: SocketAddr,
        mut outcomes: mpsc::UnboundedReceiver<FailoverOutcome<M>>,
    ) -> FailoverReport {
        let mut report = FailoverReport::default();

        while let Some(FailoverOutcome { session, result }) = outcomes.recv().await {
            let key = session.client_key().to_string();
            match result {
                Ok(new) => {
                    if self.apply_failover(&session, failed, new.clone()).await {
                        info!("Session {} moved from {} to {}", key, failed, new);
                        report.migrated.push(key);
                    } else {
                        debug!("Session {} ended during failover, releasing {}", key, new);
                        session.handler().background_stop_remote(new);
                    }
                }
                Err(e) => {
                    warn!("Failover of session {} off {} failed: {}", key, failed, e);
                    self.remove_session(&session).await;
                    session.fail(e);
                    report.failed.push(key);
                }
            }
            session.end_failover();
        }

        report
    }

    async fn apply_failover(
        &self,
        session: &Arc<BalancingSession<M>>,
        failed: SocketAddr,
        new: Arc<BackendServer<M>>,
    ) -> bool {
        let mut pool = self.inner.pool.write().await;
        let key = session.client_key();

        let current = self
            .inner
            .sessions
            .read()
            .await
            .get(key)
            .is_some_and(|s| Arc::ptr_eq(s, session));
        if !current || session.primary().addr() != failed {
            return false;
        }

        let was_backup = session.backup_addrs().contains(&new.addr());
        pool.complete_failover(key, failed, new.addr(), was_backup);
        session.promote(failed, new);
        true
    }

    /// Closes the balancer and every backend's breaker.
    ///
    /// The balancer is marked closed first, so the offline notifications of
    /// the closing detectors do not trigger failover.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let backends = self.backends().await;
        let mut results = Vec::with_capacity(backends.len());
        for backend in &backends {
            results.push(backend.breaker().close().await);
        }
        info!("Balancer closed ({} backends)", backends.len());
        collect_errors(results)
    }
}

/// Fences the failed primary, then lets the handler move the session.
async fn fail_over<M: Message>(
    session: &BalancingSession<M>,
    failed: &Arc<BackendServer<M>>,
) -> Result<Arc<BackendServer<M>>> {
    session.handler().background_stop_remote(failed.clone());

    let backups: Vec<_> = session
        .backups()
        .into_iter()
        .filter(|b| b.addr() != failed.addr())
        .collect();
    session.handler().handle_server_fault(failed, &backups).await
}
