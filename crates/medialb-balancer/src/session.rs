use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use futures::future::BoxFuture;
use medialb_common::protocol::{MedialbError, Message, Result};
use medialb_common::sync::Signal;

use crate::backend::BackendServer;
use crate::load_balancer::Selection;

/// Identifies the client a session is for.
pub trait SessionParameter: Send + Sync {
    /// Stable key of the session table
    fn client_key(&self) -> String;
}

impl SessionParameter for String {
    fn client_key(&self) -> String {
        self.clone()
    }
}

/// Drives a balanced session on its backends.
///
/// The balancer only does bookkeeping; everything that talks to a backend
/// on behalf of a session goes through the handler.
pub trait BalancingSessionHandler<M>: Send + Sync + 'static {
    /// Sets the session up on `backend`.
    fn start_remote<'a>(&'a self, backend: &'a Arc<BackendServer<M>>) -> BoxFuture<'a, Result<()>>;

    /// Tears the session down on `backend`.
    fn stop_remote<'a>(&'a self, backend: &'a Arc<BackendServer<M>>) -> BoxFuture<'a, Result<()>>;

    /// Fences `backend` off the session without waiting for the outcome.
    fn background_stop_remote(&self, backend: Arc<BackendServer<M>>);

    /// Asks `backend` to send the session's stream to `host:port`.
    fn redirect_stream<'a>(
        &'a self,
        backend: &'a Arc<BackendServer<M>>,
        host: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<()>>;

    /// Moves the session off `failed`, setting it up on a replacement.
    ///
    /// `backups` are the session's remaining backups in preference order.
    /// Returns the backend now serving the session.
    fn handle_server_fault<'a>(
        &'a self,
        failed: &'a Arc<BackendServer<M>>,
        backups: &'a [Arc<BackendServer<M>>],
    ) -> BoxFuture<'a, Result<Arc<BackendServer<M>>>>;
}

struct SessionState<M> {
    primary: Arc<BackendServer<M>>,
    backups: Vec<Arc<BackendServer<M>>>,
    failover_error: Option<Arc<MedialbError>>,
}

/// A client session placed on a primary backend with standby backups.
pub struct BalancingSession<M> {
    client_key: String,
    handler: Arc<dyn BalancingSessionHandler<M>>,
    state: StdMutex<SessionState<M>>,
    failing_over: AtomicBool,
    stopped: Signal,
}

impl<M: Message> BalancingSession<M> {
    pub(crate) fn new(
        client_key: String,
        handler: Arc<dyn BalancingSessionHandler<M>>,
        selection: Selection<M>,
    ) -> Self {
        Self {
            client_key,
            handler,
            state: StdMutex::new(SessionState {
                primary: selection.primary,
                backups: selection.backups,
                failover_error: None,
            }),
            failing_over: AtomicBool::new(false),
            stopped: Signal::new(),
        }
    }

    fn state(&self) -> MutexGuard<'_, SessionState<M>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    pub fn handler(&self) -> &Arc<dyn BalancingSessionHandler<M>> {
        &self.handler
    }

    pub fn primary(&self) -> Arc<BackendServer<M>> {
        self.state().primary.clone()
    }

    pub fn backups(&self) -> Vec<Arc<BackendServer<M>>> {
        self.state().backups.clone()
    }

    pub(crate) fn backup_addrs(&self) -> Vec<SocketAddr> {
        self.state().backups.iter().map(|b| b.addr()).collect()
    }

    /// Error of the failed failover that ended this session
    pub fn failover_error(&self) -> Option<Arc<MedialbError>> {
        self.state().failover_error.clone()
    }

    /// Enabled once the session is over, stopped or failed
    pub fn stopped(&self) -> &Signal {
        &self.stopped
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_enabled()
    }

    /// Redirects the stream from the current primary to `host:port`.
    pub async fn redirect_stream(&self, host: &str, port: u16) -> Result<()> {
        let primary = self.primary();
        self.handler.redirect_stream(&primary, host, port).await
    }

    /// Claims the session for a failover; `false` if one is running.
    pub(crate) fn begin_failover(&self) -> bool {
        self.failing_over
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn end_failover(&self) {
        self.failing_over.store(false, Ordering::Release);
    }

    /// Makes `new` the primary; neither it nor `failed` stays a backup.
    pub(crate) fn promote(&self, failed: SocketAddr, new: Arc<BackendServer<M>>) {
        let mut state = self.state();
        let new_addr = new.addr();
        state
            .backups
            .retain(|b| b.addr() != failed && b.addr() != new_addr);
        state.primary = new;
    }

    pub(crate) fn fail(&self, err: MedialbError) {
        self.state().failover_error = Some(Arc::new(err));
        self.stopped.enable();
    }
}

impl<M> std::fmt::Debug for BalancingSession<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BalancingSession")
            .field("client_key", &self.client_key)
            .field("stopped", &self.stopped.is_enabled())
            .finish()
    }
}
