//! Session plugin chains.
//!
//! A chain is an ordered list of plugins, each contributing one session per
//! client. Sessions are created from the last plugin to the first so that
//! each one is handed the session downstream of it, and started in that same
//! order. The chain session ends when any of its plugin sessions does.

use std::sync::Arc;

use futures::future::BoxFuture;
use medialb_common::protocol::{collect_errors, MedialbError, Message, Result};
use medialb_common::sync::{wait_any, Signal};
use tracing::{debug, warn};

use crate::balancer::Balancer;
use crate::session::{BalancingSessionHandler, SessionParameter};

/// One plugin's part of a client session.
pub trait PluginSession: Send + Sync + 'static {
    fn start(&self) -> BoxFuture<'_, Result<()>>;

    fn stop(&self) -> BoxFuture<'_, Result<()>>;

    /// Enabled once the session has ended, on request or on its own
    fn stopped(&self) -> Signal;
}

/// Creates plugin sessions for client requests of type `P`.
pub trait SessionPlugin<P>: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Creates, without starting it, the session for `param`. `downstream`
    /// is the session of the next plugin in the chain, if any.
    fn new_session<'a>(
        &'a self,
        param: &'a P,
        downstream: Option<Arc<dyn PluginSession>>,
    ) -> BoxFuture<'a, Result<Arc<dyn PluginSession>>>;
}

pub struct PluginChain<P> {
    plugins: Vec<Arc<dyn SessionPlugin<P>>>,
}

impl<P> Default for PluginChain<P> {
    fn default() -> Self {
        Self {
            plugins: Vec::new(),
        }
    }
}

impl<P: SessionParameter + 'static> PluginChain<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `plugin` at the downstream end of the chain
    pub fn with_plugin(mut self, plugin: impl SessionPlugin<P>) -> Self {
        self.plugins.push(Arc::new(plugin));
        self
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn plugin_names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Creates and starts the chain's sessions for `param`.
    ///
    /// If a session fails to start, the ones already started are stopped
    /// and the error is returned.
    pub async fn new_session(&self, param: &P) -> Result<ChainSession> {
        let mut sessions: Vec<Arc<dyn PluginSession>> = Vec::with_capacity(self.plugins.len());
        let mut downstream = None;
        for plugin in self.plugins.iter().rev() {
            let session = plugin.new_session(param, downstream.clone()).await?;
            debug!(
                "Plugin {} created session for {}",
                plugin.name(),
                param.client_key()
            );
            sessions.push(session.clone());
            downstream = Some(session);
        }
        sessions.reverse();

        let count = sessions.len();
        for started in 0..count {
            let index = count - 1 - started;
            if let Err(e) = sessions[index].start().await {
                warn!(
                    "Plugin {} failed to start session for {}: {}",
                    self.plugins[index].name(),
                    param.client_key(),
                    e
                );
                for session in &sessions[index + 1..] {
                    if let Err(stop_err) = session.stop().await {
                        warn!("Failed to roll back plugin session: {}", stop_err);
                    }
                }
                return Err(e);
            }
        }

        Ok(ChainSession {
            client_key: param.client_key(),
            sessions,
        })
    }
}

/// The plugin sessions of one client, in chain order.
pub struct ChainSession {
    client_key: String,
    sessions: Vec<Arc<dyn PluginSession>>,
}

impl ChainSession {
    pub fn client_key(&self) -> &str {
        &self.client_key
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Waits until any plugin session ends; returns its position in the
    /// chain, `None` for an empty chain.
    pub async fn wait_stopped(&self) -> Option<usize> {
        let signals: Vec<Signal> = self.sessions.iter().map(|s| s.stopped()).collect();
        wait_any(&signals).await
    }

    /// Stops every plugin session, upstream first.
    pub async fn stop(&self) -> Result<()> {
        let mut results = Vec::with_capacity(self.sessions.len());
        for session in &self.sessions {
            results.push(session.stop().await);
        }
        collect_errors(results)
    }
}

impl std::fmt::Debug for ChainSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainSession")
            .field("client_key", &self.client_key)
            .field("sessions", &self.sessions.len())
            .finish()
    }
}

type HandlerFactory<M, P> = Arc<dyn Fn(&P) -> Arc<dyn BalancingSessionHandler<M>> + Send + Sync>;

/// Places the chain's sessions on backends through a [`Balancer`].
pub struct BalancingPlugin<M, P> {
    balancer: Balancer<M>,
    handlers: HandlerFactory<M, P>,
}

impl<M: Message, P: SessionParameter + 'static> BalancingPlugin<M, P> {
    /// `handlers` builds the handler driving each new session.
    pub fn new(
        balancer: Balancer<M>,
        handlers: impl Fn(&P) -> Arc<dyn BalancingSessionHandler<M>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            balancer,
            handlers: Arc::new(handlers),
        }
    }
}

impl<M: Message, P: SessionParameter + 'static> SessionPlugin<P> for BalancingPlugin<M, P> {
    fn name(&self) -> &str {
        "balancing"
    }

    fn new_session<'a>(
        &'a self,
        param: &'a P,
        _downstream: Option<Arc<dyn PluginSession>>,
    ) -> BoxFuture<'a, Result<Arc<dyn PluginSession>>> {
        Box::pin(async move {
            let session: Arc<dyn PluginSession> = Arc::new(BalancingPluginSession {
                balancer: self.balancer.clone(),
                client_key: param.client_key(),
                handler: (self.handlers)(param),
                stopped: Signal::new(),
            });
            Ok(session)
        })
    }
}

struct BalancingPluginSession<M> {
    balancer: Balancer<M>,
    client_key: String,
    handler: Arc<dyn BalancingSessionHandler<M>>,
    stopped: Signal,
}

impl<M: Message> PluginSession for BalancingPluginSession<M> {
    fn start(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let session = self
                .balancer
                .start_session(&self.client_key, self.handler.clone())
                .await?;

            let ended = session.stopped().clone();
            let stopped = self.stopped.clone();
            tokio::spawn(async move {
                ended.wait().await;
                stopped.enable();
            });
            Ok(())
        })
    }

    fn stop(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let result = match self.balancer.stop_session(&self.client_key).await {
                // Already torn down by a failed failover
                Err(MedialbError::SessionNotFound(_)) => Ok(()),
                other => other,
            };
            self.stopped.enable();
            result
        })
    }

    fn stopped(&self) -> Signal {
        self.stopped.clone()
    }
}
