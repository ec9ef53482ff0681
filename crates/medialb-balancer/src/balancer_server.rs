//! Stream-protocol front end of the balancer.
//!
//! Clients send `StartStream`, `StopStream` and `RedirectStream` to the
//! front end, which runs a plugin chain per client and answers OK or Error.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use medialb_common::protocol::{collect_errors, MedialbError, Request, Result};
use medialb_server::Server;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::balancer::Balancer;
use crate::plugin::{BalancingPlugin, ChainSession, PluginChain};
use crate::session::{BalancingSessionHandler, SessionParameter};
use crate::stream::{
    ForwardingSessionHandler, RedirectStream, StartStream, StopStream, StreamMessage,
    CODE_REDIRECT_STREAM, CODE_START_STREAM, CODE_STOP_STREAM,
};

type SessionTable = Arc<RwLock<HashMap<String, Arc<ChainSession>>>>;

pub struct BalancerServer {
    server: Server<StreamMessage>,
    balancer: Balancer<StreamMessage>,
    sessions: SessionTable,
}

impl BalancerServer {
    /// The chain of a plain balancer: one [`BalancingPlugin`] forwarding
    /// each client's requests to its backends.
    pub fn forwarding_chain(balancer: &Balancer<StreamMessage>) -> PluginChain<StartStream> {
        PluginChain::new().with_plugin(BalancingPlugin::new(
            balancer.clone(),
            |start: &StartStream| {
                Arc::new(ForwardingSessionHandler::new(start.clone()))
                    as Arc<dyn BalancingSessionHandler<StreamMessage>>
            },
        ))
    }

    /// Binds the front end to `addr`; each `StartStream` runs through `chain`.
    pub async fn bind(
        addr: &str,
        balancer: Balancer<StreamMessage>,
        chain: PluginChain<StartStream>,
    ) -> Result<Self> {
        let chain = Arc::new(chain);
        let sessions: SessionTable = Arc::new(RwLock::new(HashMap::new()));

        let server = Server::builder(balancer.protocol().clone())
            .handle(CODE_START_STREAM, {
                let chain = chain.clone();
                let sessions = sessions.clone();
                move |request: Request<StreamMessage>| {
                    let chain = chain.clone();
                    let sessions = sessions.clone();
                    async move {
                        let result = match request.packet.value {
                            StreamMessage::Start(start) => {
                                start_session(&chain, &sessions, start).await
                            }
                            other => Err(unexpected("StartStream", &other)),
                        };
                        request.responder.reply_check(result).await
                    }
                }
            })
            .handle(CODE_STOP_STREAM, {
                let sessions = sessions.clone();
                move |request: Request<StreamMessage>| {
                    let sessions = sessions.clone();
                    async move {
                        let result = match request.packet.value {
                            StreamMessage::Stop(stop) => stop_session(&sessions, stop).await,
                            other => Err(unexpected("StopStream", &other)),
                        };
                        request.responder.reply_check(result).await
                    }
                }
            })
            .handle(CODE_REDIRECT_STREAM, {
                let balancer = balancer.clone();
                move |request: Request<StreamMessage>| {
                    let balancer = balancer.clone();
                    async move {
                        let result = match request.packet.value {
                            StreamMessage::Redirect(redirect) => {
                                redirect_stream(&balancer, redirect).await
                            }
                            other => Err(unexpected("RedirectStream", &other)),
                        };
                        request.responder.reply_check(result).await
                    }
                }
            })
            .bind(addr)
            .await?;

        Ok(Self {
            server,
            balancer,
            sessions,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn balancer(&self) -> &Balancer<StreamMessage> {
        &self.balancer
    }

    pub fn server(&self) -> &Server<StreamMessage> {
        &self.server
    }

    pub async fn session_keys(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Stops serving, ends every client session, then closes the balancer.
    pub async fn stop(&self) -> Result<()> {
        self.server.stop().await;

        let sessions: Vec<_> = self.sessions.write().await.drain().collect();
        let mut results = Vec::with_capacity(sessions.len() + 1);
        for (key, session) in sessions {
            if let Err(e) = session.stop().await {
                warn!("Failed to stop session {}: {}", key, e);
                results.push(Err(e));
            }
        }
        results.push(self.balancer.close().await);
        collect_errors(results)
    }
}

fn unexpected(expected: &str, got: &StreamMessage) -> MedialbError {
    MedialbError::Decode(format!("expected {}, got {:?}", expected, got))
}

async fn start_session(
    chain: &PluginChain<StartStream>,
    sessions: &SessionTable,
    start: StartStream,
) -> Result<()> {
    let key = start.client_key();
    if sessions.read().await.contains_key(&key) {
        return Err(MedialbError::SessionExists(key));
    }

    let session = Arc::new(chain.new_session(&start).await?);
    sessions.write().await.insert(key.clone(), session.clone());
    tokio::spawn(watch_session(sessions.clone(), key.clone(), session));

    info!("Streaming {} to {}", start.target, key);
    Ok(())
}

async fn stop_session(sessions: &SessionTable, stop: StopStream) -> Result<()> {
    let session = sessions
        .write()
        .await
        .remove(&stop.client)
        .ok_or_else(|| MedialbError::SessionNotFound(stop.client.clone()))?;
    session.stop().await?;
    info!("Stopped streaming to {}", stop.client);
    Ok(())
}

async fn redirect_stream(
    balancer: &Balancer<StreamMessage>,
    redirect: RedirectStream,
) -> Result<()> {
    let session = balancer
        .session(&redirect.client)
        .await
        .ok_or_else(|| MedialbError::SessionNotFound(redirect.client.clone()))?;
    session.redirect_stream(&redirect.host, redirect.port).await
}

/// Tears a client's chain down once one of its plugin sessions ends on its
/// own, e.g. after a failed failover.
async fn watch_session(sessions: SessionTable, key: String, session: Arc<ChainSession>) {
    if session.wait_stopped().await.is_none() {
        return;
    }

    let removed = {
        let mut table = sessions.write().await;
        match table.get(&key) {
            Some(current) if Arc::ptr_eq(current, &session) => table.remove(&key),
            _ => None,
        }
    };
    if removed.is_some() {
        info!("Session {} ended, tearing down its plugin chain", key);
        if let Err(e) = session.stop().await {
            warn!("Failed to tear down session {}: {}", key, e);
        }
    }
}
