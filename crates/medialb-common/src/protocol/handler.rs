//! Server-side handler contract and reply helpers.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::net::UdpSocket;

use super::control::Control;
use super::error::Result;
use super::packet::{Message, Packet};
use super::registry::Protocol;
use crate::transport::UdpTransport;

/// Default timeout for sending a reply datagram
pub const REPLY_TIMEOUT: Duration = Duration::from_secs(1);

/// Handles every inbound packet of one code.
///
/// Errors returned by a handler are reported on the server's error queue;
/// they never stop the server.
pub trait Handler<M: Message>: Send + Sync + 'static {
    fn handle(&self, request: Request<M>) -> BoxFuture<'static, Result<()>>;
}

impl<M, F, Fut> Handler<M> for F
where
    M: Message,
    F: Fn(Request<M>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, request: Request<M>) -> BoxFuture<'static, Result<()>> {
        Box::pin(self(request))
    }
}

/// An inbound packet and the means to answer it.
pub struct Request<M> {
    pub packet: Packet<M>,
    pub responder: Responder<M>,
}

/// Sends replies back to the peer a request came from.
pub struct Responder<M> {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    protocol: Arc<Protocol<M>>,
    timeout: Duration,
}

impl<M: Message> Responder<M> {
    pub fn new(socket: Arc<UdpSocket>, peer: SocketAddr, protocol: Arc<Protocol<M>>) -> Self {
        Self {
            socket,
            peer,
            protocol,
            timeout: REPLY_TIMEOUT,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub async fn reply(&self, value: M) -> Result<()> {
        let encoded = self.protocol.encode_packet(&value)?;
        UdpTransport::send_to(&self.socket, &encoded, self.peer, self.timeout).await
    }

    pub async fn reply_ok(&self) -> Result<()> {
        self.reply(M::from(Control::Ok)).await
    }

    pub async fn reply_error(&self, message: impl Into<String>) -> Result<()> {
        self.reply(M::from(Control::Error(message.into()))).await
    }

    /// Replies OK on success, or an Error carrying the error text.
    pub async fn reply_check(&self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => self.reply_ok().await,
            Err(e) => self.reply_error(e.to_string()).await,
        }
    }
}
