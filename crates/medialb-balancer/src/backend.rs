use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use medialb_client::{Client, ClientConfig};
use medialb_common::protocol::{MedialbError, Message, Protocol, Result};
use medialb_common::transport::UdpTransport;

use crate::circuit_breaker::CircuitBreaker;
use crate::fault_detector::FaultDetectorFactory;

/// A media backend the balancer can place sessions on.
///
/// Requests to the backend go through its circuit breaker. Load and session
/// bookkeeping live in the [`LoadBalancer`](crate::LoadBalancer) pool.
pub struct BackendServer<M> {
    addr: SocketAddr,
    local_addr: SocketAddr,
    breaker: CircuitBreaker<M>,
}

impl<M: Message> BackendServer<M> {
    /// Dials `addr` and builds its detector with `factory`.
    ///
    /// The detector is not started; see [`CircuitBreaker::start`].
    pub async fn connect(
        protocol: Arc<Protocol<M>>,
        addr: &str,
        factory: &dyn FaultDetectorFactory,
    ) -> Result<Self> {
        let resolved = UdpTransport::resolve(addr).await?;
        let client = Client::dial(protocol, addr, ClientConfig::default()).await?;
        let detector = factory.new_detector(addr).await?;
        Self::with_breaker(resolved, CircuitBreaker::new(client, detector))
    }

    pub fn with_breaker(addr: SocketAddr, breaker: CircuitBreaker<M>) -> Result<Self> {
        let local_addr = breaker.client().local_addr()?;
        if breaker.client().server() != Some(addr) {
            return Err(MedialbError::Transport(format!(
                "breaker client targets {:?}, not backend {}",
                breaker.client().server(),
                addr
            )));
        }
        Ok(Self {
            addr,
            local_addr,
            breaker,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Local endpoint of the client talking to this backend
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn breaker(&self) -> &CircuitBreaker<M> {
        &self.breaker
    }

    pub fn online(&self) -> bool {
        self.breaker.online()
    }
}

impl<M> fmt::Display for BackendServer<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.addr)
    }
}

impl<M> fmt::Debug for BackendServer<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendServer")
            .field("addr", &self.addr)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
