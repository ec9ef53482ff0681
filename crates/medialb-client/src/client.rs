use medialb_common::protocol::error::{MedialbError, Result};
use medialb_common::protocol::{Code, Control, Message, Packet, Protocol, CODE_OK};
use medialb_common::transport::UdpTransport;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Budget for each of the send and the receive half of a request
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
        }
    }
}

/// medialb client for one remote server.
///
/// Requests on one client are serialized: at most one request is outstanding
/// at a time, so a reply on the connectionless transport always belongs to
/// the request that is waiting for it. A request can take up to about twice
/// the configured timeout (one budget to send, one to receive).
///
/// # Example
///
/// ```no_run
/// # use medialb_client::{Client, ClientConfig};
/// # use medialb_common::protocol::{Control, Message, PingValue, Protocol};
/// # use std::sync::Arc;
/// # async fn example<M: Message>(protocol: Arc<Protocol<M>>) -> medialb_common::Result<()> {
/// let client = Client::dial(protocol, "127.0.0.1:7000", ClientConfig::default()).await?;
/// let reply = client.send_request(M::from(Control::Ping(PingValue::new(5)))).await?;
/// # Ok(())
/// # }
/// ```
pub struct Client<M> {
    protocol: Arc<Protocol<M>>,
    socket: UdpSocket,
    server: Option<SocketAddr>,
    timeout: Duration,
    request_lock: Mutex<()>,
    closed: AtomicBool,
}

impl<M: Message> Client<M> {
    /// Creates a client on an ephemeral IPv4 endpoint, with no server set.
    pub async fn new(protocol: Arc<Protocol<M>>, config: ClientConfig) -> Result<Self> {
        let socket = UdpTransport::bind("0.0.0.0:0").await?;
        Ok(Self::with_socket(protocol, socket, None, config))
    }

    /// Creates a client talking to `server`.
    pub async fn dial(
        protocol: Arc<Protocol<M>>,
        server: &str,
        config: ClientConfig,
    ) -> Result<Self> {
        let server = UdpTransport::resolve(server).await?;
        let socket = UdpTransport::dial(server).await?;
        Ok(Self::with_socket(protocol, socket, Some(server), config))
    }

    fn with_socket(
        protocol: Arc<Protocol<M>>,
        socket: UdpSocket,
        server: Option<SocketAddr>,
        config: ClientConfig,
    ) -> Self {
        Self {
            protocol,
            socket,
            server,
            timeout: config.timeout,
            request_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub async fn set_server(&mut self, server: &str) -> Result<()> {
        self.server = Some(UdpTransport::resolve(server).await?);
        Ok(())
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn server(&self) -> Option<SocketAddr> {
        self.server
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn protocol(&self) -> &Arc<Protocol<M>> {
        &self.protocol
    }

    fn target(&self) -> Result<SocketAddr> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MedialbError::Closed(format!(
                "{} client",
                self.protocol.name()
            )));
        }
        self.server.ok_or(MedialbError::NoServerAddress)
    }

    /// Sends a packet without waiting for a reply.
    pub async fn send_packet(&self, value: M) -> Result<()> {
        let server = self.target()?;
        self.send(&value, server)
            .await
            .map_err(|e| MedialbError::request(self.protocol.name(), server, e))
    }

    /// Sends a request and waits for the reply.
    ///
    /// # Errors
    ///
    /// Send, timeout and decode failures are wrapped in
    /// `MedialbError::Request` naming the protocol and the server;
    /// `MedialbError::is_timeout` distinguishes timeouts.
    pub async fn send_request(&self, value: M) -> Result<Packet<M>> {
        let server = self.target()?;
        let _guard = self.request_lock.lock().await;

        self.exchange(&value, server, |_| true)
            .await
            .map_err(|e| MedialbError::request(self.protocol.name(), server, e))
    }

    /// Like [`send_request`](Self::send_request), but skips replies that
    /// `accept` rejects and keeps reading until the timeout.
    pub async fn send_request_matching<F>(&self, value: M, accept: F) -> Result<Packet<M>>
    where
        F: Fn(&Packet<M>) -> bool,
    {
        let server = self.target()?;
        let _guard = self.request_lock.lock().await;

        self.exchange(&value, server, accept)
            .await
            .map_err(|e| MedialbError::request(self.protocol.name(), server, e))
    }

    /// Sends a request and expects an OK reply.
    pub async fn request_ok(&self, value: M) -> Result<()> {
        let reply = self.send_request(value).await?;
        Self::check_reply(&reply)
    }

    async fn send(&self, value: &M, server: SocketAddr) -> Result<()> {
        let encoded = self.protocol.encode_packet(value)?;
        UdpTransport::send_to(&self.socket, &encoded, server, self.timeout).await
    }

    async fn exchange<F>(&self, value: &M, server: SocketAddr, accept: F) -> Result<Packet<M>>
    where
        F: Fn(&Packet<M>) -> bool,
    {
        let mut buf = vec![0u8; self.protocol.buffer_size()];

        // Late replies to earlier, timed out requests
        let stale = UdpTransport::drain(&self.socket, &mut buf);
        if stale > 0 {
            debug!("Dropped {} stale datagram(s) before request to {}", stale, server);
        }

        self.send(value, server).await?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(MedialbError::Timeout(self.timeout.as_millis() as u64));
            }

            let (len, source) = UdpTransport::recv_from(&self.socket, &mut buf, remaining)
                .await
                .map_err(|e| match e {
                    MedialbError::Timeout(_) => {
                        MedialbError::Timeout(self.timeout.as_millis() as u64)
                    }
                    other => other,
                })?;

            if source != server {
                debug!("Ignoring datagram from {} (expecting {})", source, server);
                continue;
            }

            let packet = self.protocol.decode_packet(&buf[..len], Some(source))?;
            if accept(&packet) {
                return Ok(packet);
            }
            debug!("Skipping unmatched reply {:?} from {}", packet.value, server);
        }
    }

    /// Expects an OK reply.
    pub fn check_reply(reply: &Packet<M>) -> Result<()> {
        Self::check_error(reply, CODE_OK)
    }

    /// Expects a reply with `expected` code.
    ///
    /// An Error reply yields `MedialbError::Remote` with the carried text; any
    /// other code yields `MedialbError::UnexpectedCode` with the payload.
    pub fn check_error(reply: &Packet<M>, expected: Code) -> Result<()> {
        let code = reply.code();
        if code == expected {
            return Ok(());
        }
        match reply.value.as_control() {
            Some(Control::Error(msg)) => Err(MedialbError::Remote(msg.clone())),
            _ => Err(MedialbError::UnexpectedCode {
                expected,
                got: code,
                payload: format!("{:?}", reply.value),
            }),
        }
    }

    /// Closes the client. Later sends fail with `MedialbError::Closed`.
    pub fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medialb_common::protocol::{ping_fragment, PingValue, CODE_PONG};
    use medialb_common::transport::Codec;

    #[derive(Debug)]
    struct Ctl(Control);

    impl From<Control> for Ctl {
        fn from(c: Control) -> Self {
            Ctl(c)
        }
    }

    impl Message for Ctl {
        fn code(&self) -> Code {
            self.0.code()
        }

        fn encode_value(&self, codec: &Codec) -> Result<Vec<u8>> {
            self.0.encode_value(codec)
        }

        fn as_control(&self) -> Option<&Control> {
            Some(&self.0)
        }
    }

    fn protocol() -> Arc<Protocol<Ctl>> {
        Arc::new(Protocol::new("ctl", vec![ping_fragment()]).unwrap())
    }

    #[tokio::test]
    async fn test_send_without_server_fails() {
        let client = Client::new(protocol(), ClientConfig::default()).await.unwrap();
        let result = client.send_packet(Ctl(Control::Ok)).await;
        assert!(matches!(result, Err(MedialbError::NoServerAddress)));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let client = Client::dial(protocol(), "127.0.0.1:9", ClientConfig::default())
            .await
            .unwrap();
        client.close().unwrap();
        assert!(client.is_closed());
        let result = client.send_packet(Ctl(Control::Ok)).await;
        assert!(matches!(result, Err(MedialbError::Closed(_))));
    }

    #[tokio::test]
    async fn test_set_server() {
        let mut client = Client::new(protocol(), ClientConfig::default()).await.unwrap();
        client.set_server("127.0.0.1:7000").await.unwrap();
        assert_eq!(client.server(), Some("127.0.0.1:7000".parse().unwrap()));
    }

    #[test]
    fn test_check_reply_ok() {
        let reply = Packet::new(Ctl(Control::Ok));
        assert!(Client::check_reply(&reply).is_ok());
    }

    #[test]
    fn test_check_error_carries_remote_text() {
        let reply = Packet::new(Ctl(Control::Error("no such stream".into())));
        match Client::check_reply(&reply) {
            Err(MedialbError::Remote(msg)) => assert_eq!(msg, "no such stream"),
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[test]
    fn test_check_error_unexpected_code_includes_payload() {
        let reply = Packet::new(Ctl(Control::Ping(PingValue::new(9))));
        match Client::check_error(&reply, CODE_PONG) {
            Err(MedialbError::UnexpectedCode {
                expected,
                got,
                payload,
            }) => {
                assert_eq!(expected, CODE_PONG);
                assert_eq!(got, reply.code());
                assert!(payload.contains("9"));
            }
            other => panic!("expected unexpected code error, got {:?}", other),
        }
    }
}
