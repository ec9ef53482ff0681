use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::protocol::error::{MedialbError, Result};

/// Async UDP transport helpers.
///
/// Every logical message is one datagram. All waits carry an explicit
/// timeout; an elapsed timeout surfaces as `MedialbError::Timeout`.
///
/// # Example
///
/// ```no_run
/// use medialb_common::transport::UdpTransport;
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let server = UdpTransport::resolve("127.0.0.1:7000").await?;
/// let socket = UdpTransport::dial(server).await?;
/// UdpTransport::send_to(&socket, b"\x02\x05", server, Duration::from_secs(1)).await?;
/// # Ok(())
/// # }
/// ```
pub struct UdpTransport;

impl UdpTransport {
    /// Resolves `host:port` to the first matching socket address.
    pub async fn resolve(addr: &str) -> Result<SocketAddr> {
        tokio::net::lookup_host(addr)
            .await
            .map_err(|e| MedialbError::Transport(format!("Invalid address '{}': {}", addr, e)))?
            .next()
            .ok_or_else(|| MedialbError::Transport(format!("Address '{}' did not resolve", addr)))
    }

    /// Opens a listening endpoint.
    pub async fn bind(addr: &str) -> Result<UdpSocket> {
        UdpSocket::bind(addr)
            .await
            .map_err(|e| MedialbError::Transport(format!("Failed to bind to {}: {}", addr, e)))
    }

    /// Opens an endpoint for talking to `server`, on an ephemeral local port
    /// of the same address family.
    pub async fn dial(server: SocketAddr) -> Result<UdpSocket> {
        let local = if server.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        Self::bind(local).await
    }

    /// Sends one datagram.
    pub async fn send_to(
        socket: &UdpSocket,
        data: &[u8],
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<()> {
        let sent = tokio::time::timeout(timeout, socket.send_to(data, addr))
            .await
            .map_err(|_| MedialbError::Timeout(timeout.as_millis() as u64))?
            .map_err(|e| Self::map_io_error(e, "sending datagram"))?;

        if sent != data.len() {
            return Err(MedialbError::Transport(format!(
                "Short send: {} of {} bytes",
                sent,
                data.len()
            )));
        }
        Ok(())
    }

    /// Receives one datagram into `buf`.
    pub async fn recv_from(
        socket: &UdpSocket,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<(usize, SocketAddr)> {
        tokio::time::timeout(timeout, socket.recv_from(buf))
            .await
            .map_err(|_| MedialbError::Timeout(timeout.as_millis() as u64))?
            .map_err(|e| Self::map_io_error(e, "receiving datagram"))
    }

    /// Discards every datagram already queued on `socket` without waiting.
    ///
    /// Returns how many were dropped.
    pub fn drain(socket: &UdpSocket, buf: &mut [u8]) -> usize {
        let mut dropped = 0;
        // Refused/reset errors from an earlier send also end the drain
        while socket.try_recv_from(buf).is_ok() {
            dropped += 1;
        }
        dropped
    }

    /// Map IO errors to appropriate MedialbError variants
    ///
    /// - Timeouts/would block -> `Timeout`
    /// - Refused/reset (ICMP port unreachable) -> `Transport`
    /// - Other IO errors -> `Io`
    pub fn map_io_error(err: std::io::Error, context: &str) -> MedialbError {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                MedialbError::Timeout(0)
            }
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset => {
                MedialbError::Transport(format!("{}: {}", context, err))
            }
            _ => MedialbError::Io(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addr = UdpTransport::resolve("127.0.0.1:9000").await.unwrap();
        assert_eq!(addr.port(), 9000);
    }

    #[tokio::test]
    async fn test_resolve_invalid_address() {
        let result = UdpTransport::resolve("not an address").await;
        assert!(matches!(result, Err(MedialbError::Transport(_))));
    }

    #[tokio::test]
    async fn test_send_and_receive_datagram() {
        let server = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = UdpTransport::dial(server_addr).await.unwrap();

        UdpTransport::send_to(&client, b"hello", server_addr, Duration::from_secs(1))
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = UdpTransport::recv_from(&server, &mut buf, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn test_receive_times_out() {
        let socket = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let mut buf = [0u8; 16];
        let result =
            UdpTransport::recv_from(&socket, &mut buf, Duration::from_millis(20)).await;
        assert!(result.unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_drain_discards_queued_datagrams() {
        let socket = UdpTransport::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let peer = UdpTransport::dial(addr).await.unwrap();

        for data in [&b"late-1"[..], &b"late-2"[..]] {
            UdpTransport::send_to(&peer, data, addr, Duration::from_secs(1))
                .await
                .unwrap();
        }
        socket.readable().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut buf = [0u8; 16];
        assert_eq!(UdpTransport::drain(&socket, &mut buf), 2);
        assert_eq!(UdpTransport::drain(&socket, &mut buf), 0);
        let result =
            UdpTransport::recv_from(&socket, &mut buf, Duration::from_millis(20)).await;
        assert!(result.unwrap_err().is_timeout());
    }
}
