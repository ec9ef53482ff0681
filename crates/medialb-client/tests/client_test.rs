//! Client tests against hand-driven UDP peers.

use medialb_client::{Client, ClientConfig};
use medialb_common::protocol::{
    ping_fragment, Code, Control, Message, MedialbError, PingValue, Protocol, Result,
    CODE_PONG,
};
use medialb_common::transport::{Codec, UdpTransport};
use std::sync::Arc;
use std::time::{Duration, Instant};

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

/// Answers one ping by hand, optionally sending a stray datagram first.
async fn spawn_pong_peer(protocol: Arc<Protocol<Ctl>>, stray: bool) -> String {
    let socket = UdpTransport::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        let mut buf = vec![0u8; protocol.buffer_size()];
        let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
        let packet = protocol.decode_packet(&buf[..len], Some(peer)).unwrap();
        let ping = match packet.value.as_control() {
            Some(Control::Ping(ping)) => *ping,
            other => panic!("expected ping, got {:?}", other),
        };

        if stray {
            let other = UdpTransport::bind("127.0.0.1:0").await.unwrap();
            let junk = protocol.encode_packet(&Ctl(Control::Pong(PingValue::new(0)))).unwrap();
            other.send_to(&junk, peer).await.unwrap();
        }

        let pong = protocol.encode_packet(&Ctl(Control::Pong(ping.pong()))).unwrap();
        socket.send_to(&pong, peer).await.unwrap();
    });

    addr
}

#[tokio::test]
async fn test_request_reply() {
    let protocol = protocol();
    let addr = spawn_pong_peer(protocol.clone(), false).await;
    let client = Client::dial(protocol, &addr, ClientConfig::default())
        .await
        .unwrap();

    let ping = PingValue::new(5);
    let reply = client.send_request(Ctl(Control::Ping(ping))).await.unwrap();

    Client::check_error(&reply, CODE_PONG).unwrap();
    match reply.value.as_control() {
        Some(Control::Pong(pong)) => assert!(pong.check(&ping)),
        other => panic!("expected pong, got {:?}", other),
    }
}

#[tokio::test]
async fn test_reply_from_other_address_is_ignored() {
    let protocol = protocol();
    let addr = spawn_pong_peer(protocol.clone(), true).await;
    let client = Client::dial(protocol, &addr, ClientConfig::default())
        .await
        .unwrap();

    let reply = client
        .send_request(Ctl(Control::Ping(PingValue::new(41))))
        .await
        .unwrap();
    assert_eq!(reply.value.as_control(), Some(&Control::Pong(PingValue::new(42))));
    assert_eq!(reply.source, client.server());
}

#[tokio::test]
async fn test_request_times_out() {
    // Bound but never answers
    let silent = UdpTransport::bind("127.0.0.1:0").await.unwrap();
    let addr = silent.local_addr().unwrap().to_string();

    let client = Client::dial(
        protocol(),
        &addr,
        ClientConfig {
            timeout: Duration::from_millis(50),
        },
    )
    .await
    .unwrap();

    let start = Instant::now();
    let err = client
        .send_request(Ctl(Control::Ping(PingValue::new(1))))
        .await
        .unwrap_err();

    assert!(err.is_timeout());
    assert!(start.elapsed() < Duration::from_millis(500));
    match err {
        MedialbError::Request { protocol, .. } => assert_eq!(protocol, "ctl"),
        other => panic!("expected tagged request error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_requests_are_serialized() {
    let protocol = protocol();
    let socket = UdpTransport::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap().to_string();

    // Answers pings one by one, after a delay, counting overlapping requests
    let peer_protocol = protocol.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; peer_protocol.buffer_size()];
        for _ in 0..3 {
            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
            let packet = peer_protocol.decode_packet(&buf[..len], None).unwrap();
            if let Some(Control::Ping(ping)) = packet.value.as_control() {
                // Any queued ping would already be readable if requests overlapped
                tokio::time::sleep(Duration::from_millis(20)).await;
                let mut probe = [0u8; 1];
                assert!(socket.try_recv_from(&mut probe).is_err());

                let pong = peer_protocol
                    .encode_packet(&Ctl(Control::Pong(ping.pong())))
                    .unwrap();
                socket.send_to(&pong, peer).await.unwrap();
            }
        }
    });

    let client = Arc::new(
        Client::dial(protocol, &addr, ClientConfig::default())
            .await
            .unwrap(),
    );

    let mut handles = Vec::new();
    for i in 0..3u64 {
        let client = client.clone();
        handles.push(tokio::spawn(async move {
            let ping = PingValue::new(i * 10);
            let reply = client.send_request(Ctl(Control::Ping(ping))).await.unwrap();
            match reply.value.as_control() {
                Some(Control::Pong(pong)) => assert!(pong.check(&ping)),
                other => panic!("expected pong, got {:?}", other),
            }
        }));
    }

    for handle in handles {
        handle.await.unwrap();
    }
}

#[tokio::test]
async fn test_late_reply_is_not_taken_for_next_request() {
    let protocol = protocol();
    let socket = UdpTransport::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap().to_string();

    // Answers the first ping after the client gave up, the second at once
    let peer_protocol = protocol.clone();
    tokio::spawn(async move {
        let mut buf = vec![0u8; peer_protocol.buffer_size()];
        for delay in [Duration::from_millis(300), Duration::ZERO] {
            let (len, peer) = socket.recv_from(&mut buf).await.unwrap();
            let packet = peer_protocol.decode_packet(&buf[..len], None).unwrap();
            let ping = match packet.value.as_control() {
                Some(Control::Ping(ping)) => *ping,
                other => panic!("expected ping, got {:?}", other),
            };
            tokio::time::sleep(delay).await;
            let pong = peer_protocol
                .encode_packet(&Ctl(Control::Pong(ping.pong())))
                .unwrap();
            socket.send_to(&pong, peer).await.unwrap();
        }
    });

    let client = Client::dial(
        protocol,
        &addr,
        ClientConfig {
            timeout: Duration::from_millis(100),
        },
    )
    .await
    .unwrap();

    let err = client
        .send_request(Ctl(Control::Ping(PingValue::new(1))))
        .await
        .unwrap_err();
    assert!(err.is_timeout());

    // Let the late pong land on the client socket
    tokio::time::sleep(Duration::from_millis(400)).await;

    let reply = client
        .send_request(Ctl(Control::Ping(PingValue::new(10))))
        .await
        .unwrap();
    assert_eq!(reply.value.as_control(), Some(&Control::Pong(PingValue::new(11))));
}
