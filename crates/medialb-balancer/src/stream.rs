//! Stream-session messages and the handler forwarding them to backends.

use std::sync::Arc;

use futures::future::BoxFuture;
use medialb_common::protocol::{
    ping_fragment, Code, Control, Fragment, MedialbError, Message, Protocol, Result,
    FIRST_FRAGMENT_CODE,
};
use medialb_common::transport::Codec;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::backend::BackendServer;
use crate::session::{BalancingSessionHandler, SessionParameter};

pub const CODE_START_STREAM: Code = FIRST_FRAGMENT_CODE;
pub const CODE_STOP_STREAM: Code = FIRST_FRAGMENT_CODE + 1;
pub const CODE_REDIRECT_STREAM: Code = FIRST_FRAGMENT_CODE + 2;

pub const STREAM_FRAGMENT: &str = "stream";
pub const STREAM_PROTOCOL: &str = "stream";

/// Asks for `target` to be streamed to `client`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartStream {
    pub client: String,
    pub target: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopStream {
    pub client: String,
}

/// Moves the stream of `client` to `host:port`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedirectStream {
    pub client: String,
    pub host: String,
    pub port: u16,
}

impl SessionParameter for StartStream {
    fn client_key(&self) -> String {
        self.client.clone()
    }
}

/// Messages of the stream protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Control(Control),
    Start(StartStream),
    Stop(StopStream),
    Redirect(RedirectStream),
}

impl From<Control> for StreamMessage {
    fn from(control: Control) -> Self {
        StreamMessage::Control(control)
    }
}

impl Message for StreamMessage {
    fn code(&self) -> Code {
        match self {
            StreamMessage::Control(c) => c.code(),
            StreamMessage::Start(_) => CODE_START_STREAM,
            StreamMessage::Stop(_) => CODE_STOP_STREAM,
            StreamMessage::Redirect(_) => CODE_REDIRECT_STREAM,
        }
    }

    fn encode_value(&self, codec: &Codec) -> Result<Vec<u8>> {
        match self {
            StreamMessage::Control(c) => c.encode_value(codec),
            StreamMessage::Start(start) => codec.encode_value(start),
            StreamMessage::Stop(stop) => codec.encode_value(stop),
            StreamMessage::Redirect(redirect) => codec.encode_value(redirect),
        }
    }

    fn as_control(&self) -> Option<&Control> {
        match self {
            StreamMessage::Control(c) => Some(c),
            _ => None,
        }
    }
}

pub fn stream_fragment() -> Fragment<StreamMessage> {
    Fragment::new(STREAM_FRAGMENT)
        .with_decoder(CODE_START_STREAM, |codec, raw| {
            Ok(StreamMessage::Start(codec.decode_value(raw)?))
        })
        .with_decoder(CODE_STOP_STREAM, |codec, raw| {
            Ok(StreamMessage::Stop(codec.decode_value(raw)?))
        })
        .with_decoder(CODE_REDIRECT_STREAM, |codec, raw| {
            Ok(StreamMessage::Redirect(codec.decode_value(raw)?))
        })
}

/// Control, ping and stream fragments: spoken by balancer front ends and
/// media backends alike.
pub fn stream_protocol() -> Result<Protocol<StreamMessage>> {
    Protocol::new(STREAM_PROTOCOL, vec![ping_fragment(), stream_fragment()])
}

/// Drives a session by forwarding its stream requests to backends through
/// their circuit breakers.
pub struct ForwardingSessionHandler {
    request: StartStream,
}

impl ForwardingSessionHandler {
    pub fn new(request: StartStream) -> Self {
        Self { request }
    }

    pub fn request(&self) -> &StartStream {
        &self.request
    }

    fn stop_message(&self) -> StreamMessage {
        StreamMessage::Stop(StopStream {
            client: self.request.client.clone(),
        })
    }
}

impl BalancingSessionHandler<StreamMessage> for ForwardingSessionHandler {
    fn start_remote<'a>(
        &'a self,
        backend: &'a Arc<BackendServer<StreamMessage>>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            backend
                .breaker()
                .request_ok(StreamMessage::Start(self.request.clone()))
                .await
        })
    }

    fn stop_remote<'a>(
        &'a self,
        backend: &'a Arc<BackendServer<StreamMessage>>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { backend.breaker().request_ok(self.stop_message()).await })
    }

    fn background_stop_remote(&self, backend: Arc<BackendServer<StreamMessage>>) {
        // The backend is presumed down: skip the breaker and don't wait
        let stop = self.stop_message();
        let client = self.request.client.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.breaker().client().send_packet(stop).await {
                debug!("Fencing {} off session {} failed: {}", backend, client, e);
            }
        });
    }

    fn redirect_stream<'a>(
        &'a self,
        backend: &'a Arc<BackendServer<StreamMessage>>,
        host: &'a str,
        port: u16,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            backend
                .breaker()
                .request_ok(StreamMessage::Redirect(RedirectStream {
                    client: self.request.client.clone(),
                    host: host.to_string(),
                    port,
                }))
                .await
        })
    }

    fn handle_server_fault<'a>(
        &'a self,
        failed: &'a Arc<BackendServer<StreamMessage>>,
        backups: &'a [Arc<BackendServer<StreamMessage>>],
    ) -> BoxFuture<'a, Result<Arc<BackendServer<StreamMessage>>>> {
        Box::pin(async move {
            let mut last_error = None;
            for backup in backups.iter().filter(|b| b.online()) {
                match self.start_remote(backup).await {
                    Ok(()) => return Ok(backup.clone()),
                    Err(e) => {
                        warn!(
                            "Backup {} refused session {}: {}",
                            backup, self.request.client, e
                        );
                        last_error = Some(e);
                    }
                }
            }

            Err(MedialbError::Failover(match last_error {
                Some(e) => format!(
                    "no backup of {} took session {}: {}",
                    failed, self.request.client, e
                ),
                None => format!(
                    "no online backup of {} for session {}",
                    failed, self.request.client
                ),
            }))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start() -> StartStream {
        StartStream {
            client: "10.1.1.5:6000".into(),
            target: "rtsp://cam-7/main".into(),
        }
    }

    #[test]
    fn test_stream_codes_owned_by_stream_fragment() {
        let protocol = stream_protocol().unwrap();
        for code in [CODE_START_STREAM, CODE_STOP_STREAM, CODE_REDIRECT_STREAM] {
            assert_eq!(protocol.owner(code), Some(STREAM_FRAGMENT));
        }
        assert!(protocol.check_includes_fragment("ping").is_ok());
    }

    #[test]
    fn test_start_stream_packet() {
        let protocol = stream_protocol().unwrap();
        let encoded = protocol
            .encode_packet(&StreamMessage::Start(start()))
            .unwrap();
        let packet = protocol.decode_packet(&encoded, None).unwrap();
        assert_eq!(packet.code(), CODE_START_STREAM);
        assert_eq!(packet.value, StreamMessage::Start(start()));
    }

    #[test]
    fn test_client_is_session_key() {
        assert_eq!(start().client_key(), "10.1.1.5:6000");
    }

    #[tokio::test]
    async fn test_fault_without_online_backup_fails() {
        let handler = ForwardingSessionHandler::new(start());
        let failed = crate::testing::backend(Some(false)).await;
        let offline = crate::testing::backend(Some(false)).await;

        let err = handler
            .handle_server_fault(&failed, &[offline])
            .await
            .unwrap_err();
        assert!(matches!(err, MedialbError::Failover(_)));
    }
}
