use std::sync::Arc;
use std::time::Duration;

use medialb_client::Client;
use medialb_common::protocol::{collect_errors, MedialbError, Message, Packet, Result};

use crate::fault_detector::{FaultDetector, Health};

/// Request timeout of every breaker-wrapped client and of ping probes.
pub const BREAKER_REQUEST_TIMEOUT: Duration = Duration::from_millis(200);

/// Gates requests to one endpoint on its fault detector.
///
/// While the detector reports the endpoint offline, calls fail at once with
/// `MedialbError::Offline` carrying the last probe error and nothing is sent.
/// Otherwise the call goes through the wrapped client unchanged. An endpoint
/// whose first probe has not completed yet is let through.
pub struct CircuitBreaker<M> {
    client: Client<M>,
    detector: Arc<FaultDetector>,
}

impl<M: Message> CircuitBreaker<M> {
    /// Wraps `client`, overriding its timeout with [`BREAKER_REQUEST_TIMEOUT`].
    pub fn new(mut client: Client<M>, detector: Arc<FaultDetector>) -> Self {
        client.set_timeout(BREAKER_REQUEST_TIMEOUT);
        Self { client, detector }
    }

    pub fn online(&self) -> bool {
        self.detector.online()
    }

    pub fn error(&self) -> Option<Arc<MedialbError>> {
        self.detector.error()
    }

    pub fn detector(&self) -> &Arc<FaultDetector> {
        &self.detector
    }

    /// The wrapped client, bypassing the health gate
    pub fn client(&self) -> &Client<M> {
        &self.client
    }

    fn gate(&self) -> Result<()> {
        match self.detector.health() {
            Health::Offline(cause) => Err(MedialbError::Offline {
                endpoint: self.detector.endpoint().to_string(),
                cause,
            }),
            _ => Ok(()),
        }
    }

    pub async fn send_packet(&self, value: M) -> Result<()> {
        self.gate()?;
        self.client.send_packet(value).await
    }

    pub async fn send_request(&self, value: M) -> Result<Packet<M>> {
        self.gate()?;
        self.client.send_request(value).await
    }

    pub async fn request_ok(&self, value: M) -> Result<()> {
        self.gate()?;
        self.client.request_ok(value).await
    }

    /// Starts the detector's probe loop.
    pub fn start(&self) {
        self.detector.loop_check();
    }

    /// Closes the client and the detector, aggregating both errors.
    pub async fn close(&self) -> Result<()> {
        let client = self.client.close();
        let detector = self.detector.close().await;
        collect_errors([client, detector])
    }
}
