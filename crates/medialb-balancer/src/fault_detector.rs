//! Periodic health probing of one remote endpoint.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use futures::future::BoxFuture;
use medialb_client::{Client, ClientConfig};
use medialb_common::protocol::{
    Control, MedialbError, Message, PingValue, Protocol, Result, CODE_PONG, PING_FRAGMENT,
};
use medialb_common::sync::Signal;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::circuit_breaker::BREAKER_REQUEST_TIMEOUT;

/// Fault detector configuration.
#[derive(Debug, Clone)]
pub struct FaultDetectorConfig {
    /// Pause between two probes of the loop
    pub interval: Duration,
}

impl Default for FaultDetectorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
        }
    }
}

/// Last known health of an endpoint.
#[derive(Debug, Clone)]
pub enum Health {
    /// No probe has completed yet
    Unknown,
    Online,
    /// The last probe failed with this error
    Offline(Arc<MedialbError>),
}

impl Health {
    pub fn is_online(&self) -> bool {
        matches!(self, Health::Online)
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Health::Unknown)
    }

    pub fn error(&self) -> Option<&Arc<MedialbError>> {
        match self {
            Health::Offline(err) => Some(err),
            _ => None,
        }
    }
}

/// Called with the subscriber key and the new health on each transition.
pub type FaultCallback = Arc<dyn Fn(&str, &Health) + Send + Sync>;

/// One health probe of a remote endpoint.
pub trait Probe: Send + Sync + 'static {
    fn probe(&self) -> BoxFuture<'_, Result<()>>;
}

impl<F, Fut> Probe for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn probe(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self())
    }
}

/// Tracks whether an endpoint is online by probing it.
///
/// Health starts [`Health::Unknown`] and moves to Online or Offline with the
/// first probe; it never returns to Unknown. Callbacks fire only on a change
/// between two known states, synchronously on the probing task and once per
/// transition. Closing the detector counts as an outage: subscribers get a
/// final offline notification unless they already saw the endpoint offline.
pub struct FaultDetector {
    endpoint: String,
    probe: Box<dyn Probe>,
    config: FaultDetectorConfig,
    health: StdMutex<Health>,
    callbacks: StdMutex<Vec<(FaultCallback, String)>>,
    checking: tokio::sync::Mutex<()>,
    stop: Signal,
    task: StdMutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl FaultDetector {
    pub fn new(
        endpoint: impl Into<String>,
        probe: impl Probe,
        config: FaultDetectorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoint: endpoint.into(),
            probe: Box::new(probe),
            config,
            health: StdMutex::new(Health::Unknown),
            callbacks: StdMutex::new(Vec::new()),
            checking: tokio::sync::Mutex::new(()),
            stop: Signal::new(),
            task: StdMutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn health(&self) -> Health {
        lock(&self.health).clone()
    }

    pub fn online(&self) -> bool {
        self.health().is_online()
    }

    /// Error of the last failed probe, if the endpoint is offline
    pub fn error(&self) -> Option<Arc<MedialbError>> {
        self.health().error().cloned()
    }

    /// Subscribes to health transitions; `key` is handed back on each call.
    pub fn add_callback(&self, callback: FaultCallback, key: impl Into<String>) {
        lock(&self.callbacks).push((callback, key.into()));
    }

    /// Runs one probe of the detector's own probe and records the outcome.
    pub async fn check(&self) {
        self.perform_check(self.probe.probe()).await;
    }

    /// Runs `probe` and records its outcome, firing callbacks on a transition.
    pub async fn perform_check<F>(&self, probe: F)
    where
        F: Future<Output = Result<()>>,
    {
        let _checking = self.checking.lock().await;
        let result = probe.await;
        self.record(result, false);
    }

    fn record(&self, result: Result<()>, terminal: bool) {
        let next = match result {
            Ok(()) => Health::Online,
            Err(err) => Health::Offline(Arc::new(err)),
        };
        let previous = std::mem::replace(&mut *lock(&self.health), next.clone());

        let changed = match previous {
            Health::Unknown => terminal,
            _ => previous.is_online() != next.is_online(),
        };
        if !changed {
            if !previous.is_known() {
                debug!(
                    "First probe of {}: {}",
                    self.endpoint,
                    if next.is_online() { "online" } else { "offline" }
                );
            }
            return;
        }

        match &next {
            Health::Offline(err) => warn!("{} went offline: {}", self.endpoint, err),
            _ => info!("{} is back online", self.endpoint),
        }

        let callbacks = lock(&self.callbacks).clone();
        for (callback, key) in callbacks.iter() {
            callback(key, &next);
        }
    }

    /// Starts probing on a task of its own every `interval` until closed.
    ///
    /// The first probe runs immediately. Calling this again, or after close,
    /// does nothing.
    pub fn loop_check(self: &Arc<Self>) {
        let mut task = lock(&self.task);
        if task.is_some() || self.stop.is_enabled() {
            return;
        }
        *task = Some(tokio::spawn(self.clone().run()));
    }

    async fn run(self: Arc<Self>) {
        debug!(
            "Probing {} every {:?}",
            self.endpoint, self.config.interval
        );
        while !self.stop.is_enabled() {
            self.check().await;
            tokio::select! {
                _ = self.stop.wait() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
        self.go_offline();
    }

    fn go_offline(&self) {
        self.record(
            Err(MedialbError::Closed(format!(
                "fault detector for {}",
                self.endpoint
            ))),
            true,
        );
    }

    pub fn is_closed(&self) -> bool {
        self.stop.is_enabled()
    }

    /// Stops the probe loop and waits for it to exit.
    pub async fn close(&self) -> Result<()> {
        let first = self.stop.enable();
        let task = lock(&self.task).take();
        match task {
            Some(task) => {
                if let Err(e) = task.await {
                    error!("Fault detector task for {} failed: {}", self.endpoint, e);
                    return Err(MedialbError::Transport(format!(
                        "fault detector task for {} failed: {}",
                        self.endpoint, e
                    )));
                }
            }
            None if first => self.go_offline(),
            None => {}
        }
        Ok(())
    }
}

impl std::fmt::Debug for FaultDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultDetector")
            .field("endpoint", &self.endpoint)
            .field("health", &self.health())
            .finish()
    }
}

/// Probes an endpoint with a Ping exchange; succeeds on a matching Pong.
pub struct PingProbe<M> {
    client: Client<M>,
    next: AtomicU64,
}

impl<M: Message> PingProbe<M> {
    /// Creates a probe for `endpoint`.
    ///
    /// # Errors
    ///
    /// Fails with `MedialbError::MissingFragment` if the protocol cannot
    /// carry pings.
    pub async fn new(protocol: Arc<Protocol<M>>, endpoint: &str) -> Result<Self> {
        protocol.check_includes_fragment(PING_FRAGMENT)?;
        let client = Client::dial(
            protocol,
            endpoint,
            ClientConfig {
                timeout: BREAKER_REQUEST_TIMEOUT,
            },
        )
        .await?;

        Ok(Self {
            client,
            next: AtomicU64::new(0),
        })
    }

    pub async fn ping(&self) -> Result<()> {
        let ping = PingValue::new(self.next.fetch_add(1, Ordering::Relaxed));
        // Pongs to earlier, timed out pings are skipped
        let reply = self
            .client
            .send_request_matching(M::from(Control::Ping(ping)), |reply| {
                match reply.value.as_control() {
                    Some(Control::Pong(pong)) => pong.check(&ping),
                    _ => true,
                }
            })
            .await?;
        Client::check_error(&reply, CODE_PONG)?;

        match reply.value.as_control() {
            Some(Control::Pong(pong)) if pong.check(&ping) => Ok(()),
            _ => Err(MedialbError::Decode(format!(
                "pong from {:?} does not answer ping {}",
                reply.source, ping.value
            ))),
        }
    }
}

impl<M: Message> Probe for PingProbe<M> {
    fn probe(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.ping())
    }
}

/// Creates the fault detector watching a backend endpoint.
pub trait FaultDetectorFactory: Send + Sync + 'static {
    fn new_detector<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, Result<Arc<FaultDetector>>>;
}

/// Builds ping-probing detectors for one protocol.
pub struct PingDetectorFactory<M> {
    protocol: Arc<Protocol<M>>,
    config: FaultDetectorConfig,
}

impl<M: Message> PingDetectorFactory<M> {
    pub fn new(protocol: Arc<Protocol<M>>, config: FaultDetectorConfig) -> Result<Self> {
        protocol.check_includes_fragment(PING_FRAGMENT)?;
        Ok(Self { protocol, config })
    }
}

impl<M: Message> FaultDetectorFactory for PingDetectorFactory<M> {
    fn new_detector<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, Result<Arc<FaultDetector>>> {
        Box::pin(async move {
            let probe = PingProbe::new(self.protocol.clone(), endpoint).await?;
            Ok(FaultDetector::new(endpoint, probe, self.config.clone()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{stream_fragment, stream_protocol, StreamMessage};
    use medialb_common::protocol::{Request, CODE_PING};
    use medialb_server::Server;
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    fn counting_callback(count: Arc<AtomicUsize>) -> FaultCallback {
        Arc::new(move |_key: &str, _health: &Health| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn never_probed() -> Arc<FaultDetector> {
        FaultDetector::new(
            "test",
            crate::testing::healthy,
            FaultDetectorConfig::default(),
        )
    }

    fn failure() -> Result<()> {
        Err(MedialbError::Timeout(200))
    }

    #[tokio::test]
    async fn test_first_result_fires_no_callback() {
        for outcome in [true, false] {
            let detector = never_probed();
            let count = Arc::new(AtomicUsize::new(0));
            detector.add_callback(counting_callback(count.clone()), "b1");

            assert!(!detector.health().is_known());
            detector
                .perform_check(async move { if outcome { Ok(()) } else { failure() } })
                .await;

            assert_eq!(detector.online(), outcome);
            assert_eq!(count.load(Ordering::SeqCst), 0);
        }
    }

    #[tokio::test]
    async fn test_transitions_fire_each_callback_once() {
        let detector = never_probed();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        detector.add_callback(counting_callback(first.clone()), "b1");
        detector.add_callback(counting_callback(second.clone()), "b1");

        detector.perform_check(async { Ok(()) }).await;
        detector.perform_check(async { failure() }).await;
        assert!(!detector.online());
        assert!(detector.error().unwrap().is_timeout());
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        // Same outcome again, no transition
        detector.perform_check(async { failure() }).await;
        assert_eq!(first.load(Ordering::SeqCst), 1);

        detector.perform_check(async { Ok(()) }).await;
        assert!(detector.online());
        assert_eq!(first.load(Ordering::SeqCst), 2);
        assert_eq!(second.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_callback_receives_key_and_health() {
        let detector = never_probed();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        detector.add_callback(
            Arc::new(move |key: &str, health: &Health| {
                lock(&sink).push((key.to_string(), health.is_online()));
            }),
            "10.0.0.7:5000",
        );

        detector.perform_check(async { Ok(()) }).await;
        detector.perform_check(async { failure() }).await;

        assert_eq!(
            *lock(&seen),
            vec![("10.0.0.7:5000".to_string(), false)]
        );
    }

    #[tokio::test]
    async fn test_loop_probes_and_close_reports_offline() {
        let healthy = Arc::new(AtomicBool::new(true));
        let probes = Arc::new(AtomicUsize::new(0));
        let detector = {
            let healthy = healthy.clone();
            let probes = probes.clone();
            FaultDetector::new(
                "looped",
                move || {
                    let up = healthy.load(Ordering::SeqCst);
                    probes.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if up {
                            Ok(())
                        } else {
                            Err(MedialbError::Timeout(200))
                        }
                    }
                },
                FaultDetectorConfig {
                    interval: Duration::from_millis(10),
                },
            )
        };
        let transitions = Arc::new(AtomicUsize::new(0));
        detector.add_callback(counting_callback(transitions.clone()), "looped");

        detector.loop_check();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(detector.online());
        assert!(probes.load(Ordering::SeqCst) >= 2);
        assert_eq!(transitions.load(Ordering::SeqCst), 0);

        detector.close().await.unwrap();
        assert!(detector.is_closed());
        assert!(!detector.online());
        assert!(matches!(
            detector.error().as_deref(),
            Some(MedialbError::Closed(_))
        ));
        assert_eq!(transitions.load(Ordering::SeqCst), 1);

        // Closing twice notifies once
        detector.close().await.unwrap();
        assert_eq!(transitions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_close_without_loop_still_notifies() {
        let detector = never_probed();
        let count = Arc::new(AtomicUsize::new(0));
        detector.add_callback(counting_callback(count.clone()), "b1");

        detector.close().await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // A closed detector does not start probing
        detector.loop_check();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!detector.online());
    }

    #[tokio::test]
    async fn test_ping_probe_requires_ping_fragment() {
        let bare = Arc::new(Protocol::<StreamMessage>::new("bare", vec![stream_fragment()]).unwrap());
        let result = PingProbe::new(bare.clone(), "127.0.0.1:9").await;
        assert!(matches!(
            result.map(|_| ()),
            Err(MedialbError::MissingFragment { .. })
        ));
        assert!(PingDetectorFactory::new(bare, FaultDetectorConfig::default()).is_err());
    }

    #[tokio::test]
    async fn test_ping_detector_against_live_server() {
        let protocol = Arc::new(stream_protocol().unwrap());
        let server = Server::builder(protocol.clone())
            .bind("127.0.0.1:0")
            .await
            .unwrap();
        let endpoint = server.local_addr().to_string();

        let factory = PingDetectorFactory::new(protocol, FaultDetectorConfig::default()).unwrap();
        let detector = factory.new_detector(&endpoint).await.unwrap();
        assert_eq!(detector.endpoint(), endpoint);

        detector.check().await;
        assert!(detector.online());

        server.stop().await;
        detector.check().await;
        assert!(!detector.online());
    }

    #[tokio::test]
    async fn test_late_pong_does_not_keep_backend_offline() {
        let protocol = Arc::new(stream_protocol().unwrap());
        let first = Arc::new(AtomicBool::new(true));
        let server = Server::builder(protocol.clone())
            .handle(CODE_PING, move |request: Request<StreamMessage>| {
                let slow = first.swap(false, Ordering::SeqCst);
                async move {
                    // Only the first pong arrives after the breaker timeout
                    if slow {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                    }
                    match request.packet.value.as_control() {
                        Some(Control::Ping(ping)) => {
                            let pong = StreamMessage::from(Control::Pong(ping.pong()));
                            request.responder.reply(pong).await
                        }
                        _ => Ok(()),
                    }
                }
            })
            .bind("127.0.0.1:0")
            .await
            .unwrap();
        let endpoint = server.local_addr().to_string();

        let factory = PingDetectorFactory::new(protocol, FaultDetectorConfig::default()).unwrap();
        let detector = factory.new_detector(&endpoint).await.unwrap();

        detector.check().await;
        assert!(!detector.online());
        assert!(detector.error().unwrap().is_timeout());

        for _ in 0..5 {
            detector.check().await;
            assert!(detector.online(), "error: {:?}", detector.error());
        }

        server.stop().await;
    }
}
