//! Scripted backends for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::BoxFuture;
use medialb_common::protocol::{MedialbError, Protocol, Result};

use crate::backend::BackendServer;
use crate::fault_detector::{FaultDetector, FaultDetectorConfig, FaultDetectorFactory};
use crate::stream::{stream_protocol, StreamMessage};

static NEXT_PORT: AtomicU16 = AtomicU16::new(41000);

/// A loopback endpoint nothing listens on
pub(crate) fn next_endpoint() -> String {
    format!("127.0.0.1:{}", NEXT_PORT.fetch_add(1, Ordering::Relaxed))
}

/// A probe that always succeeds
pub(crate) async fn healthy() -> Result<()> {
    Ok(())
}

pub(crate) fn protocol() -> Arc<Protocol<StreamMessage>> {
    Arc::new(stream_protocol().unwrap())
}

/// Detectors whose probe reads a per-endpoint flag, healthy by default.
pub(crate) struct ScriptedFactory {
    flags: StdMutex<HashMap<String, Arc<AtomicBool>>>,
    config: FaultDetectorConfig,
}

impl ScriptedFactory {
    /// Detectors built by this factory loop with a long interval, so tests
    /// drive transitions with explicit checks.
    pub(crate) fn new() -> Self {
        Self {
            flags: StdMutex::new(HashMap::new()),
            config: FaultDetectorConfig {
                interval: Duration::from_secs(3600),
            },
        }
    }

    fn flag(&self, endpoint: &str) -> Arc<AtomicBool> {
        self.flags
            .lock()
            .unwrap()
            .entry(endpoint.to_string())
            .or_insert_with(|| Arc::new(AtomicBool::new(true)))
            .clone()
    }

    pub(crate) fn set_online(&self, endpoint: &str, online: bool) {
        self.flag(endpoint).store(online, Ordering::SeqCst);
    }
}

impl FaultDetectorFactory for ScriptedFactory {
    fn new_detector<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, Result<Arc<FaultDetector>>> {
        let flag = self.flag(endpoint);
        let name = endpoint.to_string();
        Box::pin(async move {
            Ok(FaultDetector::new(
                endpoint,
                move || {
                    let up = flag.load(Ordering::SeqCst);
                    let name = name.clone();
                    async move {
                        if up {
                            Ok(())
                        } else {
                            Err(MedialbError::Transport(format!("{} unreachable", name)))
                        }
                    }
                },
                self.config.clone(),
            ))
        })
    }
}

/// A backend on a fresh endpoint; `online` is the result of a first probe,
/// `None` leaves it unprobed.
pub(crate) async fn backend(online: Option<bool>) -> Arc<BackendServer<StreamMessage>> {
    let endpoint = next_endpoint();
    let backend = BackendServer::connect(protocol(), &endpoint, &ScriptedFactory::new())
        .await
        .unwrap();
    if let Some(up) = online {
        backend
            .breaker()
            .detector()
            .perform_check(async move {
                if up {
                    Ok(())
                } else {
                    Err(MedialbError::Timeout(200))
                }
            })
            .await;
    }
    Arc::new(backend)
}
