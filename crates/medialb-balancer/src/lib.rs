//! Fault detection, circuit breaking and load-aware session failover for
//! media backends.
//!
//! A [`Balancer`] keeps a pool of [`BackendServer`]s, each probed by a
//! [`FaultDetector`] behind a [`CircuitBreaker`]. Client sessions are placed
//! on the least loaded online backend with standby backups, and moved to a
//! backup when their backend goes offline. [`BalancerServer`] puts the
//! balancer behind the stream protocol, with a [`PluginChain`] per client.

pub mod backend;
pub mod balancer;
pub mod balancer_server;
pub mod circuit_breaker;
pub mod fault_detector;
pub mod load_balancer;
pub mod plugin;
pub mod session;
pub mod stream;

#[cfg(test)]
mod testing;

pub use backend::BackendServer;
pub use balancer::{Balancer, BalancerConfig, FailoverReport};
pub use balancer_server::BalancerServer;
pub use circuit_breaker::{CircuitBreaker, BREAKER_REQUEST_TIMEOUT};
pub use fault_detector::{
    FaultCallback, FaultDetector, FaultDetectorConfig, FaultDetectorFactory, Health,
    PingDetectorFactory, PingProbe, Probe,
};
pub use load_balancer::{LoadBalancer, Selection};
pub use plugin::{BalancingPlugin, ChainSession, PluginChain, PluginSession, SessionPlugin};
pub use session::{BalancingSession, BalancingSessionHandler, SessionParameter};
pub use stream::{
    stream_fragment, stream_protocol, ForwardingSessionHandler, RedirectStream, StartStream,
    StopStream, StreamMessage,
};
