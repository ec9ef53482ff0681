use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;

use super::Code;

#[derive(Error, Debug)]
pub enum MedialbError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timeout after {0}ms")]
    Timeout(u64),

    #[error("Unregistered code {code} in protocol {protocol}")]
    UnregisteredCode { protocol: String, code: Code },

    #[error("Failed to decode packet: {0}")]
    Decode(String),

    #[error("Code {code} of fragment '{fragment}' is in the reserved range")]
    ReservedCode { code: Code, fragment: String },

    #[error("Duplicate code {code}: claimed by fragments '{first}' and '{second}'")]
    DuplicateCode {
        code: Code,
        first: String,
        second: String,
    },

    #[error("Protocol {protocol} does not include fragment '{fragment}'")]
    MissingFragment { protocol: String, fragment: String },

    #[error("No server address set")]
    NoServerAddress,

    #[error("{protocol} request to {addr} failed: {source}")]
    Request {
        protocol: String,
        addr: SocketAddr,
        #[source]
        source: Box<MedialbError>,
    },

    #[error("Remote error: {0}")]
    Remote(String),

    #[error("Unexpected reply code {got} (expected {expected}): {payload}")]
    UnexpectedCode {
        expected: Code,
        got: Code,
        payload: String,
    },

    #[error("{endpoint} is offline: {cause}")]
    Offline {
        endpoint: String,
        cause: Arc<MedialbError>,
    },

    #[error("No server available")]
    NoServerAvailable,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session already exists: {0}")]
    SessionExists(String),

    #[error("Backend already added: {0}")]
    BackendExists(String),

    #[error("Failover failed: {0}")]
    Failover(String),

    #[error("Closed: {0}")]
    Closed(String),

    #[error("Multiple errors: {}", join_errors(.0))]
    Multiple(Vec<MedialbError>),
}

impl MedialbError {
    /// Whether this error is a timeout, looking through request wrappers.
    pub fn is_timeout(&self) -> bool {
        match self {
            MedialbError::Timeout(_) => true,
            MedialbError::Request { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Whether this error was raised by a circuit breaker rejecting a call.
    pub fn is_offline(&self) -> bool {
        matches!(self, MedialbError::Offline { .. })
    }

    /// Tags an error with the protocol and target address of the failed request.
    pub fn request(protocol: &str, addr: SocketAddr, source: MedialbError) -> Self {
        MedialbError::Request {
            protocol: protocol.to_string(),
            addr,
            source: Box::new(source),
        }
    }
}

impl From<std::net::AddrParseError> for MedialbError {
    fn from(err: std::net::AddrParseError) -> Self {
        MedialbError::Transport(err.to_string())
    }
}

fn join_errors(errors: &[MedialbError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Folds a list of results into one, aggregating every error.
pub fn collect_errors(results: impl IntoIterator<Item = Result<()>>) -> Result<()> {
    let mut errors: Vec<MedialbError> = results.into_iter().filter_map(|r| r.err()).collect();
    match errors.len() {
        0 => Ok(()),
        1 => Err(errors.remove(0)),
        _ => Err(MedialbError::Multiple(errors)),
    }
}

pub type Result<T> = std::result::Result<T, MedialbError>;
