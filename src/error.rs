use crate::models::trace::RequestTrace;
use std::error::Error as StdError;
use std::fmt;

pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Errors surfaced by the pool, the transports and the request issuer.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("request to {url} failed ({kind}): {source}")]
    Network {
        url: String,
        kind: NetworkFailure,
        #[source]
        source: BoxError,
    },

    #[error("reading response body from {url} failed: {source}")]
    BodyRead {
        url: String,
        trace: RequestTrace,
        #[source]
        source: BoxError,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProbeError {
    pub fn config(message: impl Into<String>) -> Self {
        ProbeError::Config(message.into())
    }

    /// Trace captured before the failure, if the connection got that far.
    pub fn trace(&self) -> Option<&RequestTrace> {
        match self {
            ProbeError::BodyRead { trace, .. } => Some(trace),
            _ => None,
        }
    }
}

/// Coarse classification of a failed dial/send/receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkFailure {
    Refused,
    Timeout,
    Tls,
    Proxy,
    Connect,
    Transport,
}

impl fmt::Display for NetworkFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            NetworkFailure::Refused => "connection refused",
            NetworkFailure::Timeout => "timed out",
            NetworkFailure::Tls => "tls",
            NetworkFailure::Proxy => "proxy",
            NetworkFailure::Connect => "connect",
            NetworkFailure::Transport => "transport",
        };
        f.write_str(label)
    }
}
