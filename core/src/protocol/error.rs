//! Errors shared across both roles.

/// Errors that can occur while running either FS2 role.
#[derive(Debug)]
pub enum Fs2Error {
    /// Failed to start a role instance
    StartFailed(String),
    /// IO error
    Io(String),
    /// Network error talking to a peer or indexnode
    Network(String),
    /// A wire format could not be decoded
    Parse(String),
    /// The remote spoke the protocol incorrectly
    Protocol(String),
    /// Resource not found
    NotFound(String),
    /// Invalid input provided by the caller
    InvalidInput(String),
    /// The peer could not be contacted back on its claimed port
    Unreachable,
    /// A port outside the permitted client range
    PortOutOfRange(u16),
    /// The instance has been shut down
    Shutdown,
}

impl std::fmt::Display for Fs2Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Fs2Error::StartFailed(e) => write!(f, "failed to start: {}", e),
            Fs2Error::Io(e) => write!(f, "io error: {}", e),
            Fs2Error::Network(e) => write!(f, "network error: {}", e),
            Fs2Error::Parse(e) => write!(f, "parse error: {}", e),
            Fs2Error::Protocol(e) => write!(f, "protocol error: {}", e),
            Fs2Error::NotFound(e) => write!(f, "not found: {}", e),
            Fs2Error::InvalidInput(e) => write!(f, "invalid input: {}", e),
            Fs2Error::Unreachable => write!(f, "peer is uncontactable"),
            Fs2Error::PortOutOfRange(p) => write!(f, "port {} outside permitted range", p),
            Fs2Error::Shutdown => write!(f, "instance is shut down"),
        }
    }
}

impl std::error::Error for Fs2Error {}

impl From<std::io::Error> for Fs2Error {
    fn from(e: std::io::Error) -> Self {
        Fs2Error::Io(e.to_string())
    }
}
