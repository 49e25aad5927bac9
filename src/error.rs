//! Error types and handling for the tunnel bridge
//!
//! Every failure inside the crate is a [`BridgeError`]. Values that cross
//! the host boundary are [`PlatformError`]s, built only through
//! `From<BridgeError>` so that each error lands on exactly one
//! [`ErrorCode`].

use std::fmt;
use std::io;

use thiserror::Error;

/// Main error type for bridge operations
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Malformed or incomplete client configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The proxy rejected the supplied credentials
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The proxy (or a destination behind it) could not be reached
    #[error("Network error: {0}")]
    Network(String),

    /// The proxy answered with something that is not valid protocol
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A bounded operation ran out of time
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The host supplied an unusable TUN writer
    #[error("Invalid TUN writer: {0}")]
    TunWriter(String),

    /// The tunnel is closing or closed
    #[error("Tunnel closed: {0}")]
    TunnelClosed(String),

    /// An IP packet could not be parsed or built
    #[error("Packet error: {0}")]
    Packet(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// The host-visible error kind for this error
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::Config(_) => ErrorCode::InvalidConfig,
            BridgeError::Authentication(_) => ErrorCode::AuthenticationFailed,
            BridgeError::Network(_) | BridgeError::Protocol(_) => ErrorCode::NetworkUnreachable,
            BridgeError::Timeout(_) => ErrorCode::Timeout,
            BridgeError::TunWriter(_) => ErrorCode::InvalidTunWriter,
            BridgeError::TunnelClosed(_) => ErrorCode::TunnelClosed,
            BridgeError::Io(err) => classify_io(err),
            BridgeError::Packet(_) | BridgeError::Internal(_) => ErrorCode::InternalFault,
        }
    }
}

/// Maps an IO error onto the error taxonomy.
///
/// Refused, reset and unreachable connections and failed name lookups are
/// `NetworkUnreachable`; only an expired deadline is a `Timeout`.
#[must_use]
pub fn classify_io(err: &io::Error) -> ErrorCode {
    match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ErrorCode::Timeout,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::AddrNotAvailable
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::UnexpectedEof
        | io::ErrorKind::NotFound
        | io::ErrorKind::NetworkUnreachable
        | io::ErrorKind::HostUnreachable
        | io::ErrorKind::NetworkDown => ErrorCode::NetworkUnreachable,
        _ => ErrorCode::InternalFault,
    }
}

/// Helper trait for converting errors to BridgeError
pub trait IntoBridgeError<T> {
    fn into_bridge_error(self, context: &str) -> Result<T>;
}

impl<T, E> IntoBridgeError<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn into_bridge_error(self, context: &str) -> Result<T> {
        self.map_err(|e| BridgeError::Internal(format!("{context}: {e}")))
    }
}

impl From<toml::de::Error> for BridgeError {
    fn from(err: toml::de::Error) -> Self {
        BridgeError::Config(format!("TOML parsing error: {err}"))
    }
}

impl From<url::ParseError> for BridgeError {
    fn from(err: url::ParseError) -> Self {
        BridgeError::Config(format!("Invalid proxy URL: {err}"))
    }
}

impl From<tokio::time::error::Elapsed> for BridgeError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        BridgeError::Timeout("deadline elapsed".to_string())
    }
}

impl From<hickory_proto::error::ProtoError> for BridgeError {
    fn from(err: hickory_proto::error::ProtoError) -> Self {
        BridgeError::Protocol(format!("DNS message error: {err}"))
    }
}

/// Host-visible error kinds.
///
/// Host code branches on these, never on the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    InvalidConfig,
    AuthenticationFailed,
    NetworkUnreachable,
    Timeout,
    InvalidTunWriter,
    TunnelClosed,
    InternalFault,
}

impl ErrorCode {
    /// Namespaced wire form of the code
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidConfig => "ERR_CONFIG.INVALID",
            ErrorCode::AuthenticationFailed => "ERR_AUTH.FAILED",
            ErrorCode::NetworkUnreachable => "ERR_NETWORK.UNREACHABLE",
            ErrorCode::Timeout => "ERR_NETWORK.TIMEOUT",
            ErrorCode::InvalidTunWriter => "ERR_TUNNEL.INVALID_TUN_WRITER",
            ErrorCode::TunnelClosed => "ERR_TUNNEL.CLOSED",
            ErrorCode::InternalFault => "ERR_INTERNAL.FAULT",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error handed to the host: a code plus a human message.
///
/// Immutable once built. Absence of an error is `None`, never an empty
/// `PlatformError`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformError {
    code: ErrorCode,
    message: String,
}

impl PlatformError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for PlatformError {}

impl From<BridgeError> for PlatformError {
    fn from(err: BridgeError) -> Self {
        let code = err.code();
        if code == ErrorCode::InternalFault {
            log::error!("internal fault reported to host: {err:?}");
        }
        PlatformError::new(code, err.to_string())
    }
}

impl From<&BridgeError> for PlatformError {
    fn from(err: &BridgeError) -> Self {
        let code = err.code();
        if code == ErrorCode::InternalFault {
            log::error!("internal fault reported to host: {err:?}");
        }
        PlatformError::new(code, err.to_string())
    }
}
