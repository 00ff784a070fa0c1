use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// Errors surfaced to RPC callers.
///
/// `Timeout` is the only kind the retry loop re-enters on; everything else
/// propagates from the attempt that produced it.
#[derive(Clone, Debug, PartialEq)]
pub enum RpcError {
    /// Malformed or truncated frame, or an undecodable payload.
    /// Fatal to the connection that produced it.
    Framing(String),
    /// Local serialization failure, or parameters rejected by the
    /// declared-type guard before encoding.
    Encode(String),
    /// The per-attempt timeout elapsed before a response arrived.
    Timeout,
    /// Connect/read/write failure other than a timeout.
    Connection(String),
    /// Discovery found no live address node for the service key.
    ServiceUnavailable(String),
    /// Structured error body returned by the remote dispatcher.
    Remote(RemoteError),
    /// The retry budget ran out without any response.
    NoResponse,
}

impl RpcError {
    #[inline(always)]
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    #[inline]
    pub fn framing<S: fmt::Display>(msg: S) -> Self {
        Self::Framing(msg.to_string())
    }

    #[inline]
    pub fn encode<S: fmt::Display>(msg: S) -> Self {
        Self::Encode(msg.to_string())
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Framing(s) => write!(f, "framing error: {}", s),
            Self::Encode(s) => write!(f, "encode error: {}", s),
            Self::Timeout => write!(f, "timeout"),
            Self::Connection(s) => write!(f, "connection error: {}", s),
            Self::ServiceUnavailable(key) => write!(f, "service unavailable: {}", key),
            Self::Remote(e) => write!(f, "remote error: {}", e),
            Self::NoResponse => write!(f, "no response after retries"),
        }
    }
}

impl std::error::Error for RpcError {}

impl From<RemoteError> for RpcError {
    #[inline]
    fn from(e: RemoteError) -> Self {
        Self::Remote(e)
    }
}

/// Error body carried inside a response. The dispatcher converts every
/// lookup or invocation failure into one of these instead of dropping the
/// connection, so the caller always gets an answer for its request id.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    #[inline]
    pub fn new<S: Into<String>>(kind: RemoteErrorKind, message: S) -> Self {
        Self { kind, message: message.into() }
    }

    #[inline]
    pub fn app<S: Into<String>>(message: S) -> Self {
        Self::new(RemoteErrorKind::Application, message)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for RemoteError {}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// No service registered under the requested key.
    ServiceNotFound,
    /// The service has no method with the requested name and signature.
    MethodNotFound,
    /// Parameters failed arity or type checks against the registered
    /// signature.
    BadParameters,
    /// The service implementation returned an error (or panicked).
    Application,
}

impl RemoteErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceNotFound => "service_not_found",
            Self::MethodNotFound => "method_not_found",
            Self::BadParameters => "bad_parameters",
            Self::Application => "application_error",
        }
    }
}
