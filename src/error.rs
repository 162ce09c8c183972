use crate::auth::AuthScheme;
use http::StatusCode;
use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

/// Which watchdog raised a [`TransportError::Timeout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    Read,
    Write,
    Response,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutKind::Read => write!(f, "read"),
            TimeoutKind::Write => write!(f, "write"),
            TimeoutKind::Response => write!(f, "response"),
        }
    }
}

/// The tunnel through the proxy could not be established.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} (auth scheme: {auth_scheme})")]
pub struct ProxyConnectError {
    message: String,
    auth_scheme: AuthScheme,
    status: Option<StatusCode>,
}

impl ProxyConnectError {
    pub fn new(message: impl Into<String>, auth_scheme: AuthScheme) -> Self {
        Self {
            message: message.into(),
            auth_scheme,
            status: None,
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn auth_scheme(&self) -> AuthScheme {
        self.auth_scheme
    }

    /// Status of the proxy's CONNECT response, if one was received.
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }
}

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    ProxyConnect(#[from] ProxyConnectError),

    #[error("{kind} timed out after {millis}ms")]
    Timeout { kind: TimeoutKind, millis: u64 },

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("TLS error: {0}")]
    Tls(#[source] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("URL parsing error: {0}")]
    Url(#[from] url::ParseError),

    #[error("Subscription cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn timeout(kind: TimeoutKind, millis: u64) -> Self {
        TransportError::Timeout { kind, millis }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }

    pub fn timeout_kind(&self) -> Option<TimeoutKind> {
        match self {
            TransportError::Timeout { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Surfaces a proxy failure hidden behind a TLS failure.
    ///
    /// When the TLS layer sits on top of the tunnel, a failed CONNECT shows up
    /// as a handshake error. Callers need the proxy cause, so a `Tls` error
    /// whose root cause is a [`ProxyConnectError`] is replaced by it. Any other
    /// error is returned untouched.
    pub fn unwrap_proxy_connect(self) -> Self {
        if let TransportError::Tls(ref err) = self {
            if let Some(proxy_err) = root_cause(err).downcast_ref::<ProxyConnectError>() {
                return TransportError::ProxyConnect(proxy_err.clone());
            }
        }
        self
    }
}

// io::Error hides its payload from `source()`, so walk into it explicitly.
fn root_cause<'a>(mut err: &'a (dyn StdError + 'static)) -> &'a (dyn StdError + 'static) {
    loop {
        let next = match err.downcast_ref::<std::io::Error>() {
            Some(io_err) => io_err
                .get_ref()
                .map(|inner| inner as &(dyn StdError + 'static)),
            None => err.source(),
        };
        match next {
            Some(next) => err = next,
            None => return err,
        }
    }
}
