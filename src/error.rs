//! Error kinds exposed to callers.

use crate::oid::Oid;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

/// Classification of an error thrown by a stubbed method, preserved across
/// the wire so the caller can tell roughly what went wrong on the far side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorClass {
    Syntax,
    Type,
    Generic,
}

impl RemoteErrorClass {
    pub(crate) fn classify(name: &str) -> Self {
        match name {
            "SyntaxError" => Self::Syntax,
            "TypeError" => Self::Type,
            _ => Self::Generic,
        }
    }

    pub(crate) fn wire_name(self) -> &'static str {
        match self {
            Self::Syntax => "SyntaxError",
            Self::Type => "TypeError",
            Self::Generic => "Error",
        }
    }
}

/// An error raised by the remote stub's method, round-tripped verbatim.
#[derive(Debug, Clone, Default)]
pub struct RemoteError {
    pub class: Option<RemoteErrorClass>,
    pub message: Option<String>,
    pub stack: Option<String>,
    pub code: Option<String>,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let class = self
            .class
            .map(RemoteErrorClass::wire_name)
            .unwrap_or("Error");
        match &self.message {
            Some(msg) => write!(f, "{class}: {msg}"),
            None => write!(f, "{class}"),
        }
    }
}

/// Errors surfaced by the engine itself.
#[derive(Debug)]
pub enum Error {
    /// A method/getter/setter name that is not in the stub's snapshot.
    InvalidMethod(String),
    /// An oid reference that resolves to neither a stub nor a proxy, or a
    /// proxy call naming an oid the far side doesn't recognise.
    InvalidObject(Oid),
    /// `get`/`set` called with the wrong number of arguments.
    WrongArity { expected: usize, got: usize },
    /// The endpoint is closed; calls resolve to this without touching the
    /// transport.
    ClosedEndpoint,
    /// A received frame could not be interpreted (missing id, non-array
    /// params, unknown discriminant's required field, etc).
    MalformedFrame(String),
    /// A nested outbound call was attempted while marshalling another.
    ReentrantCall,
    /// An object carries an oid that isn't in the proxy registry (so it
    /// must be a proxy minted by a different endpoint).
    ForeignProxy(Oid),
    /// The remote stub's method raised an error.
    Remote(RemoteError),
    /// The transport itself failed (I/O, encoding, ...).
    Transport(Box<dyn std::error::Error + Send + Sync>),
    /// `Socket::serve` was called while an earlier call was still driving
    /// the same socket's read/write loops.
    AlreadyServing,
}

impl Error {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedFrame(msg.into())
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMethod(name) => write!(f, "invalid method `{name}`"),
            Self::InvalidObject(oid) => write!(f, "invalid object (ENXIO): {oid}"),
            Self::WrongArity { expected, got } => {
                write!(f, "wrong arity: expected {expected} argument(s), got {got}")
            }
            Self::ClosedEndpoint => write!(f, "endpoint is closed (ERR_SOCKET_CLOSED)"),
            Self::MalformedFrame(msg) => write!(f, "malformed frame: {msg}"),
            Self::ReentrantCall => write!(f, "re-entrant call while marshalling another"),
            Self::ForeignProxy(oid) => write!(f, "oid {oid} is not a proxy of this endpoint"),
            Self::Remote(err) => write!(f, "remote error: {err}"),
            Self::Transport(err) => write!(f, "transport error: {err}"),
            Self::AlreadyServing => write!(f, "serve() is already driving this socket"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

static_assertions::assert_impl_all!(Error: Send);
