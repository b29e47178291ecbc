use std::{error, fmt, io};

use arcstr::ArcStr;

/// An enum of all error kinds.
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// The discovery endpoint could not be queried or its answer was unusable.
    DiscoveryError,
    /// The wait queue of a node's connection pool is full.
    PoolExhausted,
    /// An operation did not finish before its deadline.
    Timeout,
    /// This kind is returned if the error is one that is not native to the
    /// system.  This is usually the case if the cause is another error, such
    /// as a broken socket.
    IoError,
    /// The parser failed to parse the server response.
    ParseError,
    /// No node could serve the request, either because the ring is empty or
    /// because every attempt failed with a transport error.
    NodeUnavailable,
    /// The server answered with `SERVER_ERROR`.
    ServerError,
    /// The request was rejected before it was sent, or the server answered
    /// with `CLIENT_ERROR`/`ERROR`.
    ClientError,
    /// An error that was caused because the parameters to the client were wrong.
    InvalidClientConfig,
}

/// Represents a cache client error.
///
/// For the most part you should be using the Error trait to interact with this
/// rather than the actual struct.
pub struct CacheError {
    repr: ErrorRepr,
}

#[derive(Debug)]
enum ErrorRepr {
    WithDescription(ErrorKind, &'static str),
    WithDescriptionAndDetail(ErrorKind, &'static str, ArcStr),
    IoError(io::Error),
}

/// Library generic result type.
pub type CacheResult<T> = Result<T, CacheError>;

impl PartialEq for CacheError {
    fn eq(&self, other: &CacheError) -> bool {
        match (&self.repr, &other.repr) {
            (&ErrorRepr::WithDescription(kind_a, _), &ErrorRepr::WithDescription(kind_b, _)) => {
                kind_a == kind_b
            }
            (
                &ErrorRepr::WithDescriptionAndDetail(kind_a, _, _),
                &ErrorRepr::WithDescriptionAndDetail(kind_b, _, _),
            ) => kind_a == kind_b,
            (ErrorRepr::IoError(a), ErrorRepr::IoError(b)) => a.kind() == b.kind(),
            _ => false,
        }
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> CacheError {
        CacheError {
            repr: ErrorRepr::IoError(err),
        }
    }
}

impl From<(ErrorKind, &'static str)> for CacheError {
    fn from((kind, desc): (ErrorKind, &'static str)) -> CacheError {
        CacheError {
            repr: ErrorRepr::WithDescription(kind, desc),
        }
    }
}

impl From<(ErrorKind, &'static str, String)> for CacheError {
    fn from((kind, desc, detail): (ErrorKind, &'static str, String)) -> CacheError {
        CacheError {
            repr: ErrorRepr::WithDescriptionAndDetail(kind, desc, detail.into()),
        }
    }
}

impl From<tokio::time::error::Elapsed> for CacheError {
    fn from(_: tokio::time::error::Elapsed) -> CacheError {
        CacheError::from((ErrorKind::Timeout, "Operation timed out"))
    }
}

impl error::Error for CacheError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match &self.repr {
            ErrorRepr::IoError(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Debug for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match &self.repr {
            ErrorRepr::WithDescription(kind, desc) => {
                desc.fmt(f)?;
                f.write_str(" - ")?;
                fmt::Debug::fmt(&kind, f)
            }
            ErrorRepr::WithDescriptionAndDetail(kind, desc, detail) => {
                desc.fmt(f)?;
                f.write_str(" - ")?;
                fmt::Debug::fmt(&kind, f)?;
                f.write_str(": ")?;
                detail.fmt(f)
            }
            ErrorRepr::IoError(err) => err.fmt(f),
        }
    }
}

/// What method should be used if retrying this request.
#[non_exhaustive]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RetryMethod {
    /// Drop the connection and try again, possibly against another node.
    Reconnect,
    /// Don't retry, this is a permanent error.
    NoRetry,
}

impl CacheError {
    /// Returns the kind of the error.
    pub fn kind(&self) -> ErrorKind {
        match &self.repr {
            ErrorRepr::WithDescription(kind, _)
            | ErrorRepr::WithDescriptionAndDetail(kind, _, _) => *kind,
            ErrorRepr::IoError(_) => ErrorKind::IoError,
        }
    }

    /// Returns the error detail.
    pub fn detail(&self) -> Option<&str> {
        match &self.repr {
            ErrorRepr::WithDescriptionAndDetail(_, _, detail) => Some(detail.as_str()),
            _ => None,
        }
    }

    /// Returns the name of the error category for display purposes.
    pub fn category(&self) -> &str {
        match self.kind() {
            ErrorKind::DiscoveryError => "discovery error",
            ErrorKind::PoolExhausted => "pool exhausted",
            ErrorKind::Timeout => "timeout",
            ErrorKind::IoError => "I/O error",
            ErrorKind::ParseError => "parse error",
            ErrorKind::NodeUnavailable => "node unavailable",
            ErrorKind::ServerError => "server error",
            ErrorKind::ClientError => "client error",
            ErrorKind::InvalidClientConfig => "invalid client config",
        }
    }

    /// Indicates that this failure is an IO failure.
    pub fn is_io_error(&self) -> bool {
        matches!(self.repr, ErrorRepr::IoError(_))
    }

    /// Returns true if the operation ran out of time, either on a socket or
    /// against a deadline owned by the client.
    pub fn is_timeout(&self) -> bool {
        match self.repr {
            ErrorRepr::IoError(ref err) => matches!(
                err.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
            ),
            _ => self.kind() == ErrorKind::Timeout,
        }
    }

    /// Returns true if error was caused by a dropped connection.
    pub fn is_connection_dropped(&self) -> bool {
        match self.repr {
            ErrorRepr::IoError(ref err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }

    /// Returns true if error was caused by a refused connection.
    pub fn is_connection_refusal(&self) -> bool {
        match self.repr {
            ErrorRepr::IoError(ref err) => {
                #[allow(clippy::match_like_matches_macro)]
                match err.kind() {
                    io::ErrorKind::ConnectionRefused => true,
                    // a missing unix socket file counts as a refusal
                    io::ErrorKind::NotFound => cfg!(unix),
                    _ => false,
                }
            }
            _ => false,
        }
    }

    /// Specifies what method (if any) should be used to retry this request.
    ///
    /// Only transport failures are worth another attempt: a malformed
    /// response or a server-side rejection would most likely repeat.
    pub fn retry_method(&self) -> RetryMethod {
        match self.kind() {
            ErrorKind::IoError => RetryMethod::Reconnect,
            ErrorKind::DiscoveryError
            | ErrorKind::PoolExhausted
            | ErrorKind::Timeout
            | ErrorKind::ParseError
            | ErrorKind::NodeUnavailable
            | ErrorKind::ServerError
            | ErrorKind::ClientError
            | ErrorKind::InvalidClientConfig => RetryMethod::NoRetry,
        }
    }
}

pub(crate) fn invalid_config(desc: &'static str) -> CacheError {
    CacheError::from((ErrorKind::InvalidClientConfig, desc))
}

pub(crate) fn parse_error(desc: &'static str, detail: impl Into<String>) -> CacheError {
    CacheError::from((ErrorKind::ParseError, desc, detail.into()))
}
