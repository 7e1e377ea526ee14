//! The error taxonomy: a public struct hiding a private `Kind`, built
//! through small `pub(crate)` constructors rather than `thiserror`.

use std::{error::Error as StdError, fmt, io};

/// A `Result` alias where the `Err` case is [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) type BoxError = Box<dyn StdError + Send + Sync>;

/// An error produced anywhere in the pool, connection, or protocol layers.
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
}

/// The kind of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    ConnectError,
    ConnectTimeout,
    ReadError,
    WriteError,
    ReadTimeout,
    WriteTimeout,
    PoolTimeout,
    NetworkError,
    LocalProtocolError,
    RemoteProtocolError,
    ProxyError,
    UnsupportedProtocol,
    /// A connection could not be used for a new request: either a selected
    /// connection rejected it (the pool retries on another connection
    /// without ever surfacing this case) or the pool itself has been
    /// closed (surfaced immediately, since there's nothing left to retry
    /// against). Construction is `pub(crate)` either way.
    ConnectionNotAvailable,
    RuntimeError,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
            }),
        }
    }

    pub(crate) fn simple(kind: Kind) -> Error {
        Error::new::<BoxError>(kind, None)
    }

    pub(crate) fn connect<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::ConnectError, Some(e))
    }

    pub(crate) fn connect_timeout() -> Error {
        Error::simple(Kind::ConnectTimeout)
    }

    pub(crate) fn read<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::ReadError, Some(e))
    }

    pub(crate) fn write<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::WriteError, Some(e))
    }

    pub(crate) fn read_timeout() -> Error {
        Error::simple(Kind::ReadTimeout)
    }

    pub(crate) fn write_timeout() -> Error {
        Error::simple(Kind::WriteTimeout)
    }

    pub(crate) fn pool_timeout() -> Error {
        Error::simple(Kind::PoolTimeout)
    }

    pub(crate) fn network<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::NetworkError, Some(e))
    }

    pub(crate) fn local_protocol<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::LocalProtocolError, Some(e))
    }

    pub(crate) fn remote_protocol<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::RemoteProtocolError, Some(e))
    }

    pub(crate) fn proxy<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::ProxyError, Some(e))
    }

    pub(crate) fn unsupported_protocol(scheme: &str) -> Error {
        Error::new::<BoxError>(
            Kind::UnsupportedProtocol,
            Some(format!("unsupported scheme: {scheme}").into()),
        )
    }

    pub(crate) fn connection_not_available() -> Error {
        Error::simple(Kind::ConnectionNotAvailable)
    }

    pub(crate) fn runtime<E: Into<BoxError>>(e: E) -> Error {
        Error::new(Kind::RuntimeError, Some(e))
    }

    /// The kind of failure this error represents.
    pub fn kind(&self) -> Kind {
        self.inner.kind
    }

    pub(crate) fn is_connection_not_available(&self) -> bool {
        self.inner.kind == Kind::ConnectionNotAvailable
    }

    /// True for any of the `*Timeout` kinds.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.inner.kind,
            Kind::ConnectTimeout | Kind::ReadTimeout | Kind::WriteTimeout | Kind::PoolTimeout
        )
    }

    pub fn is_pool_timeout(&self) -> bool {
        self.inner.kind == Kind::PoolTimeout
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("corehttp::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.source {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let desc = match self.inner.kind {
            Kind::ConnectError => "error connecting to the server",
            Kind::ConnectTimeout => "timed out connecting to the server",
            Kind::ReadError => "error reading from the connection",
            Kind::WriteError => "error writing to the connection",
            Kind::ReadTimeout => "timed out reading from the connection",
            Kind::WriteTimeout => "timed out writing to the connection",
            Kind::PoolTimeout => "timed out waiting for pool capacity",
            Kind::NetworkError => "network error",
            Kind::LocalProtocolError => "local protocol error",
            Kind::RemoteProtocolError => "remote protocol error",
            Kind::ProxyError => "proxy tunnel setup failed",
            Kind::UnsupportedProtocol => "unsupported protocol",
            Kind::ConnectionNotAvailable => "connection not available",
            Kind::RuntimeError => "misuse of the client",
        };
        write!(f, "{desc}")?;
        if let Some(ref cause) = self.inner.source {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        match e.kind() {
            io::ErrorKind::TimedOut => Error::read_timeout(),
            _ => Error::network(e),
        }
    }
}
