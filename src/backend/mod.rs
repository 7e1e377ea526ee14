//! The network backend collaborator: opens sockets and performs the TLS
//! upgrade. Everything above this trait treats the resulting stream as an
//! opaque async byte-duplex.

mod mock;
mod tcp;

use std::{
    fmt,
    pin::Pin,
    time::Duration,
};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use mock::{MockBackend, MockStream, Script};
pub use tcp::TokioBackend;

use crate::error::{Error, Result};

/// An opaque byte-duplex stream. `close` is idempotent; at most one
/// concurrent read and one concurrent write are ever issued against a
/// given stream by this crate.
pub trait NetworkStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {
    /// Close the stream. Safe to call more than once or from any holder.
    fn close(self: Pin<&mut Self>);
}

/// A type-erased [`NetworkStream`], used where the concrete stream type
/// would otherwise have to be threaded through every layer (e.g. the
/// `network_stream` response extension).
pub type BoxedStream = Pin<Box<dyn NetworkStream>>;

/// Options accepted by [`NetworkBackend::start_tls`].
pub struct TlsOptions<'a> {
    pub server_hostname: &'a str,
    pub alpn_protocols: &'a [&'static str],
    pub timeout: Option<Duration>,
}

/// Opens TCP (and optionally Unix domain) sockets and performs the TLS
/// upgrade. Interchangeable: a Tokio-backed implementation
/// ([`TokioBackend`]) is used in production, a scriptable mock
/// ([`MockBackend`]) in tests.
#[async_trait]
pub trait NetworkBackend: Send + Sync + 'static {
    async fn connect_tcp(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
        local_address: Option<std::net::IpAddr>,
    ) -> Result<BoxedStream>;

    async fn connect_unix_socket(
        &self,
        _path: &std::path::Path,
        _timeout: Option<Duration>,
    ) -> Result<BoxedStream> {
        Err(Error::unsupported_protocol("unix"))
    }

    /// Consume a plaintext stream and yield a TLS stream, negotiating ALPN
    /// from `options.alpn_protocols`. Returns the protocol actually
    /// negotiated, which may be neither offered protocol if the peer
    /// doesn't support ALPN at all — callers then fall back to HTTP/1.1.
    async fn start_tls(&self, stream: BoxedStream, options: TlsOptions<'_>) -> Result<(BoxedStream, Alpn)>;
}

impl fmt::Debug for dyn NetworkBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn NetworkBackend")
    }
}

/// The negotiated application protocol after a TLS handshake, read off the
/// connection's ALPN result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alpn {
    Http11,
    H2,
}
