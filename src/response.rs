//! The [`Response`] type and its extensions.

use http::HeaderMap;

use crate::{backend::BoxedStream, body::Incoming};

/// The negotiated HTTP version, carried in the `http_version` response
/// extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http11,
    Http2,
}

impl Version {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Version::Http11 => b"HTTP/1.1",
            Version::Http2 => b"HTTP/2",
        }
    }
}

/// The status line's reason phrase, carried in the `reason_phrase` response
/// extension. HTTP/2 has no reason phrase; it is always empty there.
#[derive(Debug, Clone, Default)]
pub struct ReasonPhrase(pub Vec<u8>);

/// A streaming HTTP response.
///
/// The body must be fully consumed or explicitly closed before the owning
/// connection may be reused; see [`Incoming`] and
/// [`crate::connection::Connection`] for how that release is wired up.
pub struct Response {
    status: http::StatusCode,
    headers: HeaderMap,
    body: Incoming,
    version: Version,
    reason_phrase: ReasonPhrase,
    /// Set only for a successful `CONNECT`/upgrade response, so
    /// the caller can take over the raw stream.
    network_stream: Option<BoxedStream>,
    /// Fires once the body has been drained or dropped, so the pool knows
    /// when it's safe to release the owning connection back to
    /// availability. `None` means the body was already complete at
    /// construction time (e.g. an empty or fully-buffered body), so the
    /// pool can release immediately instead of waiting.
    body_done: Option<tokio::sync::oneshot::Receiver<bool>>,
}

impl Response {
    pub fn new(status: http::StatusCode, headers: HeaderMap, body: Incoming, version: Version) -> Response {
        Response {
            status,
            headers,
            body,
            version,
            reason_phrase: ReasonPhrase::default(),
            network_stream: None,
            body_done: None,
        }
    }

    /// Attach the body-completion signal for a streamed body. Called by the
    /// protocol engines right after [`Response::new`] when the body is
    /// still in flight.
    pub(crate) fn set_body_done(&mut self, rx: tokio::sync::oneshot::Receiver<bool>) {
        self.body_done = Some(rx);
    }

    /// Take the body-completion signal, if any, for the pool to await
    /// before releasing the connection.
    pub(crate) fn take_body_done(&mut self) -> Option<tokio::sync::oneshot::Receiver<bool>> {
        self.body_done.take()
    }

    pub fn status(&self) -> http::StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn reason_phrase(&self) -> &ReasonPhrase {
        &self.reason_phrase
    }

    pub fn set_reason_phrase(&mut self, phrase: ReasonPhrase) {
        self.reason_phrase = phrase;
    }

    pub fn body(&self) -> &Incoming {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut Incoming {
        &mut self.body
    }

    pub fn into_body(self) -> Incoming {
        self.body
    }

    pub fn network_stream(&mut self) -> Option<BoxedStream> {
        self.network_stream.take()
    }

    pub fn set_network_stream(&mut self, stream: BoxedStream) {
        self.network_stream = Some(stream);
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("headers", &self.headers)
            .finish()
    }
}
