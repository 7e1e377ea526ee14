//! Per-connection protocol state machines: HTTP/1.1 and HTTP/2, unified
//! behind one trait so [`crate::connection::Connection`] doesn't need to
//! know which it's holding.

pub mod h1;
pub mod h2;

use async_trait::async_trait;

use crate::{
    body::Body,
    error::Error,
    request::Request,
    response::Response,
};

/// The outcome of [`ProtocolConnection::handle_request`] when the
/// connection could not take the request at all: the request comes back
/// unconsumed so the pool can retry it elsewhere. A request is
/// only ever handed back before its body has been touched — once bytes
/// have gone out on the wire, failure is always a hard [`Error`].
pub enum Rejected {
    /// Not available right now; the pool should pick another connection.
    NotAvailable(Request<Box<dyn Body>>),
    /// A hard failure; the connection is presumed dead.
    Failed(Error),
}

impl From<Error> for Rejected {
    fn from(e: Error) -> Rejected {
        Rejected::Failed(e)
    }
}

pub type HandleResult = std::result::Result<Response, Rejected>;

/// A live protocol engine driving exactly one underlying network stream
/// (HTTP/1.1) or multiplexing many logical streams over one (HTTP/2).
///
/// Implementors track their own state machine (IDLE/ACTIVE/CLOSED for
/// HTTP/1.1; per-stream IDLE/OPEN/HALF_CLOSED/CLOSED for HTTP/2 layered
/// under an ACTIVE/CLOSED connection state) and answer the scheduling
/// questions the pool needs without exposing that machinery.
#[async_trait]
pub trait ProtocolConnection: Send + Sync {
    /// Send a request and await its response. Rejects with
    /// [`Rejected::NotAvailable`], handing the request back, if this
    /// connection cannot accept it right now (e.g. an HTTP/1.1 connection
    /// already servicing one, or an HTTP/2 connection at its stream cap).
    async fn handle_request(&self, request: Request<Box<dyn Body>>) -> HandleResult;

    /// Whether this connection could accept another request right now:
    /// for HTTP/1.1, idle; for HTTP/2, below its negotiated
    /// concurrent-stream limit and not past GOAWAY.
    fn is_available(&self) -> bool;

    /// Whether this connection has been idle longer than the pool's
    /// keepalive expiry.
    fn has_expired(&self, keepalive_expiry: Option<std::time::Duration>) -> bool;

    /// When this connection last went idle, for the pool's cross-origin
    /// least-recently-used eviction comparison.
    fn idle_since(&self) -> std::time::Instant;

    /// True while no requests are in flight and the connection could be
    /// pruned without interrupting anything.
    fn is_idle(&self) -> bool;

    /// True once the underlying stream is known to be unusable (read/write
    /// error, GOAWAY, or an explicit `attempt_close`/`close`).
    fn is_closed(&self) -> bool;

    /// Close the connection only if it is currently idle; a no-op
    /// otherwise. Used when the pool needs to make room without
    /// interrupting in-flight work.
    fn attempt_close(&self);

    /// Unconditionally close the connection, including any requests mid-flight.
    fn close(&self);

    /// A short tag for logs/introspection: `"HTTP/1.1"` or `"HTTP/2"`.
    fn info(&self) -> &'static str;
}
