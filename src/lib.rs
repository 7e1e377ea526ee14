//! `corehttp` is the pooled-connection core of a minimal, low-level HTTP
//! client. It sends requests and receives responses over a bounded set of
//! reused network connections. It does not follow redirects, does not store
//! cookies, does not decode response bodies, and does not read proxy
//! configuration from the environment — those are the job of a higher-level
//! client built on top of this crate.
//!
//! The pieces:
//!
//! - [`url`] — [`Url`](url::Url) and [`Origin`](url::Origin), the structural
//!   split used to key the pool.
//! - [`backend`] — the [`NetworkBackend`](backend::NetworkBackend) trait that
//!   opens sockets and performs the TLS upgrade, plus a Tokio-backed
//!   implementation and a scriptable mock for tests.
//! - [`protocol`] — the HTTP/1.1 and HTTP/2 [`ProtocolConnection`](protocol::ProtocolConnection)
//!   state machines.
//! - [`connection`] — [`Connection`](connection::Connection), the
//!   pool-managed handle around one protocol connection.
//! - [`pool`] — [`Pool`](pool::Pool), the scheduler.
//! - [`proxy`] — forward and tunnel proxy pool specializations.
//! - [`blocking`] — a thread-relayed synchronous surface over [`pool::Pool`].

mod body;
pub mod backend;
pub mod blocking;
pub mod connection;
mod error;
pub mod pool;
pub mod protocol;
pub mod proxy;
mod request;
mod response;
pub mod url;

pub use body::Body;
pub use error::{Error, Kind, Result};
pub use request::{Extensions, Request, Timeouts};
pub use response::{ReasonPhrase, Response, Version};
pub use url::{Origin, Scheme, Url};
