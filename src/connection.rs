//! [`Connection`]: the pool's unit of bookkeeping.
//!
//! A `Connection` starts life `PENDING` — reserved in the pool but not yet
//! dialed — then becomes `ACTIVE` once the dial and (if applicable) the TLS
//! and ALPN-driven protocol engine creation succeed. From there it defers
//! entirely to its [`ProtocolConnection`] for IDLE/ACTIVE-per-request
//! bookkeeping, and only tracks the terminal `CLOSED` state itself plus the
//! origin it was opened for.

use std::{
    sync::{
        atomic::{AtomicU64, AtomicU8, Ordering},
        OnceLock,
    },
    time::{Duration, Instant},
};

use log::debug;

use crate::{
    backend::{Alpn, BoxedStream, NetworkBackend, TlsOptions},
    body::Body,
    error::{Error, Result},
    protocol::{h1::H1Connection, h2::H2Connection, HandleResult, ProtocolConnection, Rejected},
    request::Request,
    url::Origin,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum State {
    Pending = 0,
    Active = 1,
    Closed = 2,
}

/// The lifecycle state of a [`Connection`], as reported by
/// [`Pool::connections`](crate::pool::Pool::connections) for introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Reserved in the pool but not yet dialed.
    Pending,
    /// Dialed and currently servicing at least one request.
    Active,
    /// Dialed, idle, and available for reuse.
    Idle,
    /// No longer usable; eligible for pruning.
    Closed,
}

/// A single pooled connection to one origin. Holds the origin it was
/// opened for so the pool can enforce that requests are only ever routed
/// to a connection that actually matches.
pub struct Connection {
    origin: Origin,
    state: AtomicU8,
    engine: OnceLock<Box<dyn ProtocolConnection>>,
    request_count: AtomicU64,
}

impl Connection {
    /// Reserve bookkeeping for a connection that hasn't been dialed yet.
    pub fn pending(origin: Origin) -> Connection {
        Connection {
            origin,
            state: AtomicU8::new(State::Pending as u8),
            engine: OnceLock::new(),
            request_count: AtomicU64::new(0),
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    /// Dial the origin, perform the TLS/ALPN negotiation for `https`, and
    /// bring up the matching protocol engine. Moves `self` from `PENDING`
    /// to `ACTIVE` on success; on failure the connection is left `CLOSED`
    /// so the pool evicts it instead of retrying the same handle.
    pub async fn connect(
        &self,
        backend: &dyn NetworkBackend,
        connect_timeout: Option<Duration>,
        sni_hostname: Option<&str>,
        allow_http2: bool,
    ) -> Result<()> {
        let stream = backend
            .connect_tcp(self.origin.host(), self.origin.port(), connect_timeout, None)
            .await;
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                self.set_state(State::Closed);
                return Err(e);
            }
        };

        let result = self.negotiate(backend, stream, sni_hostname, allow_http2).await;
        match result {
            Ok(engine) => {
                let _ = self.engine.set(engine);
                self.set_state(State::Active);
                debug!(
                    "connection established to {} ({})",
                    self.origin,
                    self.engine.get().unwrap().info()
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(State::Closed);
                Err(e)
            }
        }
    }

    /// Dial a proxy, `CONNECT` through to `self`'s origin, then negotiate
    /// TLS/ALPN and the protocol engine as if directly connected.
    /// Used by [`crate::proxy::tunnel`].
    pub async fn connect_via_tunnel(
        &self,
        backend: &dyn NetworkBackend,
        proxy_origin: &Origin,
        connect_timeout: Option<Duration>,
        proxy_headers: &crate::proxy::tunnel::ProxyHeaders,
        sni_hostname: Option<&str>,
        allow_http2: bool,
    ) -> Result<()> {
        let result = async {
            let mut stream = backend
                .connect_tcp(proxy_origin.host(), proxy_origin.port(), connect_timeout, None)
                .await?;
            crate::proxy::tunnel::send_connect(&mut stream, &self.origin, proxy_headers).await?;
            self.negotiate(backend, stream, sni_hostname, allow_http2).await
        }
        .await;

        match result {
            Ok(engine) => {
                let _ = self.engine.set(engine);
                self.set_state(State::Active);
                Ok(())
            }
            Err(e) => {
                self.set_state(State::Closed);
                Err(e)
            }
        }
    }

    async fn negotiate(
        &self,
        backend: &dyn NetworkBackend,
        stream: BoxedStream,
        sni_hostname: Option<&str>,
        allow_http2: bool,
    ) -> Result<Box<dyn ProtocolConnection>> {
        if !self.origin.scheme().is_secure() {
            return Ok(Box::new(H1Connection::new(stream)));
        }

        let hostname = sni_hostname.unwrap_or_else(|| self.origin.host());
        let alpn_protocols: &[&'static str] = if allow_http2 {
            &["h2", "http/1.1"]
        } else {
            &["http/1.1"]
        };
        let (tls_stream, alpn) = backend
            .start_tls(
                stream,
                TlsOptions {
                    server_hostname: hostname,
                    alpn_protocols,
                    timeout: None,
                },
            )
            .await?;

        match alpn {
            Alpn::H2 => Ok(Box::new(H2Connection::handshake(tls_stream).await?)),
            Alpn::Http11 => Ok(Box::new(H1Connection::new(tls_stream))),
        }
    }

    /// Route a request through this connection's protocol engine.
    ///
    /// Rejects with a [`crate::Kind::RuntimeError`] if `request`'s origin
    /// doesn't match the one this connection was dialed for — except for a
    /// forward-proxied request, which is deliberately routed through a
    /// connection keyed by the *proxy's* origin rather than its own; see
    /// [`crate::proxy::forward::ForwardPool`].
    ///
    /// # Panics
    /// Panics if called before [`Connection::connect`] has succeeded; the
    /// pool never hands out a connection's handle to a caller before that
    /// connect resolves.
    pub async fn handle_request(&self, request: Request<Box<dyn Body>>) -> HandleResult {
        if !request.extensions().proxy_absolute_form && request.origin() != self.origin {
            return Err(Rejected::Failed(Error::runtime("wrong-origin connection")));
        }

        let engine = self.engine.get().expect("connection not yet established");
        let result = engine.handle_request(request).await;
        if !matches!(result, Err(Rejected::NotAvailable(_))) {
            self.request_count.fetch_add(1, Ordering::SeqCst);
        }
        result
    }

    pub fn is_available(&self) -> bool {
        self.state() == State::Active && self.engine.get().map(|e| e.is_available()).unwrap_or(false)
    }

    pub fn is_idle(&self) -> bool {
        self.state() == State::Active && self.engine.get().map(|e| e.is_idle()).unwrap_or(false)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == State::Closed || self.engine.get().map(|e| e.is_closed()).unwrap_or(false)
    }

    pub fn has_expired(&self, keepalive_expiry: Option<Duration>) -> bool {
        self.engine
            .get()
            .map(|e| e.has_expired(keepalive_expiry))
            .unwrap_or(false)
    }

    /// Close only if idle; used by the pool to make room without
    /// interrupting an in-flight request.
    pub fn attempt_close(&self) {
        if let Some(engine) = self.engine.get() {
            engine.attempt_close();
        }
        if self.is_idle() || self.state() == State::Pending {
            self.set_state(State::Closed);
        }
    }

    pub fn close(&self) {
        if let Some(engine) = self.engine.get() {
            engine.close();
        }
        self.set_state(State::Closed);
    }

    pub fn protocol_info(&self) -> Option<&'static str> {
        self.engine.get().map(|e| e.info())
    }

    /// How many requests this connection has serviced so far.
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }

    /// The [`ConnectionState`] the pool should report for this connection.
    pub fn state_info(&self) -> ConnectionState {
        match self.state() {
            State::Pending => ConnectionState::Pending,
            State::Closed => ConnectionState::Closed,
            State::Active if self.engine.get().map(|e| e.is_idle()).unwrap_or(false) => ConnectionState::Idle,
            State::Active => ConnectionState::Active,
        }
    }

    /// When this connection last went idle, for the pool's cross-origin
    /// least-recently-used eviction comparison. Defers to the protocol
    /// engine, which already tracks this for its own keepalive-expiry
    /// check; a connection with no engine yet (still `PENDING`) reports
    /// "now", so it never looks falsely stale.
    pub fn idle_since(&self) -> Instant {
        self.engine.get().map(|e| e.idle_since()).unwrap_or_else(Instant::now)
    }

    fn state(&self) -> State {
        match self.state.load(Ordering::SeqCst) {
            0 => State::Pending,
            1 => State::Active,
            _ => State::Closed,
        }
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{MockBackend, Script},
        url::Scheme,
    };

    #[tokio::test]
    async fn plaintext_origin_gets_an_http1_engine() {
        let backend = MockBackend::new(Script::new());
        let origin = Origin::new(Scheme::Http, "example.test", 80);
        let conn = Connection::pending(origin);
        conn.connect(&backend, None, None, true).await.unwrap();
        assert!(conn.is_available());
        assert_eq!(conn.protocol_info(), Some("HTTP/1.1"));
    }

    #[tokio::test]
    async fn failed_dial_leaves_connection_closed() {
        let backend = MockBackend::failing("connection refused");
        let origin = Origin::new(Scheme::Http, "example.test", 80);
        let conn = Connection::pending(origin);
        assert!(conn.connect(&backend, None, None, true).await.is_err());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn request_for_a_different_origin_is_rejected() {
        use http_body_util::BodyExt;

        let backend = MockBackend::new(Script::new());
        let origin = Origin::new(Scheme::Http, "example.test", 80);
        let conn = Connection::pending(origin);
        conn.connect(&backend, None, None, true).await.unwrap();

        let url = crate::url::Url::parse("http://other.test/").unwrap();
        let body: Box<dyn Body> = Box::new(
            http_body_util::Empty::<bytes::Bytes>::new()
                .map_err(|never: std::convert::Infallible| match never {}),
        );
        let request = Request::new(http::Method::GET, url, body);

        match conn.handle_request(request).await {
            Err(Rejected::Failed(e)) => assert_eq!(e.kind(), crate::Kind::RuntimeError),
            other => panic!("expected a wrong-origin rejection, got {}", other.is_ok()),
        }
    }
}
