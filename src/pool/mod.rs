//! [`Pool`]: the connection scheduler.
//!
//! Acquiring a connection for an origin follows, in order: **Prune** dead
//! or expired connections, **Reuse** an idle one for the origin, **Create**
//! a new one if under `max_connections`, **Create room** by evicting the
//! least-recently-used idle connection (from any origin) if at the cap, or
//! **Wait** for the next release. Expressed as an explicit state machine,
//! since this pool owns connection lifecycle end to end rather than
//! delegating it to an outer checkout-vs-connect race.

mod waiter;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use log::{debug, trace};

use waiter::WaitQueue;

use crate::{
    backend::NetworkBackend,
    body::Body,
    connection::{Connection, ConnectionState},
    error::{Error, Result},
    protocol::Rejected,
    request::Request,
    response::Response,
    url::Origin,
};

const RETRY_LIMIT: u32 = 3;

/// How a pending [`Connection`] gets dialed. The default dials the origin
/// directly; [`crate::proxy::tunnel::TunnelDialer`] overrides this to dial
/// a proxy and `CONNECT` through to the target origin instead.
#[async_trait]
pub(crate) trait Dialer: Send + Sync {
    async fn dial(
        &self,
        conn: &Connection,
        backend: &dyn NetworkBackend,
        connect_timeout: Option<Duration>,
        allow_http2: bool,
    ) -> Result<()>;
}

struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(
        &self,
        conn: &Connection,
        backend: &dyn NetworkBackend,
        connect_timeout: Option<Duration>,
        allow_http2: bool,
    ) -> Result<()> {
        conn.connect(backend, connect_timeout, None, allow_http2).await
    }
}

/// Tunable limits for a [`Pool`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    max_connections: usize,
    max_keepalive_connections: usize,
    keepalive_expiry: Option<Duration>,
    connect_timeout: Option<Duration>,
    pool_timeout: Option<Duration>,
    http2: bool,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            max_connections: 10,
            max_keepalive_connections: 10,
            keepalive_expiry: Some(Duration::from_secs(5)),
            connect_timeout: Some(Duration::from_secs(10)),
            pool_timeout: None,
            http2: true,
        }
    }
}

/// Builds a [`Pool`] with chained setters (`&mut self -> &mut Self`,
/// terminated by `.build(..)`) rather than a consuming builder.
#[derive(Debug, Clone, Default)]
pub struct Builder {
    config: PoolConfig,
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    pub fn max_connections(&mut self, n: usize) -> &mut Builder {
        self.config.max_connections = n;
        self
    }

    pub fn max_keepalive_connections(&mut self, n: usize) -> &mut Builder {
        self.config.max_keepalive_connections = n;
        self
    }

    pub fn keepalive_expiry(&mut self, expiry: Option<Duration>) -> &mut Builder {
        self.config.keepalive_expiry = expiry;
        self
    }

    pub fn connect_timeout(&mut self, timeout: Option<Duration>) -> &mut Builder {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn pool_timeout(&mut self, timeout: Option<Duration>) -> &mut Builder {
        self.config.pool_timeout = timeout;
        self
    }

    pub fn http2(&mut self, enabled: bool) -> &mut Builder {
        self.config.http2 = enabled;
        self
    }

    pub fn build(&self, backend: Arc<dyn NetworkBackend>) -> Pool {
        self.build_with_dialer(backend, Arc::new(DirectDialer))
    }

    /// Build a pool with a non-default dialing strategy, e.g. one that
    /// tunnels through a proxy instead of dialing an origin directly. Not
    /// part of the public API — proxy pools reach for it through
    /// `pub(crate)` visibility.
    pub(crate) fn build_with_dialer(&self, backend: Arc<dyn NetworkBackend>, dialer: Arc<dyn Dialer>) -> Pool {
        Pool {
            inner: Arc::new(Inner {
                config: self.config.clone(),
                backend,
                dialer,
                state: Mutex::new(State {
                    connections: HashMap::new(),
                    waiters: HashMap::new(),
                    total: 0,
                    closed: false,
                }),
            }),
        }
    }
}

/// A snapshot of one pooled connection, returned by [`Pool::connections`].
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub origin: Origin,
    pub state: ConnectionState,
    /// `"HTTP/1.1"`/`"HTTP/2"`, or `None` while still `PENDING`.
    pub info: Option<&'static str>,
    pub request_count: u64,
}

struct State {
    /// Per-origin connection lists, MRU-first: index 0 is the most recently
    /// released connection, so a linear scan for "idle, matching origin"
    /// also happens to pick the most recently used one.
    connections: HashMap<Origin, Vec<Arc<Connection>>>,
    waiters: HashMap<Origin, WaitQueue>,
    total: usize,
    closed: bool,
}

struct Inner {
    config: PoolConfig,
    backend: Arc<dyn NetworkBackend>,
    dialer: Arc<dyn Dialer>,
    state: Mutex<State>,
}

/// A bounded, origin-keyed pool of [`Connection`]s.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

impl Pool {
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub fn new(backend: Arc<dyn NetworkBackend>) -> Pool {
        Builder::new().build(backend)
    }

    /// Route `request` to a connection for its origin, dialing or waiting
    /// for capacity as needed, and retrying on
    /// [`crate::Kind::ConnectionNotAvailable`] up to [`RETRY_LIMIT`] times
    /// before giving up with a pool timeout.
    pub async fn send_request(&self, request: Request<Box<dyn Body>>) -> Result<Response> {
        let origin = request.origin();
        self.send_request_to(origin, request).await
    }

    /// Like [`Pool::send_request`], but acquires a connection keyed by
    /// `origin` rather than the request's own origin. Used by
    /// [`crate::proxy::forward::ForwardPool`], where every target origin
    /// shares one connection keyed by the *proxy's* origin.
    pub(crate) async fn send_request_to(&self, origin: Origin, request: Request<Box<dyn Body>>) -> Result<Response> {
        let mut request = request;

        for attempt in 0..RETRY_LIMIT {
            let conn = self.acquire(&origin).await?;
            match conn.handle_request(request).await {
                Ok(mut response) => {
                    self.release_on_body_close(origin, response.take_body_done());
                    return Ok(response);
                }
                Err(Rejected::NotAvailable(returned)) => {
                    trace!("connection not available for {origin}, retry {}/{RETRY_LIMIT}", attempt + 1);
                    request = returned;
                }
                Err(Rejected::Failed(e)) => return Err(e),
            }
        }
        Err(Error::pool_timeout())
    }

    /// Wake a waiter for `origin` once the response body has been drained
    /// or dropped — the pool's actual "a connection might be free now"
    /// signal, rather than relying solely on eviction/dial-failure to wake
    /// waiters. A body already complete at construction time (no
    /// `body_done` receiver: an empty or fully-buffered response) releases
    /// immediately instead of waiting on a channel that will never fire.
    fn release_on_body_close(&self, origin: Origin, body_done: Option<tokio::sync::oneshot::Receiver<bool>>) {
        match body_done {
            Some(rx) => {
                let pool = self.clone();
                tokio::spawn(async move {
                    let _ = rx.await;
                    pool.release(&origin);
                });
            }
            None => self.release(&origin),
        }
    }

    async fn acquire(&self, origin: &Origin) -> Result<Arc<Connection>> {
        loop {
            enum Next {
                Use(Arc<Connection>),
                Dial(Arc<Connection>),
                Evict(Arc<Connection>),
                Wait(waiter::Waiting),
            }

            let next = {
                let mut state = self.inner.state.lock().unwrap();
                if state.closed {
                    return Err(Error::runtime("pool is closed"));
                }

                self.prune_locked(&mut state);

                if let Some(conn) = reuse_locked(&mut state, origin) {
                    Next::Use(conn)
                } else if state.total < self.inner.config.max_connections {
                    let conn = Arc::new(Connection::pending(origin.clone()));
                    state.total += 1;
                    state.connections.entry(origin.clone()).or_default().push(conn.clone());
                    Next::Dial(conn)
                } else if let Some(victim) = least_recently_used_idle_locked(&mut state) {
                    Next::Evict(victim)
                } else {
                    let waiting = state.waiters.entry(origin.clone()).or_default().push();
                    Next::Wait(waiting)
                }
            };

            match next {
                Next::Use(conn) => return Ok(conn),
                Next::Dial(conn) => {
                    let allow_http2 = self.inner.config.http2;
                    let result = self
                        .inner
                        .dialer
                        .dial(&conn, &*self.inner.backend, self.inner.config.connect_timeout, allow_http2)
                        .await;
                    if let Err(e) = result {
                        self.drop_connection(origin, &conn);
                        return Err(e);
                    }
                    return Ok(conn);
                }
                Next::Evict(victim) => {
                    victim.attempt_close();
                    self.drop_connection(victim.origin(), &victim);
                }
                Next::Wait(waiting) => {
                    let deadline = self
                        .inner
                        .config
                        .pool_timeout
                        .map(|d| tokio::time::Instant::now() + d);
                    if !waiting.wait(deadline).await {
                        return Err(Error::pool_timeout());
                    }
                }
            }
        }
    }

    fn prune_locked(&self, state: &mut State) {
        let expiry = self.inner.config.keepalive_expiry;
        let mut removed = 0;
        for connections in state.connections.values_mut() {
            let before = connections.len();
            connections.retain(|c| !(c.is_closed() || c.has_expired(expiry)));
            removed += before - connections.len();
        }
        state.connections.retain(|_, v| !v.is_empty());
        if removed > 0 {
            debug!("pruned {removed} closed/expired connection(s)");
        }
        state.total -= removed;

        removed = self.enforce_keepalive_cap_locked(state);
        state.total -= removed;
    }

    /// Closes the least-recently-used idle connections beyond
    /// `max_keepalive_connections`, counted across all origins. Returns how
    /// many were removed.
    fn enforce_keepalive_cap_locked(&self, state: &mut State) -> usize {
        let cap = self.inner.config.max_keepalive_connections;
        let mut idle_total: usize = state
            .connections
            .values()
            .map(|conns| conns.iter().filter(|c| c.is_idle()).count())
            .sum();
        let mut removed = 0;
        while idle_total > cap {
            match least_recently_used_idle_locked(state) {
                Some(victim) => {
                    victim.close();
                    if let Some(list) = state.connections.get_mut(victim.origin()) {
                        list.retain(|c| !Arc::ptr_eq(c, &victim));
                    }
                    idle_total -= 1;
                    removed += 1;
                }
                None => break,
            }
        }
        state.connections.retain(|_, v| !v.is_empty());
        removed
    }

    fn drop_connection(&self, origin: &Origin, conn: &Arc<Connection>) {
        let mut state = self.inner.state.lock().unwrap();
        let mut removed = false;
        let mut empty = false;
        if let Some(list) = state.connections.get_mut(origin) {
            if let Some(pos) = list.iter().position(|c| Arc::ptr_eq(c, conn)) {
                list.remove(pos);
                removed = true;
            }
            empty = list.is_empty();
        }
        if removed {
            state.total -= 1;
        }
        if empty {
            state.connections.remove(origin);
        }
        if let Some(waiters) = state.waiters.get_mut(origin) {
            waiters.wake_one();
        }
    }

    /// Release a connection back to availability, waking one waiter for
    /// its origin. Connections never leave the pool's
    /// map on release — only on prune or eviction — so this only needs to
    /// notify.
    pub fn release(&self, origin: &Origin) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(waiters) = state.waiters.get_mut(origin) {
            waiters.wake_one();
        }
    }

    /// A snapshot of every live connection, for introspection.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let state = self.inner.state.lock().unwrap();
        state
            .connections
            .iter()
            .flat_map(|(origin, conns)| {
                conns.iter().map(move |conn| ConnectionInfo {
                    origin: origin.clone(),
                    state: conn.state_info(),
                    info: conn.protocol_info(),
                    request_count: conn.request_count(),
                })
            })
            .collect()
    }

    /// Close every connection and wake every waiter with a pool-timeout
    /// error, e.g. on client shutdown.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.closed = true;
        for connections in state.connections.values() {
            for conn in connections {
                conn.close();
            }
        }
        state.connections.clear();
        state.total = 0;
        for waiters in state.waiters.values_mut() {
            waiters.wake_all();
        }
    }
}

fn reuse_locked(state: &mut State, origin: &Origin) -> Option<Arc<Connection>> {
    let connections = state.connections.get_mut(origin)?;
    let pos = connections.iter().position(|c| c.is_available())?;
    let conn = connections.remove(pos);
    connections.insert(0, conn.clone());
    Some(conn)
}

/// The globally least-recently-used idle connection, compared by each
/// connection's own `idle_since` timestamp across every origin — not just
/// the first origin bucket a `HashMap` happens to iterate.
fn least_recently_used_idle_locked(state: &mut State) -> Option<Arc<Connection>> {
    state
        .connections
        .values()
        .flat_map(|conns| conns.iter().filter(|c| c.is_idle()))
        .min_by_key(|c| c.idle_since())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::MockBackend, url::Scheme};
    use http_body_util::BodyExt;

    fn get_request(origin: &Origin) -> Request<Box<dyn Body>> {
        let url = crate::url::Url::parse(&format!("{}/", origin)).unwrap();
        let body: Box<dyn Body> = Box::new(
            http_body_util::Empty::<bytes::Bytes>::new()
                .map_err(|never: std::convert::Infallible| match never {}),
        );
        Request::new(http::Method::GET, url, body)
    }

    fn ok_backend() -> Arc<dyn NetworkBackend> {
        Arc::new(MockBackend::new(
            crate::backend::Script::new()
                .read(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec())
                .read(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec()),
        ))
    }

    #[tokio::test]
    async fn reuses_an_idle_connection_for_the_same_origin() {
        let pool = Pool::builder().max_connections(1).build(ok_backend());
        let origin = Origin::new(Scheme::Http, "example.test", 80);

        pool.send_request(get_request(&origin)).await.unwrap();
        let snapshot = pool.connections();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].origin, origin);
        assert_eq!(snapshot[0].request_count, 1);

        pool.send_request(get_request(&origin)).await.unwrap();
        // Still exactly one connection: the second request reused it.
        let snapshot = pool.connections();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].origin, origin);
        assert_eq!(snapshot[0].request_count, 2);
    }

    #[tokio::test]
    async fn distinct_origins_get_distinct_connections() {
        let pool = Pool::builder().max_connections(10).build(ok_backend());
        let a = Origin::new(Scheme::Http, "a.test", 80);
        let b = Origin::new(Scheme::Http, "b.test", 80);

        pool.send_request(get_request(&a)).await.unwrap();
        pool.send_request(get_request(&b)).await.unwrap();

        let mut snapshot = pool.connections();
        snapshot.sort_by(|x, y| x.origin.host().cmp(y.origin.host()));
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].origin, a);
        assert_eq!(snapshot[1].origin, b);
        assert_eq!(snapshot[0].request_count, 1);
        assert_eq!(snapshot[1].request_count, 1);
    }

    #[tokio::test]
    async fn dial_failure_is_propagated_and_does_not_leak_the_slot() {
        let pool = Pool::builder()
            .max_connections(1)
            .build(Arc::new(MockBackend::failing("refused")));
        let origin = Origin::new(Scheme::Http, "example.test", 80);

        assert!(pool.send_request(get_request(&origin)).await.is_err());
        assert!(pool.connections().is_empty());
    }
}
