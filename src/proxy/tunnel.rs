//! The `CONNECT` tunnel handshake: send the request line and headers, then
//! scan the proxy's response for a `200` status before handing the stream
//! off to TLS. Expressed with plain `AsyncReadExt`/`AsyncWriteExt` calls
//! since the stream here is already held behind an `async fn` rather than
//! a tower-style `Service`.

use std::sync::Arc;

use async_trait::async_trait;
use http::{HeaderMap, HeaderValue};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{
    backend::{BoxedStream, NetworkBackend},
    body::Body,
    connection::Connection,
    error::{Error, Result},
    pool::{Dialer, Pool},
    request::Request,
    response::Response,
    url::Origin,
};

/// Optional headers attached to every `CONNECT` request a [`TunnelDialer`]
/// sends — set once at pool-construction time.
#[derive(Clone, Debug, Default)]
pub enum ProxyHeaders {
    #[default]
    Empty,
    Auth(HeaderValue),
    Extra(HeaderMap),
}

impl ProxyHeaders {
    pub fn with_auth(mut auth: HeaderValue) -> ProxyHeaders {
        auth.set_sensitive(true);
        ProxyHeaders::Auth(auth)
    }

    pub fn with_extra(headers: HeaderMap) -> ProxyHeaders {
        ProxyHeaders::Extra(headers)
    }
}

const MAX_RESPONSE_BYTES: usize = 8192;

/// Sends `CONNECT host:port HTTP/1.1` to `stream` and consumes the proxy's
/// response, leaving the stream positioned right after the blank line that
/// terminates it (so the caller can hand the same stream to `start_tls`).
pub async fn send_connect(stream: &mut BoxedStream, target: &Origin, headers: &ProxyHeaders) -> Result<()> {
    let host = target.host();
    let port = target.port();

    let mut buf = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n").into_bytes();
    match headers {
        ProxyHeaders::Auth(auth) => {
            buf.extend_from_slice(b"Proxy-Authorization: ");
            buf.extend_from_slice(auth.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }
        ProxyHeaders::Extra(extra) => {
            for (name, value) in extra {
                buf.extend_from_slice(name.as_str().as_bytes());
                buf.extend_from_slice(b": ");
                buf.extend_from_slice(value.as_bytes());
                buf.extend_from_slice(b"\r\n");
            }
        }
        ProxyHeaders::Empty => {}
    }
    buf.extend_from_slice(b"\r\n");

    stream.write_all(&buf).await.map_err(Error::write)?;
    stream.flush().await.map_err(Error::write)?;

    let mut received = Vec::with_capacity(256);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.map_err(Error::read)?;
        if n == 0 {
            return Err(Error::proxy("proxy closed the connection before completing CONNECT"));
        }
        received.extend_from_slice(&chunk[..n]);
        if received.len() > MAX_RESPONSE_BYTES {
            return Err(Error::proxy("CONNECT response headers too large"));
        }

        if received.starts_with(b"HTTP/1.1 200") || received.starts_with(b"HTTP/1.0 200") {
            if received.ends_with(b"\r\n\r\n") {
                return Ok(());
            }
            // else keep reading until the blank line.
        } else if received.starts_with(b"HTTP/1.1 407") || received.starts_with(b"HTTP/1.0 407") {
            return Err(Error::proxy("proxy requires authorization"));
        } else if received.ends_with(b"\r\n\r\n") {
            return Err(Error::proxy("proxy refused the CONNECT request"));
        }
    }
}

/// A [`Dialer`] that reaches the target origin through a fixed proxy,
/// serializing the CONNECT-then-TLS dance through [`Connection::connect_via_tunnel`].
pub(crate) struct TunnelDialer {
    pub(crate) proxy_origin: Origin,
    pub(crate) headers: Arc<ProxyHeaders>,
}

#[async_trait]
impl Dialer for TunnelDialer {
    async fn dial(
        &self,
        conn: &Connection,
        backend: &dyn NetworkBackend,
        connect_timeout: Option<std::time::Duration>,
        allow_http2: bool,
    ) -> Result<()> {
        conn.connect_via_tunnel(backend, &self.proxy_origin, connect_timeout, &self.headers, None, allow_http2)
            .await
    }
}

/// One `Connection` per target origin, each reached by dialing a fixed
/// proxy and `CONNECT`-ing through to the target before the usual
/// TLS/ALPN negotiation runs.
pub struct TunnelPool {
    pool: Pool,
}

impl TunnelPool {
    /// `allow_http2` controls ALPN offering on the *target* TLS session
    /// negotiated after `CONNECT` succeeds, the same knob
    /// [`crate::pool::Builder::http2`] exposes on a direct pool.
    pub fn new(
        backend: Arc<dyn NetworkBackend>,
        proxy_origin: Origin,
        headers: ProxyHeaders,
        allow_http2: bool,
    ) -> TunnelPool {
        let dialer = Arc::new(TunnelDialer {
            proxy_origin,
            headers: Arc::new(headers),
        });
        TunnelPool {
            pool: Pool::builder().http2(allow_http2).build_with_dialer(backend, dialer),
        }
    }

    pub async fn send_request(&self, request: Request<Box<dyn Body>>) -> Result<Response> {
        self.pool.send_request(request).await
    }

    pub fn close(&self) {
        self.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MockBackend, NetworkBackend, Script};
    use crate::url::Scheme;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn successful_connect_leaves_stream_ready_for_tls() {
        let backend = MockBackend::new(Script::new().read(b"HTTP/1.1 200 Connection Established\r\n\r\n".to_vec()));
        let mut stream = backend.connect_tcp("proxy.test", 8080, None, None).await.unwrap();
        let target = Origin::new(Scheme::Https, "example.test", 443);
        send_connect(&mut stream, &target, &ProxyHeaders::Empty).await.unwrap();
    }

    #[tokio::test]
    async fn proxy_auth_required_is_reported() {
        let backend = MockBackend::new(Script::new().read(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n".to_vec()));
        let mut stream = backend.connect_tcp("proxy.test", 8080, None, None).await.unwrap();
        let target = Origin::new(Scheme::Https, "example.test", 443);
        let err = send_connect(&mut stream, &target, &ProxyHeaders::Empty).await.unwrap_err();
        assert_eq!(err.kind(), crate::Kind::ProxyError);
    }

    #[tokio::test]
    async fn tunnel_pool_sends_the_request_after_connect_succeeds() {
        let backend = MockBackend::new(
            Script::new()
                .read(b"HTTP/1.1 200 Connection Established\r\n\r\n".to_vec())
                .read(b"HTTP/1.1 204 No Content\r\n\r\n".to_vec()),
        );
        let pool = TunnelPool::new(
            Arc::new(backend),
            Origin::new(Scheme::Http, "proxy.test", 8080),
            ProxyHeaders::Empty,
            false,
        );

        let url = crate::url::Url::parse("https://example.test/secrets").unwrap();
        let body: Box<dyn Body> = Box::new(
            http_body_util::Empty::<bytes::Bytes>::new()
                .map_err(|never: std::convert::Infallible| match never {}),
        );
        let request = Request::new(http::Method::GET, url, body);

        let response = pool.send_request(request).await.unwrap();
        assert_eq!(response.status(), http::StatusCode::NO_CONTENT);
    }
}
