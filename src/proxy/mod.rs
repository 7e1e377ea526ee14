//! Proxy-aware connection acquisition: a [`Pool`](crate::pool::Pool)
//! specialization that rewrites requests for a forward proxy or tunnels
//! through `CONNECT` for a tunnel proxy, chosen by the target origin's
//! scheme rather than the proxy's own.

pub mod forward;
pub mod tunnel;

use std::sync::Arc;

use crate::{
    backend::NetworkBackend,
    body::Body,
    error::Result,
    request::Request,
    response::Response,
    url::{Origin, Scheme},
};
use forward::ForwardPool;
use tunnel::{ProxyHeaders, TunnelPool};

/// Dispatches each request to a [`ForwardPool`] (plain `http://` targets)
/// or a [`TunnelPool`] (`https://` targets), both reaching the same fixed
/// proxy.
pub struct ProxyPool {
    forward: ForwardPool,
    tunnel: TunnelPool,
}

impl ProxyPool {
    /// `allow_http2` controls ALPN offering on the TLS session negotiated
    /// with the target after a `CONNECT` tunnel is established; forward
    /// proxying is always plain HTTP/1.1 on the wire to the proxy itself.
    pub fn new(
        backend: Arc<dyn NetworkBackend>,
        proxy_origin: Origin,
        headers: ProxyHeaders,
        allow_http2: bool,
    ) -> ProxyPool {
        ProxyPool {
            forward: ForwardPool::new(backend.clone(), proxy_origin.clone(), headers.clone()),
            tunnel: TunnelPool::new(backend, proxy_origin, headers, allow_http2),
        }
    }

    pub async fn send_request(&self, request: Request<Box<dyn Body>>) -> Result<Response> {
        match request.origin().scheme() {
            Scheme::Http => self.forward.send_request(request).await,
            Scheme::Https => self.tunnel.send_request(request).await,
        }
    }

    pub fn close(&self) {
        self.forward.close();
        self.tunnel.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{MockBackend, Script},
        url::Url,
    };
    use http_body_util::BodyExt;

    fn get_request(target: &str) -> Request<Box<dyn Body>> {
        let url = Url::parse(target).unwrap();
        let body: Box<dyn Body> = Box::new(
            http_body_util::Empty::<bytes::Bytes>::new()
                .map_err(|never: std::convert::Infallible| match never {}),
        );
        Request::new(http::Method::GET, url, body)
    }

    #[tokio::test]
    async fn plain_http_target_is_forward_proxied() {
        let backend = MockBackend::new(
            Script::new().read(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec()),
        );
        let inspect = backend.clone();
        let proxy = ProxyPool::new(
            Arc::new(backend),
            Origin::new(crate::url::Scheme::Http, "proxy.test", 8080),
            ProxyHeaders::Empty,
            false,
        );

        proxy.send_request(get_request("http://origin.test/")).await.unwrap();

        let head = String::from_utf8(inspect.writes()[0].clone()).unwrap();
        assert!(head.starts_with("GET http://origin.test/ HTTP/1.1\r\n"));
    }
}
