//! Forward proxying for plain `http://` targets: one shared connection
//! to the proxy, regardless of how many distinct target origins route
//! through it, with the request rewritten to absolute-form the way an
//! HTTP proxy expects.

use std::sync::Arc;

use http::header::PROXY_AUTHORIZATION;

use super::tunnel::ProxyHeaders;
use crate::{
    backend::NetworkBackend,
    body::Body,
    error::Result,
    pool::Pool,
    request::Request,
    response::Response,
    url::Origin,
};

/// A pool keyed by the proxy's own origin: every target origin that needs
/// forward-proxying shares the same pooled connection(s) to that proxy.
pub struct ForwardPool {
    pool: Pool,
    proxy_origin: Origin,
    headers: ProxyHeaders,
}

impl ForwardPool {
    pub fn new(backend: Arc<dyn NetworkBackend>, proxy_origin: Origin, headers: ProxyHeaders) -> ForwardPool {
        ForwardPool {
            // Forward proxying rewrites the request-target into
            // absolute-form over plain HTTP/1.1; there's no ALPN
            // negotiation to offer h2 over in the first place.
            pool: Pool::builder().http2(false).build(backend),
            proxy_origin,
            headers,
        }
    }

    pub async fn send_request(&self, mut request: Request<Box<dyn Body>>) -> Result<Response> {
        request.extensions_mut().proxy_absolute_form = true;
        match &self.headers {
            ProxyHeaders::Auth(auth) => {
                request.headers_mut().insert(PROXY_AUTHORIZATION, auth.clone());
            }
            ProxyHeaders::Extra(extra) => {
                for (name, value) in extra {
                    request.headers_mut().append(name.clone(), value.clone());
                }
            }
            ProxyHeaders::Empty => {}
        }
        self.pool.send_request_to(self.proxy_origin.clone(), request).await
    }

    pub fn close(&self) {
        self.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{MockBackend, Script},
        url::{Scheme, Url},
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
    async fn rewrites_request_target_to_absolute_form_and_adds_proxy_auth() {
        let backend = MockBackend::new(
            Script::new().read(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec()),
        );
        let inspect = backend.clone();
        let proxy_origin = Origin::new(Scheme::Http, "proxy.test", 8080);
        let auth = http::HeaderValue::from_static("Basic dXNlcjpwYXNz");
        let forward = ForwardPool::new(Arc::new(backend), proxy_origin, ProxyHeaders::with_auth(auth));

        forward
            .send_request(get_request("http://origin.test/widgets"))
            .await
            .unwrap();

        let head = String::from_utf8(inspect.writes()[0].clone()).unwrap();
        assert!(head.starts_with("GET http://origin.test/widgets HTTP/1.1\r\n"));
        assert!(head.to_ascii_lowercase().contains("proxy-authorization: basic dxnlcjpwyxnz\r\n"));
    }
}
