//! The [`Request`] type and its extensions.

use std::time::Duration;

use http::{HeaderMap, Method};

use crate::{
    body::Body,
    url::{Origin, Url},
};

/// Per-phase timeouts recognized under the `timeout` extension key.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timeouts {
    pub connect: Option<Duration>,
    pub read: Option<Duration>,
    pub write: Option<Duration>,
    pub pool: Option<Duration>,
}

/// Request extensions the pool and protocol engines recognize. Unlike
/// [`http::Extensions`], this is a closed, typed set of recognized keys
/// rather than an open type map.
#[derive(Debug, Clone, Default)]
pub struct Extensions {
    pub timeouts: Timeouts,
    /// Overrides the TLS SNI hostname (defaults to the origin host).
    pub sni_hostname: Option<String>,
    /// Forces (`Some(true)`) or forbids (`Some(false)`) HTTP/2 for this
    /// request; `None` defers to the pool's configuration.
    pub http2: Option<bool>,
    /// Set by [`crate::proxy::forward::ForwardPool`] so the HTTP/1.1 engine
    /// serializes the request-target in absolute-form instead of
    /// path-and-query.
    pub proxy_absolute_form: bool,
}

/// An HTTP request bound for a pooled connection.
///
/// The `Host` header is synthesized from the URL at construction time if
/// the caller didn't set one.
pub struct Request<B> {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: B,
    extensions: Extensions,
}

impl<B: Body> Request<B> {
    pub fn new(method: Method, url: Url, body: B) -> Request<B> {
        let mut headers = HeaderMap::new();
        if let Ok(host) = origin_host_header(&url) {
            headers.insert(http::header::HOST, host);
        }
        Request {
            method,
            url,
            headers,
            body,
            extensions: Extensions::default(),
        }
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn origin(&self) -> Origin {
        self.url.origin()
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    pub fn body(&self) -> &B {
        &self.body
    }

    pub fn body_mut(&mut self) -> &mut B {
        &mut self.body
    }

    pub fn into_body(self) -> B {
        self.body
    }

    /// Rewrite the request's URL in place, preserving headers, body, and
    /// extensions — used by the forward proxy to rewrite the request-target
    /// to absolute-form and by the tunnel proxy to swap in the `CONNECT`
    /// target.
    pub fn set_url(&mut self, url: Url) {
        self.url = url;
    }
}

fn origin_host_header(url: &Url) -> Result<http::HeaderValue, http::header::InvalidHeaderValue> {
    let origin = url.origin();
    let needs_port = !matches!(
        (origin.scheme().is_secure(), origin.port()),
        (true, 443) | (false, 80)
    );
    if needs_port {
        http::HeaderValue::from_str(&format!("{}:{}", origin.host(), origin.port()))
    } else {
        http::HeaderValue::from_str(origin.host())
    }
}
