//! Structural URL splitting and the [`Origin`] pool key.
//!
//! This intentionally does no normalization beyond what [`http::Uri`]
//! already enforces — percent-decoding, IDNA, and the like are out of
//! scope here.

use std::fmt;

use http::uri::{Authority, PathAndQuery, Scheme as HttpScheme, Uri};

use crate::error::{Error, Result};

/// The two schemes this crate understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn is_secure(self) -> bool {
        matches!(self, Scheme::Https)
    }

    fn parse(s: &HttpScheme) -> Result<Scheme> {
        match s.as_str() {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(Error::unsupported_protocol(other)),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        })
    }
}

/// A structurally-split URL: scheme, host, optional port, and a
/// request-target (path + query). No normalization is performed.
#[derive(Debug, Clone)]
pub struct Url {
    scheme: Scheme,
    host: String,
    port: Option<u16>,
    target: PathAndQuery,
    uri: Uri,
}

impl Url {
    /// Parse an absolute-form URI into its structural parts.
    pub fn parse(s: &str) -> Result<Url> {
        let uri: Uri = s.parse().map_err(Error::local_protocol)?;
        Url::from_uri(uri)
    }

    pub fn from_uri(uri: Uri) -> Result<Url> {
        let scheme = uri
            .scheme()
            .ok_or_else(|| Error::local_protocol("URI is missing a scheme"))?;
        let scheme = Scheme::parse(scheme)?;
        let authority = uri
            .authority()
            .ok_or_else(|| Error::local_protocol("URI is missing an authority"))?;
        let host = authority.host().to_owned();
        let port = authority.port_u16();
        let target = uri
            .path_and_query()
            .cloned()
            .unwrap_or_else(|| PathAndQuery::from_static("/"));
        Ok(Url {
            scheme,
            host,
            port,
            target,
            uri,
        })
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port to actually connect to: the explicit port, or the scheme's
    /// default.
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.scheme.default_port())
    }

    pub fn target(&self) -> &PathAndQuery {
        &self.target
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// The `(scheme, host, port)` tuple used to key the connection pool.
    pub fn origin(&self) -> Origin {
        Origin {
            scheme: self.scheme,
            host: self.host.clone(),
            port: self.port(),
        }
    }

    /// Render this URL back into absolute form, e.g. for a forward proxy's
    /// request-target.
    pub fn to_uri_string(&self) -> String {
        self.uri.to_string()
    }
}

/// `(scheme, host, port)` — two origins are equal iff all three are equal.
/// Used as the connection pool's key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    scheme: Scheme,
    host: String,
    port: u16,
}

impl Origin {
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Origin {
        Origin {
            scheme,
            host: host.into(),
            port,
        }
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Build the bare `host:port` authority, e.g. for a `CONNECT` request
    /// or a `Host` header.
    pub fn authority(&self) -> Result<Authority> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(Error::local_protocol)
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_defaults_port_from_scheme() {
        let a = Url::parse("https://example.com/path").unwrap();
        assert_eq!(a.origin(), Origin::new(Scheme::Https, "example.com", 443));

        let b = Url::parse("http://example.com").unwrap();
        assert_eq!(b.origin(), Origin::new(Scheme::Http, "example.com", 80));
    }

    #[test]
    fn origin_equality_needs_all_three_fields() {
        let a = Origin::new(Scheme::Https, "example.com", 443);
        let b = Origin::new(Scheme::Https, "example.com", 8443);
        let c = Origin::new(Scheme::Http, "example.com", 443);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn round_trip_origin_of_parse_of_str() {
        let u = Url::parse("https://example.com:9443/a/b?q=1").unwrap();
        let reparsed = Url::parse(&u.to_uri_string()).unwrap();
        assert_eq!(u.origin(), reparsed.origin());
    }

    #[test]
    fn explicit_port_is_kept_even_if_default() {
        let u = Url::parse("https://example.com:443/").unwrap();
        assert_eq!(u.origin().port(), 443);
    }
}
