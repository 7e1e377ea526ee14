//! A Tokio-backed [`NetworkBackend`]: plain TCP plus an optional rustls
//! upgrade, dialing with a timeout over `tokio::net::TcpStream`.

use std::{
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use log::{debug, trace};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use super::{BoxedStream, NetworkBackend, NetworkStream, TlsOptions};
use crate::error::{Error, Result};

/// Connects with plain TCP sockets and (when the `rustls-tls` feature is
/// enabled) performs the TLS handshake with `tokio-rustls`.
#[derive(Clone, Default)]
pub struct TokioBackend {
    #[cfg(feature = "__rustls")]
    tls_config: Arc<std::sync::OnceLock<Arc<rustls::ClientConfig>>>,
}

impl TokioBackend {
    pub fn new() -> TokioBackend {
        TokioBackend::default()
    }

    #[cfg(feature = "__rustls")]
    fn tls_config(&self) -> Arc<rustls::ClientConfig> {
        self.tls_config
            .get_or_init(|| {
                let mut roots = rustls::RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                let mut config = rustls::ClientConfig::builder()
                    .with_root_certificates(roots)
                    .with_no_client_auth();
                config.alpn_protocols = vec![];
                Arc::new(config)
            })
            .clone()
    }
}

#[async_trait::async_trait]
impl NetworkBackend for TokioBackend {
    async fn connect_tcp(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
        local_address: Option<IpAddr>,
    ) -> Result<BoxedStream> {
        trace!("connect_tcp host={host} port={port}");
        let connect = async {
            let addrs = tokio::net::lookup_host((host, port))
                .await
                .map_err(Error::connect)?;
            let mut last_err = None;
            for addr in addrs {
                match connect_one(addr, local_address).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => last_err = Some(e),
                }
            }
            Err(last_err.unwrap_or_else(|| Error::connect("no addresses resolved")))
        };

        let stream = match timeout {
            Some(d) => tokio::time::timeout(d, connect)
                .await
                .map_err(|_| Error::connect_timeout())??,
            None => connect.await?,
        };

        Ok(Box::pin(PlainStream(stream)))
    }

    async fn start_tls(&self, stream: BoxedStream, options: TlsOptions<'_>) -> Result<(BoxedStream, super::Alpn)> {
        #[cfg(feature = "__rustls")]
        {
            use tokio_rustls::TlsConnector;

            let mut config = (*self.tls_config()).clone();
            config.alpn_protocols = options
                .alpn_protocols
                .iter()
                .map(|p| p.as_bytes().to_vec())
                .collect();
            let connector = TlsConnector::from(Arc::new(config));
            let server_name = rustls_pki_types::ServerName::try_from(options.server_hostname.to_owned())
                .map_err(Error::local_protocol)?;

            let handshake = connector.connect(server_name, stream);
            let tls_stream = match options.timeout {
                Some(d) => tokio::time::timeout(d, handshake)
                    .await
                    .map_err(|_| Error::connect_timeout())??,
                None => handshake.await?,
            };
            let alpn = match tls_stream.get_ref().1.alpn_protocol() {
                Some(proto) if proto == b"h2" => super::Alpn::H2,
                _ => super::Alpn::Http11,
            };
            debug!("tls handshake complete, sni={}, alpn={alpn:?}", options.server_hostname);
            Ok((Box::pin(PlainStream(tls_stream)), alpn))
        }

        #[cfg(not(feature = "__rustls"))]
        {
            let _ = (stream, options);
            Err(Error::unsupported_protocol("https (rustls-tls disabled)"))
        }
    }
}

async fn connect_one(addr: SocketAddr, local_address: Option<IpAddr>) -> Result<TcpStream> {
    let socket = match addr {
        SocketAddr::V4(_) => tokio::net::TcpSocket::new_v4(),
        SocketAddr::V6(_) => tokio::net::TcpSocket::new_v6(),
    }
    .map_err(Error::connect)?;

    if let Some(local) = local_address {
        socket
            .bind(SocketAddr::new(local, 0))
            .map_err(Error::connect)?;
    }

    socket.connect(addr).await.map_err(Error::connect)
}

/// Wraps any `AsyncRead + AsyncWrite` transport (plain TCP or TLS) as a
/// [`NetworkStream`], using `shutdown` for the idempotent `close`.
struct PlainStream<T>(T);

impl<T: AsyncRead + Unpin> AsyncRead for PlainStream<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for PlainStream<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().0).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().0).poll_shutdown(cx)
    }
}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> NetworkStream for PlainStream<T> {
    fn close(self: Pin<&mut Self>) {
        // Best-effort: a failed shutdown still leaves the stream unusable,
        // which is all `close` promises.
        let _ = Pin::new(&mut self.get_mut().0).poll_shutdown(&mut Context::from_waker(
            futures_util::task::noop_waker_ref(),
        ));
    }
}
