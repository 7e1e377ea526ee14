//! A scriptable [`NetworkBackend`] for tests: records writes and plays back
//! scripted reads, hand-rolled rather than pulling in a third-party mocking
//! crate.

use std::{
    collections::VecDeque,
    net::IpAddr,
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
    time::Duration,
};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::{Alpn, BoxedStream, NetworkBackend, NetworkStream, TlsOptions};
use crate::error::{Error, Result};

/// A scripted sequence of reads a [`MockStream`] will play back, and a
/// place recorded writes land so a test can assert on what was sent.
#[derive(Default)]
pub struct Script {
    reads: VecDeque<Vec<u8>>,
    writes: Vec<Vec<u8>>,
    closed: bool,
}

impl Script {
    pub fn new() -> Script {
        Script::default()
    }

    /// Queue a chunk to be handed back from the next `poll_read`.
    pub fn read(mut self, chunk: impl Into<Vec<u8>>) -> Script {
        self.reads.push_back(chunk.into());
        self
    }

    pub fn writes(&self) -> &[Vec<u8>] {
        &self.writes
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

type SharedScript = Arc<Mutex<Script>>;

/// A backend whose `connect_tcp` and `start_tls` always succeed and hand
/// back a [`MockStream`] driven by a caller-supplied [`Script`].
#[derive(Clone)]
pub struct MockBackend {
    script: SharedScript,
    /// When set, `connect_tcp` fails with this error instead of succeeding.
    connect_error: Option<Arc<str>>,
}

impl MockBackend {
    pub fn new(script: Script) -> MockBackend {
        MockBackend {
            script: Arc::new(Mutex::new(script)),
            connect_error: None,
        }
    }

    /// A backend whose `connect_tcp` always fails, for exercising pool
    /// error propagation.
    pub fn failing(reason: &str) -> MockBackend {
        MockBackend {
            script: Arc::new(Mutex::new(Script::new())),
            connect_error: Some(Arc::from(reason)),
        }
    }

    /// Inspect what was written to the stream so far.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.script.lock().unwrap().writes.clone()
    }
}

#[async_trait]
impl NetworkBackend for MockBackend {
    async fn connect_tcp(
        &self,
        _host: &str,
        _port: u16,
        _timeout: Option<Duration>,
        _local_address: Option<IpAddr>,
    ) -> Result<BoxedStream> {
        if let Some(reason) = &self.connect_error {
            return Err(Error::connect(reason.to_string()));
        }
        Ok(Box::pin(MockStream {
            script: self.script.clone(),
        }))
    }

    async fn start_tls(&self, stream: BoxedStream, options: TlsOptions<'_>) -> Result<(BoxedStream, Alpn)> {
        // The mock backend treats "TLS" as a no-op passthrough; it reports
        // whatever protocol the caller offered first, so tests can still
        // exercise both the H2 and HTTP/1.1 negotiation outcomes by
        // controlling `alpn_protocols`.
        let alpn = match options.alpn_protocols.first() {
            Some(&"h2") => Alpn::H2,
            _ => Alpn::Http11,
        };
        Ok((stream, alpn))
    }
}

/// A stream whose reads are served from a [`Script`]'s queue and whose
/// writes are appended to that same script for later inspection.
pub struct MockStream {
    script: SharedScript,
}

impl AsyncRead for MockStream {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let mut script = self.script.lock().unwrap();
        match script.reads.pop_front() {
            Some(chunk) => {
                let n = chunk.len().min(buf.remaining());
                buf.put_slice(&chunk[..n]);
                if n < chunk.len() {
                    // Partial read: put the remainder back at the front.
                    script.reads.push_front(chunk[n..].to_vec());
                }
                Poll::Ready(Ok(()))
            }
            // An empty script plays back as EOF, matching a server that
            // closed the connection after its scripted responses.
            None => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for MockStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        self.script.lock().unwrap().writes.push(buf.to_vec());
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        self.script.lock().unwrap().closed = true;
        Poll::Ready(Ok(()))
    }
}

impl NetworkStream for MockStream {
    fn close(self: Pin<&mut Self>) {
        self.script.lock().unwrap().closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_read_is_played_back() {
        let backend = MockBackend::new(Script::new().read(b"hello".to_vec()));
        let mut stream = backend.connect_tcp("example.test", 80, None, None).await.unwrap();
        let mut buf = [0u8; 16];
        let mut read_buf = ReadBuf::new(&mut buf);
        std::future::poll_fn(|cx| Pin::new(&mut stream).poll_read(cx, &mut read_buf))
            .await
            .unwrap();
        assert_eq!(read_buf.filled(), b"hello");
    }

    #[tokio::test]
    async fn writes_are_recorded() {
        let backend = MockBackend::new(Script::new());
        let mut stream = backend.connect_tcp("example.test", 80, None, None).await.unwrap();
        std::future::poll_fn(|cx| Pin::new(&mut stream).poll_write(cx, b"GET / HTTP/1.1\r\n\r\n"))
            .await
            .unwrap();
        assert_eq!(backend.writes(), vec![b"GET / HTTP/1.1\r\n\r\n".to_vec()]);
    }

    #[tokio::test]
    async fn failing_backend_returns_connect_error() {
        let backend = MockBackend::failing("refused");
        let err = match backend.connect_tcp("example.test", 80, None, None).await {
            Err(e) => e,
            Ok(_) => panic!("expected connect error"),
        };
        assert_eq!(err.kind(), crate::error::Kind::ConnectError);
    }
}
