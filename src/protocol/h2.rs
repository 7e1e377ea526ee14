//! The HTTP/2 engine: one multiplexed connection driven by the real `h2`
//! crate, serialized through a send-lock around the handshake-produced
//! `SendRequest`.

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::Buf;
use http::Request as HttpRequest;
use http_body::Body as HttpBody;

use super::{HandleResult, ProtocolConnection, Rejected};
use crate::{
    backend::BoxedStream,
    body::{Body, Incoming},
    error::{Error, Result},
    request::Request,
    response::{Response, Version},
};

/// An HTTP/2 connection. `h2` owns the real per-stream state machine
/// (IDLE/OPEN/HALF_CLOSED/CLOSED); this wrapper only tracks what the pool
/// needs to schedule around it — whether GOAWAY has been seen and how many
/// streams are currently open against the peer's advertised limit.
pub struct H2Connection {
    send_request: tokio::sync::Mutex<h2::client::SendRequest<bytes::Bytes>>,
    open_streams: AtomicUsize,
    max_concurrent_streams: AtomicUsize,
    goaway: Arc<AtomicBool>,
    last_idle_at: Mutex<Instant>,
}

const DEFAULT_MAX_CONCURRENT_STREAMS: usize = 100;

impl H2Connection {
    /// Runs the HTTP/2 client handshake over `stream` and spawns the
    /// connection-driving task, matching `h2::client::handshake` +
    /// `tokio::spawn(connection)` as used throughout the `h2` ecosystem.
    pub async fn handshake(stream: BoxedStream) -> Result<H2Connection> {
        let (send_request, connection) = h2::client::Builder::new()
            .enable_push(false)
            .handshake(stream)
            .await
            .map_err(Error::remote_protocol)?;

        let goaway = Arc::new(AtomicBool::new(false));
        let goaway_task = goaway.clone();
        tokio::spawn(async move {
            // `connection` resolving at all means the peer sent GOAWAY or
            // the transport died; either way the connection is done.
            let _ = connection.await;
            goaway_task.store(true, Ordering::SeqCst);
        });

        Ok(H2Connection {
            send_request: tokio::sync::Mutex::new(send_request),
            open_streams: AtomicUsize::new(0),
            max_concurrent_streams: AtomicUsize::new(DEFAULT_MAX_CONCURRENT_STREAMS),
            goaway,
            last_idle_at: Mutex::new(Instant::now()),
        })
    }
}

#[async_trait]
impl ProtocolConnection for H2Connection {
    async fn handle_request(&self, mut request: Request<Box<dyn Body>>) -> HandleResult {
        if self.goaway.load(Ordering::SeqCst) {
            return Err(Rejected::NotAvailable(request));
        }
        if self.open_streams.load(Ordering::SeqCst) >= self.max_concurrent_streams.load(Ordering::SeqCst) {
            return Err(Rejected::NotAvailable(request));
        }

        let http_request = match build_http_request(&request) {
            Ok(r) => r,
            Err(e) => return Err(Rejected::Failed(e)),
        };
        let end_of_stream = request.body().is_end_stream();

        self.open_streams.fetch_add(1, Ordering::SeqCst);
        let result = self.send(http_request, request.body_mut(), end_of_stream).await;
        self.open_streams.fetch_sub(1, Ordering::SeqCst);
        *self.last_idle_at.lock().unwrap() = Instant::now();

        if let Err(ref e) = result {
            if matches!(e.kind(), crate::Kind::RemoteProtocolError) {
                self.goaway.store(true, Ordering::SeqCst);
            }
        }
        result.map_err(Rejected::Failed)
    }

    fn is_available(&self) -> bool {
        !self.goaway.load(Ordering::SeqCst)
            && self.open_streams.load(Ordering::SeqCst) < self.max_concurrent_streams.load(Ordering::SeqCst)
    }

    fn has_expired(&self, keepalive_expiry: Option<Duration>) -> bool {
        match keepalive_expiry {
            Some(expiry) if self.is_idle() => self.last_idle_at.lock().unwrap().elapsed() > expiry,
            _ => false,
        }
    }

    fn idle_since(&self) -> Instant {
        *self.last_idle_at.lock().unwrap()
    }

    fn is_idle(&self) -> bool {
        !self.goaway.load(Ordering::SeqCst) && self.open_streams.load(Ordering::SeqCst) == 0
    }

    fn is_closed(&self) -> bool {
        self.goaway.load(Ordering::SeqCst)
    }

    fn attempt_close(&self) {
        if self.is_idle() {
            self.goaway.store(true, Ordering::SeqCst);
        }
    }

    fn close(&self) {
        self.goaway.store(true, Ordering::SeqCst);
    }

    fn info(&self) -> &'static str {
        "HTTP/2"
    }
}

impl H2Connection {
    async fn send(
        &self,
        http_request: HttpRequest<()>,
        body: &mut Box<dyn Body>,
        end_of_stream: bool,
    ) -> Result<Response> {
        let (response_fut, mut send_stream) = {
            let mut send_request = self.send_request.lock().await;
            send_request
                .send_request(http_request, end_of_stream)
                .map_err(Error::remote_protocol)?
        };

        if !end_of_stream {
            write_request_body(body, &mut send_stream).await?;
        }

        let response = response_fut.await.map_err(Error::remote_protocol)?;
        let (parts, h2_body) = response.into_parts();
        let (incoming, body_done) = read_response_body(h2_body);

        let mut response = Response::new(parts.status, parts.headers, incoming, Version::Http2);
        response.set_body_done(body_done);
        Ok(response)
    }
}

fn build_http_request<B: Body>(request: &Request<B>) -> Result<HttpRequest<()>> {
    let mut builder = HttpRequest::builder()
        .method(request.method().clone())
        .uri(request.url().uri().clone());
    for (name, value) in request.headers() {
        builder = builder.header(name, value);
    }
    builder.body(()).map_err(Error::local_protocol)
}

async fn write_request_body(body: &mut Box<dyn Body>, send_stream: &mut h2::SendStream<bytes::Bytes>) -> Result<()> {
    loop {
        let frame = std::future::poll_fn(|cx| std::pin::Pin::new(&mut **body).poll_frame(cx)).await;
        match frame {
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    send_stream.reserve_capacity(data.remaining());
                    send_stream.send_data(data, false).map_err(Error::local_protocol)?;
                }
            }
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }
    send_stream.send_data(bytes::Bytes::new(), true).map_err(Error::local_protocol)?;
    Ok(())
}

fn read_response_body(mut h2_body: h2::RecvStream) -> (Incoming, tokio::sync::oneshot::Receiver<bool>) {
    let (tx, rx) = tokio::sync::mpsc::channel(4);
    tokio::spawn(async move {
        loop {
            match h2_body.data().await {
                Some(Ok(chunk)) => {
                    let len = chunk.len();
                    let _ = h2_body.flow_control().release_capacity(len);
                    if tx.send(Ok(chunk)).await.is_err() {
                        return;
                    }
                }
                Some(Err(e)) => {
                    let _ = tx.send(Err(Error::remote_protocol(e))).await;
                    return;
                }
                None => return,
            }
        }
    });
    Incoming::channel(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stream_cap_blocks_before_handshake_response() {
        // `max_concurrent_streams` starts at a conservative default and is
        // only ever tightened by a real SETTINGS frame from the peer, which
        // `h2` applies internally — this crate doesn't need to parse
        // SETTINGS itself to stay correct, only to avoid over-issuing before
        // the first one arrives.
        assert_eq!(DEFAULT_MAX_CONCURRENT_STREAMS, 100);
    }
}
