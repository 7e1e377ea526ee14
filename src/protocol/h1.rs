//! The HTTP/1.1 engine: one in-flight request at a time over one stream.
//! Response parsing uses `httparse`; request serialization is hand-written
//! since `httparse` only parses.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, StatusCode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{HandleResult, ProtocolConnection, Rejected};
use crate::{
    backend::BoxedStream,
    body::{Body, Incoming},
    error::{Error, Result},
    request::Request,
    response::{ReasonPhrase, Response, Version},
};

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_HEADERS: usize = 100;

/// State shared between the connection handle and the background task that
/// streams a response body once `handle_request` has returned the headers.
struct Shared {
    stream: Mutex<Option<BoxedStream>>,
    busy: AtomicBool,
    closed: AtomicBool,
    last_idle_at: Mutex<Instant>,
}

impl Shared {
    fn release(&self, keep_alive: bool) {
        if !keep_alive {
            self.stream.lock().unwrap().take();
            self.closed.store(true, Ordering::SeqCst);
        }
        *self.last_idle_at.lock().unwrap() = Instant::now();
        self.busy.store(false, Ordering::SeqCst);
    }
}

/// An HTTP/1.1 connection. Exactly one request may be in flight, including
/// while its response body is still being drained; a second caller sees
/// [`crate::Kind::ConnectionNotAvailable`] and the pool routes it
/// elsewhere.
pub struct H1Connection {
    shared: Arc<Shared>,
}

impl H1Connection {
    pub fn new(stream: BoxedStream) -> H1Connection {
        H1Connection {
            shared: Arc::new(Shared {
                stream: Mutex::new(Some(stream)),
                busy: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                last_idle_at: Mutex::new(Instant::now()),
            }),
        }
    }
}

#[async_trait]
impl ProtocolConnection for H1Connection {
    async fn handle_request(&self, request: Request<Box<dyn Body>>) -> HandleResult {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(Rejected::NotAvailable(request));
        }
        if self
            .shared
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Rejected::NotAvailable(request));
        }

        match drive(&self.shared, request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.shared.release(false);
                Err(Rejected::Failed(e))
            }
        }
    }

    fn is_available(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst) && !self.shared.busy.load(Ordering::SeqCst)
    }

    fn has_expired(&self, keepalive_expiry: Option<Duration>) -> bool {
        match keepalive_expiry {
            Some(expiry) if self.is_idle() => {
                self.shared.last_idle_at.lock().unwrap().elapsed() > expiry
            }
            _ => false,
        }
    }

    fn idle_since(&self) -> Instant {
        *self.shared.last_idle_at.lock().unwrap()
    }

    fn is_idle(&self) -> bool {
        !self.shared.closed.load(Ordering::SeqCst) && !self.shared.busy.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    fn attempt_close(&self) {
        if self.is_idle() {
            self.shared.stream.lock().unwrap().take();
            self.shared.closed.store(true, Ordering::SeqCst);
        }
    }

    fn close(&self) {
        self.shared.stream.lock().unwrap().take();
        self.shared.closed.store(true, Ordering::SeqCst);
    }

    fn info(&self) -> &'static str {
        "HTTP/1.1"
    }
}

async fn drive(shared: &Arc<Shared>, mut request: Request<Box<dyn Body>>) -> Result<Response> {
    let taken = shared.stream.lock().unwrap().take();
    let mut stream = taken.ok_or_else(Error::connection_not_available)?;

    let head = serialize_request_head(&request)?;
    stream.write_all(&head).await.map_err(Error::write)?;

    let body_bytes = drain_body(request.body_mut()).await?;
    if !body_bytes.is_empty() {
        stream.write_all(&body_bytes).await.map_err(Error::write)?;
    }
    stream.flush().await.map_err(Error::write)?;

    let (response, leftover) = read_response_head(&mut stream).await?;
    let (status, headers, version, reason) = response;
    let keep_alive = !connection_close(&headers);

    let (body, body_done) = spawn_response_body(shared.clone(), stream, &headers, leftover, keep_alive);
    let mut response = Response::new(status, headers, body, version);
    response.set_reason_phrase(reason);
    if let Some(body_done) = body_done {
        response.set_body_done(body_done);
    }
    Ok(response)
}

fn connection_close(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("close"))
        .unwrap_or(false)
}

fn serialize_request_head<B: Body>(request: &Request<B>) -> Result<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(256).writer();
    use std::io::Write;
    if request.extensions().proxy_absolute_form {
        write!(buf, "{} {} HTTP/1.1\r\n", request.method(), request.url().to_uri_string())
            .map_err(Error::local_protocol)?;
    } else {
        write!(buf, "{} {} HTTP/1.1\r\n", request.method(), request.url().target().as_str())
            .map_err(Error::local_protocol)?;
    }
    for (name, value) in request.headers() {
        buf.write_all(name.as_str().as_bytes()).map_err(Error::local_protocol)?;
        buf.write_all(b": ").map_err(Error::local_protocol)?;
        buf.write_all(value.as_bytes()).map_err(Error::local_protocol)?;
        buf.write_all(b"\r\n").map_err(Error::local_protocol)?;
    }
    buf.write_all(b"\r\n").map_err(Error::local_protocol)?;
    Ok(buf.into_inner().to_vec())
}

async fn drain_body(body: &mut Box<dyn Body>) -> Result<Bytes> {
    let mut out = BytesMut::new();
    loop {
        let frame = std::future::poll_fn(|cx| std::pin::Pin::new(&mut **body).poll_frame(cx)).await;
        match frame {
            Some(Ok(frame)) => {
                if let Ok(data) = frame.into_data() {
                    out.extend_from_slice(&data);
                }
            }
            Some(Err(e)) => return Err(e),
            None => break,
        }
    }
    Ok(out.freeze())
}

type ParsedHead = (StatusCode, HeaderMap, Version, ReasonPhrase);

async fn read_response_head(stream: &mut BoxedStream) -> Result<(ParsedHead, Bytes)> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        let mut chunk = [0u8; 4096];
        let n = stream.read(&mut chunk).await.map_err(Error::read)?;
        if n == 0 {
            return Err(Error::remote_protocol("connection closed before response headers"));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_HEADER_BYTES {
            return Err(Error::remote_protocol("response headers too large"));
        }

        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Response::new(&mut raw_headers);
        match parsed.parse(&buf) {
            Ok(httparse::Status::Complete(used)) => {
                let status =
                    StatusCode::from_u16(parsed.code.unwrap_or(0)).map_err(Error::remote_protocol)?;
                let reason = ReasonPhrase(parsed.reason.unwrap_or("").as_bytes().to_vec());
                let mut headers = HeaderMap::new();
                for h in parsed.headers.iter() {
                    let name = http::header::HeaderName::from_bytes(h.name.as_bytes())
                        .map_err(Error::remote_protocol)?;
                    let value = http::HeaderValue::from_bytes(h.value).map_err(Error::remote_protocol)?;
                    headers.append(name, value);
                }
                let leftover = Bytes::copy_from_slice(&buf[used..]);
                return Ok(((status, headers, Version::Http11, reason), leftover));
            }
            Ok(httparse::Status::Partial) => continue,
            Err(e) => return Err(Error::remote_protocol(e)),
        }
    }
}

/// Builds the response [`Incoming`] and, for bodies that must be streamed
/// off the wire, spawns the task that drains it and then returns the
/// stream to `shared` (or closes it) once done.
fn spawn_response_body(
    shared: Arc<Shared>,
    stream: BoxedStream,
    headers: &HeaderMap,
    leftover: Bytes,
    keep_alive: bool,
) -> (Incoming, Option<tokio::sync::oneshot::Receiver<bool>>) {
    let content_length = headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    let chunked = headers
        .get(http::header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("chunked"))
        .unwrap_or(false);

    if content_length == Some(0) && !chunked {
        *shared.stream.lock().unwrap() = Some(stream);
        shared.release(keep_alive);
        return (Incoming::empty(), None);
    }
    if !chunked
        && content_length
            .map(|len| leftover.len() as u64 >= len)
            .unwrap_or(false)
    {
        let len = content_length.unwrap() as usize;
        *shared.stream.lock().unwrap() = Some(stream);
        shared.release(keep_alive);
        return (Incoming::buffered(leftover.slice(0..len)), None);
    }

    // `read_body_task` decides keep-alive for itself, from whether the wire
    // was drained to completion and whether the channel receiver (i.e. the
    // `Incoming`) is still attached — a caller that drops the body early
    // closes the channel, which the task treats the same as a read error.
    let (tx, rx) = tokio::sync::mpsc::channel(4);
    tokio::spawn(read_body_task(
        shared,
        stream,
        leftover,
        content_length,
        chunked,
        keep_alive,
        tx,
    ));
    let (incoming, body_done) = Incoming::channel(rx);
    (incoming, Some(body_done))
}

/// Drains the response body off the wire, then either hands the stream
/// back to `shared` for reuse or closes it, depending on whether the body
/// was read to completion and the response allowed keep-alive.
async fn read_body_task(
    shared: Arc<Shared>,
    mut stream: BoxedStream,
    mut buffered: Bytes,
    content_length: Option<u64>,
    chunked: bool,
    keep_alive: bool,
    tx: tokio::sync::mpsc::Sender<Result<Bytes>>,
) {
    let mut remaining = content_length;
    let drained = loop {
        if !buffered.is_empty() {
            let chunk = std::mem::take(&mut buffered);
            if let Some(r) = remaining.as_mut() {
                *r = r.saturating_sub(chunk.len() as u64);
            }
            if tx.send(Ok(chunk)).await.is_err() {
                break false;
            }
        }
        if !chunked {
            if let Some(0) = remaining {
                break true;
            }
        }
        let mut buf = [0u8; 8192];
        match stream.read(&mut buf).await {
            Ok(0) => break !chunked && remaining.is_none(),
            Ok(n) => buffered = Bytes::copy_from_slice(&buf[..n]),
            Err(e) => {
                let _ = tx.send(Err(Error::read(e))).await;
                break false;
            }
        }
    };

    if drained && keep_alive {
        *shared.stream.lock().unwrap() = Some(stream);
    }
    shared.release(drained && keep_alive);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::{MockBackend, NetworkBackend, Script},
        url::Url,
    };
    use http_body_util::BodyExt;

    fn get_request() -> Request<Box<dyn Body>> {
        let url = Url::parse("http://example.test/hello").unwrap();
        let body: Box<dyn Body> = Box::new(http_body_util::Empty::<Bytes>::new().map_err(
            |never: std::convert::Infallible| match never {},
        ));
        Request::new(http::Method::GET, url, body)
    }

    #[tokio::test]
    async fn serializes_request_line_and_host_header() {
        let request = get_request();
        let head = serialize_request_head(&request).unwrap();
        let text = String::from_utf8(head).unwrap();
        assert!(text.starts_with("GET /hello HTTP/1.1\r\n"));
        assert!(text.to_ascii_lowercase().contains("host: example.test\r\n"));
    }

    #[tokio::test]
    async fn connection_is_busy_until_empty_body_response_completes() {
        let backend = MockBackend::new(
            Script::new().read(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec()),
        );
        let stream = backend.connect_tcp("example.test", 80, None, None).await.unwrap();
        let conn = H1Connection::new(stream);
        assert!(conn.is_available());

        let response = match conn.handle_request(get_request()).await {
            Ok(response) => response,
            Err(_) => panic!("expected response"),
        };
        assert_eq!(response.status(), StatusCode::OK);
        assert!(conn.is_available());
    }

    #[tokio::test]
    async fn second_request_while_busy_is_rejected() {
        let backend = MockBackend::new(Script::new().read(b"HTTP/1.1 200 OK\r\n".to_vec()));
        let stream = backend.connect_tcp("example.test", 80, None, None).await.unwrap();
        let conn = H1Connection::new(stream);
        conn.shared.busy.store(true, Ordering::SeqCst);
        match conn.handle_request(get_request()).await {
            Err(Rejected::NotAvailable(_)) => {}
            other => panic!("expected NotAvailable, got a response or hard failure: {}", other.is_ok()),
        }
    }
}
