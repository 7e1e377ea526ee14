//! The body stream contract. Body *containers* (the equivalent of
//! `http_body_util::Full`/`StreamBody`) are an out-of-scope collaborator —
//! callers bring their own `http_body::Body` impl for request bodies. This
//! module only defines [`Incoming`], the concrete streaming body a
//! [`Response`](crate::Response) hands back, since that type is owned by
//! the protocol engines.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use http_body::{Body as HttpBody, Frame, SizeHint};

use crate::error::Error;

/// Bound used throughout this crate for request bodies: any lazy byte
/// sequence the caller supplies.
pub trait Body: HttpBody<Data = Bytes, Error = Error> + Send + Unpin + 'static {}
impl<T> Body for T where T: HttpBody<Data = Bytes, Error = Error> + Send + Unpin + 'static {}

/// The response body streamed back from a protocol connection.
///
/// Dropping an `Incoming` without reading it to completion or calling
/// [`Incoming::close`] must still release the owning connection. Each
/// protocol engine notifies the owning
/// [`Connection`](crate::connection::Connection) from its own `Drop` impl,
/// not from here; this type only carries bytes.
pub struct Incoming {
    inner: IncomingKind,
    /// Tells the owning connection whether the body was drained to
    /// completion or abandoned partway through. Sent once, either from
    /// `poll_frame` on natural end-of-stream or from `Drop` otherwise.
    release: Option<tokio::sync::oneshot::Sender<bool>>,
}

enum IncomingKind {
    Empty,
    Buffered(Option<Bytes>),
    Channel(tokio::sync::mpsc::Receiver<Result<Bytes, Error>>),
}

impl Incoming {
    pub fn empty() -> Incoming {
        Incoming {
            inner: IncomingKind::Empty,
            release: None,
        }
    }

    pub fn buffered(data: Bytes) -> Incoming {
        Incoming {
            inner: IncomingKind::Buffered(Some(data)),
            release: None,
        }
    }

    /// A streaming body backed by a channel the protocol engine feeds as
    /// frames arrive. Returns the `Incoming` paired with the receiving half
    /// of a one-shot that fires once the body has been drained to
    /// completion or dropped partway through, so the caller (the pool, by
    /// way of [`crate::response::Response::set_body_done`]) can wait for the
    /// wire to actually be free before releasing the connection.
    pub(crate) fn channel(
        rx: tokio::sync::mpsc::Receiver<Result<Bytes, Error>>,
    ) -> (Incoming, tokio::sync::oneshot::Receiver<bool>) {
        let (release_tx, release_rx) = tokio::sync::oneshot::channel();
        (
            Incoming {
                inner: IncomingKind::Channel(rx),
                release: Some(release_tx),
            },
            release_rx,
        )
    }

    fn signal_complete(&mut self, complete: bool) {
        if let Some(tx) = self.release.take() {
            let _ = tx.send(complete);
        }
    }
}

impl Drop for Incoming {
    fn drop(&mut self) {
        self.signal_complete(false);
    }
}

impl HttpBody for Incoming {
    type Data = Bytes;
    type Error = Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Error>>> {
        let this = self.get_mut();
        match &mut this.inner {
            IncomingKind::Empty => Poll::Ready(None),
            IncomingKind::Buffered(slot) => Poll::Ready(slot.take().map(|b| Ok(Frame::data(b)))),
            IncomingKind::Channel(rx) => {
                let poll = Pin::new(rx).poll_recv(cx).map(|opt| opt.map(|r| r.map(Frame::data)));
                if let Poll::Ready(None) = poll {
                    this.signal_complete(true);
                }
                poll
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.inner {
            IncomingKind::Empty => true,
            IncomingKind::Buffered(slot) => slot.is_none(),
            IncomingKind::Channel(_) => false,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.inner {
            IncomingKind::Empty => SizeHint::with_exact(0),
            IncomingKind::Buffered(Some(b)) => SizeHint::with_exact(b.len() as u64),
            IncomingKind::Buffered(None) => SizeHint::with_exact(0),
            IncomingKind::Channel(_) => SizeHint::default(),
        }
    }
}
