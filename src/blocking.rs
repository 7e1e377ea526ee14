//! A synchronous surface over [`Pool`]: a thin relay, not a second
//! implementation. A dedicated OS thread runs a current-thread Tokio
//! runtime, fed over an unbounded channel, with every request spawned onto
//! that runtime so a slow response doesn't block the next caller from
//! being picked up.

use std::{sync::Arc, thread};

use log::{error, trace};
use tokio::sync::{mpsc, oneshot};

use crate::{
    backend::NetworkBackend,
    body::Body,
    error::{Error, Result},
    pool::{Builder as PoolBuilder, Pool},
    request::Request,
    response::Response,
};

type Job = (Request<Box<dyn Body>>, oneshot::Sender<Result<Response>>);

/// A blocking handle onto a background [`Pool`]. Cloning shares the same
/// background thread and pool.
#[derive(Clone)]
pub struct BlockingPool {
    inner: Arc<Inner>,
}

struct Inner {
    tx: Option<mpsc::UnboundedSender<Job>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Dropping the sender ends the background `recv` loop; join the
        // thread so its runtime finishes shutting down before we return.
        self.tx.take();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl BlockingPool {
    /// Spawn the background runtime thread and build a [`Pool`] on it from
    /// `make_pool`, called on the runtime thread itself so an async-only
    /// backend (e.g. one that resolves DNS through Tokio) works unmodified.
    pub fn new<F>(make_pool: F) -> Result<BlockingPool>
    where
        F: FnOnce() -> Pool + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

        let thread = thread::Builder::new()
            .name("corehttp-blocking".into())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(Error::runtime(e)));
                        return;
                    }
                };
                rt.block_on(async move {
                    let pool = make_pool();
                    if ready_tx.send(Ok(())).is_err() {
                        return;
                    }
                    while let Some((request, reply)) = rx.recv().await {
                        let pool = pool.clone();
                        tokio::spawn(async move {
                            let result = pool.send_request(request).await;
                            let _ = reply.send(result);
                        });
                    }
                    trace!("blocking pool: runtime thread shutting down");
                });
            })
            .map_err(Error::runtime)?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(Error::runtime("blocking pool runtime thread panicked at startup")),
        }

        Ok(BlockingPool {
            inner: Arc::new(Inner {
                tx: Some(tx),
                thread: Some(thread),
            }),
        })
    }

    /// Build a blocking pool over a [`Pool`] with default configuration.
    pub fn with_backend(backend: Arc<dyn NetworkBackend>) -> Result<BlockingPool> {
        BlockingPool::new(move || Pool::new(backend))
    }

    /// Build a blocking pool from a [`PoolBuilder`](crate::pool::Builder).
    pub fn with_builder(builder: PoolBuilder, backend: Arc<dyn NetworkBackend>) -> Result<BlockingPool> {
        BlockingPool::new(move || builder.build(backend))
    }

    /// Send a request and block the calling thread until the response
    /// headers are ready (the response body still streams lazily, same as
    /// the async surface).
    pub fn send_request(&self, request: Request<Box<dyn Body>>) -> Result<Response> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .tx
            .as_ref()
            .expect("background thread exited early")
            .send((request, reply_tx))
            .map_err(|_| Error::runtime("blocking pool's background thread is gone"))?;

        match reply_rx.blocking_recv() {
            Ok(result) => result,
            Err(_canceled) => {
                error!("blocking pool: background thread dropped the reply channel");
                Err(Error::runtime("blocking pool's background thread panicked"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::{MockBackend, Script}, url::Url};
    use http_body_util::BodyExt;

    fn get_request() -> Request<Box<dyn Body>> {
        let url = Url::parse("http://example.test/").unwrap();
        let body: Box<dyn Body> = Box::new(
            http_body_util::Empty::<bytes::Bytes>::new()
                .map_err(|never: std::convert::Infallible| match never {}),
        );
        Request::new(http::Method::GET, url, body)
    }

    #[test]
    fn relays_a_request_to_the_background_runtime_and_back() {
        let backend = Arc::new(MockBackend::new(
            Script::new().read(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec()),
        ));
        let pool = BlockingPool::with_backend(backend).unwrap();
        let response = pool.send_request(get_request()).unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
    }

    #[test]
    fn dropping_the_pool_joins_the_background_thread() {
        let backend = Arc::new(MockBackend::new(Script::new()));
        let pool = BlockingPool::with_backend(backend).unwrap();
        drop(pool);
    }
}
