use std::sync::Arc;

use corehttp::{
    backend::{MockBackend, Script},
    pool::Pool,
    url::{Origin, Scheme, Url},
    Body, Request,
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
async fn keepalive_cap_closes_the_least_recently_used_idle_connection() {
    let backend = Arc::new(MockBackend::new(
        Script::new()
            .read(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec())
            .read(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec())
            .read(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec()),
    ));
    let pool = Pool::builder().max_connections(10).max_keepalive_connections(1).build(backend);

    let a = Origin::new(Scheme::Http, "a.test", 80);
    let b = Origin::new(Scheme::Http, "b.test", 80);

    pool.send_request(get_request(&format!("{a}/"))).await.unwrap();
    // Releasing back to idle happens synchronously once the body (here,
    // empty) is drained, so by the time the second request acquires, the
    // first connection is eligible to be evicted to stay under the cap.
    pool.send_request(get_request(&format!("{b}/"))).await.unwrap();

    let snapshot = pool.connections();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].origin, b);
}

#[tokio::test]
async fn closing_the_pool_fails_every_later_request_without_dialing() {
    let backend = Arc::new(MockBackend::new(
        Script::new().read(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec()),
    ));
    let pool = Pool::new(backend);

    pool.send_request(get_request("http://a.test/")).await.unwrap();
    assert_eq!(pool.connections().len(), 1);

    pool.close();
    assert!(pool.connections().is_empty());

    let err = pool.send_request(get_request("http://b.test/")).await.unwrap_err();
    assert_eq!(err.kind(), corehttp::Kind::RuntimeError);
}

#[tokio::test]
async fn keepalive_cap_is_enforced_across_many_origins_not_just_one() {
    let backend = Arc::new(MockBackend::new(
        Script::new()
            .read(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec())
            .read(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec())
            .read(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n".to_vec()),
    ));
    let pool = Pool::builder().max_connections(10).max_keepalive_connections(2).build(backend);

    for host in ["a.test", "b.test", "c.test"] {
        pool.send_request(get_request(&format!("http://{host}/"))).await.unwrap();
    }

    assert_eq!(
        pool.connections().len(),
        2,
        "pruning must hold the global idle count at the cap, not per-origin"
    );
}
