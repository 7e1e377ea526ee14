use std::sync::Arc;

use corehttp::{
    backend::{MockBackend, Script},
    proxy::{tunnel::ProxyHeaders, ProxyPool},
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
async fn forward_and_tunnel_targets_share_one_proxy_pool_without_cross_talk() {
    let backend = Arc::new(MockBackend::new(
        Script::new()
            // the tunnel target's CONNECT handshake
            .read(b"HTTP/1.1 200 Connection Established\r\n\r\n".to_vec())
            // the tunnel target's actual response, post-CONNECT
            .read(b"HTTP/1.1 201 Created\r\n\r\n".to_vec())
            // the forward target's response over the shared proxy connection
            .read(b"HTTP/1.1 204 No Content\r\n\r\n".to_vec()),
    ));
    let proxy = ProxyPool::new(
        backend,
        Origin::new(Scheme::Http, "proxy.test", 3128),
        ProxyHeaders::Empty,
        false,
    );

    let tunneled = proxy.send_request(get_request("https://secure.test/orders")).await.unwrap();
    assert_eq!(tunneled.status(), http::StatusCode::CREATED);

    let forwarded = proxy.send_request(get_request("http://plain.test/status")).await.unwrap();
    assert_eq!(forwarded.status(), http::StatusCode::NO_CONTENT);

    proxy.close();
}

#[tokio::test]
async fn proxy_auth_failure_on_connect_does_not_panic_or_hang() {
    let backend = Arc::new(MockBackend::new(
        Script::new().read(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n".to_vec()),
    ));
    let proxy = ProxyPool::new(
        backend,
        Origin::new(Scheme::Http, "proxy.test", 3128),
        ProxyHeaders::Empty,
        false,
    );

    let err = proxy.send_request(get_request("https://secure.test/orders")).await.unwrap_err();
    assert_eq!(err.kind(), corehttp::Kind::ProxyError);
}
