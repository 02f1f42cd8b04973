//! Reverse-proxy behaviour against mock upstreams.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use url::Url;

use common::{
    closed_port, dechunk, raw_exchange, read_request, read_response, start_backend, start_flaky_backend,
    start_interim_backend, start_server, test_config, Framing, RawResponse,
};
use edge_relay::config::{RouteConfig, RouteKind, ServerConfig};
use edge_relay::http::Request;
use edge_relay::proxy::{ConnectionPool, Interceptor, PoolKey, ProxyRoute, ResponseHead};
use edge_relay::resilience::retries::RetryPolicy;
use edge_relay::routing::RouteHandler;

fn proxy_config(target: String) -> ServerConfig {
    let mut config = test_config();
    config.proxy.base_delay_ms = 10;
    config.proxy.max_delay_ms = 50;
    config.routes = vec![RouteConfig {
        domain: None,
        path: "/api/*".into(),
        kind: RouteKind::Proxy { target },
    }];
    config
}

#[tokio::test]
async fn keep_alive_upstream_is_reused() {
    let backend = start_backend(Framing::KeepAlive, |head, _| {
        head.lines().next().unwrap_or_default().to_string()
    })
    .await;
    let (running, _shutdown) = start_server(proxy_config(format!("http://{}/v1", backend.addr))).await;

    let mut client = TcpStream::connect(running.http_addr).await.unwrap();
    for path in ["users/7", "users/8?full=1"] {
        client
            .write_all(format!("GET /api/{} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).as_bytes())
            .await
            .unwrap();
        let response = read_response(&mut client).await;
        assert_eq!(response.status(), 200);
        assert_eq!(response.body_text(), format!("GET /v1/{} HTTP/1.1", path));
    }
    assert_eq!(backend.connections(), 1);
}

#[tokio::test]
async fn unframed_upstream_forces_new_connection() {
    let backend = start_backend(Framing::UntilClose, |_, _| "until eof".to_string()).await;
    let (running, _shutdown) = start_server(proxy_config(format!("http://{}/", backend.addr))).await;

    for _ in 0..2 {
        let raw = raw_exchange(running.http_addr, b"GET /api/x HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
        let response = RawResponse::parse(&raw);
        assert_eq!(response.status(), 200);
        assert_eq!(response.body_text(), "until eof");
    }
    assert_eq!(backend.connections(), 2);
}

#[tokio::test]
async fn chunked_upstream_is_relayed_verbatim() {
    let backend = start_backend(Framing::Chunked, |_, _| "abcdefghij".to_string()).await;
    let (running, _shutdown) = start_server(proxy_config(format!("http://{}/", backend.addr))).await;

    let raw = raw_exchange(
        running.http_addr,
        b"GET /api/x HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    let response = RawResponse::parse(&raw);
    assert_eq!(response.header("transfer-encoding").as_deref(), Some("chunked"));
    assert_eq!(dechunk(&response.body), b"abcdefghij");
}

#[tokio::test]
async fn request_body_and_forwarded_headers_reach_upstream() {
    let seen = Arc::new(Mutex::new(String::new()));
    let log = Arc::clone(&seen);
    let backend = start_backend(Framing::KeepAlive, move |head, body| {
        *log.lock().unwrap() = head.to_string();
        String::from_utf8_lossy(body).into_owned()
    })
    .await;
    let (running, _shutdown) = start_server(proxy_config(format!("http://{}/", backend.addr))).await;

    let raw = raw_exchange(
        running.http_addr,
        b"POST /api/echo HTTP/1.1\r\nHost: public.example\r\nX-Forwarded-For: 198.51.100.1\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello",
    )
    .await;
    assert_eq!(RawResponse::parse(&raw).body_text(), "hello");

    let head = seen.lock().unwrap().clone();
    assert!(head.starts_with("POST /echo HTTP/1.1\r\n"));
    assert!(head.contains(&format!("Host: {}\r\n", backend.addr)));
    assert!(head.contains("X-Forwarded-For: 198.51.100.1, 127.0.0.1\r\n"));
    assert!(head.contains("X-Forwarded-Proto: http\r\n"));
    assert!(head.contains("X-Forwarded-Host: public.example\r\n"));
    assert!(head.contains("X-Request-Id: "));
}

#[tokio::test]
async fn dropped_first_connection_is_retried() {
    let backend = start_flaky_backend(1, "second time lucky").await;
    let (running, _shutdown) = start_server(proxy_config(format!("http://{}/", backend.addr))).await;

    let raw = raw_exchange(
        running.http_addr,
        b"GET /api/x HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    let response = RawResponse::parse(&raw);
    assert_eq!(response.status(), 200);
    assert_eq!(response.body_text(), "second time lucky");
    assert_eq!(backend.connections(), 2);
}

#[tokio::test]
async fn dead_upstream_yields_proxy_error() {
    let addr = closed_port().await;
    let (running, _shutdown) = start_server(proxy_config(format!("http://{}/", addr))).await;

    let raw = raw_exchange(
        running.http_addr,
        b"GET /api/x HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    let response = RawResponse::parse(&raw);
    assert_eq!(response.status(), 500);
    assert_eq!(response.body_text(), "Proxy error");
}

#[tokio::test]
async fn interceptor_rewrites_matching_bodies() {
    let backend = start_backend(Framing::Chunked, |head, _| {
        if head.contains("/page") {
            "<title>upstream</title>".to_string()
        } else {
            "untouched".to_string()
        }
    })
    .await;
    let (running, _shutdown) = start_server(test_config()).await;

    let pool = Arc::new(ConnectionPool::new(Duration::from_secs(30), Duration::from_secs(1)));
    let target = Url::parse(&format!("http://{}/", backend.addr)).unwrap();
    let route = ProxyRoute::new(target, pool, RetryPolicy::default(), true)
        .unwrap()
        .with_interceptor(Interceptor {
            matches: Arc::new(|request: &Request, _: &ResponseHead| request.path.ends_with("/page")),
            rewrite: Arc::new(|_: &Request, _: &ResponseHead, body: Bytes| {
                let text = String::from_utf8_lossy(&body).replace("upstream", "rewritten");
                Bytes::from(text)
            }),
        });
    running.routes.add(None, "/site/*", RouteHandler::from_handler(route));

    let mut client = TcpStream::connect(running.http_addr).await.unwrap();
    client
        .write_all(b"GET /site/page HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let response = read_response(&mut client).await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.header("content-length").as_deref(), Some("24"));
    assert_eq!(response.body_text(), "<title>rewritten</title>");

    let raw = raw_exchange(
        running.http_addr,
        b"GET /site/other HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(dechunk(&RawResponse::parse(&raw).body), b"untouched");
}

#[tokio::test]
async fn interim_continue_is_not_relayed() {
    let backend = start_interim_backend("ready").await;
    let (running, _shutdown) = start_server(proxy_config(format!("http://{}/", backend.addr))).await;

    let mut client = TcpStream::connect(running.http_addr).await.unwrap();
    for _ in 0..2 {
        client
            .write_all(b"GET /api/job HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let response = read_response(&mut client).await;
        assert_eq!(response.status(), 200);
        assert_eq!(response.body_text(), "ready");
    }
    assert_eq!(backend.connections(), 1);
}

#[tokio::test]
async fn encoded_path_reaches_upstream_unchanged() {
    let backend = start_backend(Framing::KeepAlive, |head, _| {
        head.lines().next().unwrap_or_default().to_string()
    })
    .await;
    let (running, _shutdown) = start_server(proxy_config(format!("http://{}/", backend.addr))).await;

    let raw = raw_exchange(
        running.http_addr,
        b"GET /api/a%2Fb/%C3%A9?q=%20 HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    )
    .await;
    assert_eq!(
        RawResponse::parse(&raw).body_text(),
        "GET /a%2Fb/%C3%A9?q=%20 HTTP/1.1"
    );
}

#[tokio::test]
async fn client_disconnect_releases_upstream_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let upstream = listener.local_addr().unwrap();
    let (seen_tx, seen_rx) = oneshot::channel();
    let (closed_tx, closed_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut socket).await;
        let _ = seen_tx.send(());
        let mut byte = [0u8; 1];
        let n = socket.read(&mut byte).await.unwrap_or(0);
        let _ = closed_tx.send(n);
    });

    let mut config = proxy_config(format!("http://{}/", upstream));
    config.timeouts.request_secs = 60;
    let (running, _shutdown) = start_server(config).await;

    let mut client = TcpStream::connect(running.http_addr).await.unwrap();
    client
        .write_all(b"GET /api/slow HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    seen_rx.await.unwrap();
    drop(client);

    let n = tokio::time::timeout(Duration::from_secs(3), closed_rx)
        .await
        .expect("upstream connection still held after client left")
        .unwrap();
    assert_eq!(n, 0);

    let key = PoolKey {
        host: "127.0.0.1".into(),
        port: upstream.port(),
        tls: false,
    };
    assert_eq!(running.pool.idle_count(&key), 0);
}
