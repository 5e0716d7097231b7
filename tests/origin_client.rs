use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use bytes::Bytes;
use cachet::{
    config::OriginSettings,
    infra::origin::{Origin, OriginError, OriginRequest, ReqwestOrigin, TimeoutPhase},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpSocket, TcpStream},
};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn settings_for(port: u16) -> OriginSettings {
    OriginSettings {
        scheme: "http".to_string(),
        host: "127.0.0.1".to_string(),
        port,
        connect_timeout: Duration::from_secs(1),
        first_byte_timeout: Duration::from_millis(500),
        between_bytes_timeout: Duration::from_millis(500),
        pool_max_idle_per_host: 4,
    }
}

fn get(target: &str, headers: HeaderMap) -> OriginRequest {
    OriginRequest {
        method: Method::GET,
        path_and_query: target.to_string(),
        headers,
        body: Bytes::new(),
    }
}

#[tokio::test]
async fn forwards_target_with_origin_host_and_without_hop_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bucket/photo.jpg"))
        .and(query_param("X-Amz-Signature", "abc"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("cache-control", "max-age=60")
                .set_body_bytes(b"jpeg".to_vec()),
        )
        .mount(&server)
        .await;

    let origin = ReqwestOrigin::new(&settings_for(server.address().port())).expect("origin");

    let mut headers = HeaderMap::new();
    headers.insert(header::HOST, HeaderValue::from_static("cache.example"));
    headers.insert(header::CONNECTION, HeaderValue::from_static("x-trace"));
    headers.insert("x-trace", HeaderValue::from_static("1"));
    headers.insert(header::ACCEPT, HeaderValue::from_static("image/*"));

    let response = origin
        .fetch(get("/bucket/photo.jpg?X-Amz-Signature=abc", headers))
        .await
        .expect("origin response");

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.body, Bytes::from_static(b"jpeg"));
    assert_eq!(
        response.headers.get(header::CACHE_CONTROL),
        Some(&HeaderValue::from_static("max-age=60"))
    );

    let received = server.received_requests().await.expect("recorded requests");
    assert_eq!(received.len(), 1);
    let forwarded = &received[0];
    assert_eq!(
        forwarded.headers.get("host").and_then(|v| v.to_str().ok()),
        Some(format!("127.0.0.1:{}", server.address().port()).as_str())
    );
    assert!(forwarded.headers.get("x-trace").is_none());
    assert_eq!(
        forwarded.headers.get("accept").and_then(|v| v.to_str().ok()),
        Some("image/*")
    );
}

#[tokio::test]
async fn slow_first_byte_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let origin = ReqwestOrigin::new(&settings_for(server.address().port())).expect("origin");
    let err = origin
        .fetch(get("/slow.png", HeaderMap::new()))
        .await
        .expect_err("timeout");

    assert_eq!(
        err,
        OriginError::Timeout {
            phase: TimeoutPhase::FirstByte
        }
    );
    assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
}

#[tokio::test]
async fn redirects_are_relayed_not_followed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/old.css"))
        .respond_with(ResponseTemplate::new(302).insert_header("location", "/new.css"))
        .mount(&server)
        .await;

    let origin = ReqwestOrigin::new(&settings_for(server.address().port())).expect("origin");
    let response = origin
        .fetch(get("/old.css", HeaderMap::new()))
        .await
        .expect("origin response");

    assert_eq!(response.status, StatusCode::FOUND);
    assert_eq!(
        response.headers.get(header::LOCATION),
        Some(&HeaderValue::from_static("/new.css"))
    );
    assert_eq!(server.received_requests().await.map(|r| r.len()), Some(1));
}

#[tokio::test]
async fn unreachable_origin_is_a_bad_gateway() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        listener.local_addr().expect("addr").port()
    };

    let origin = ReqwestOrigin::new(&settings_for(port)).expect("origin");
    let err = origin
        .fetch(get("/photo.jpg", HeaderMap::new()))
        .await
        .expect_err("connection refused");

    assert!(matches!(err, OriginError::Connect(_)), "unexpected {err:?}");
    assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn request_body_is_forwarded_for_pass_through() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/listings"))
        .respond_with(ResponseTemplate::new(201))
        .mount(&server)
        .await;

    let origin = ReqwestOrigin::new(&settings_for(server.address().port())).expect("origin");
    let response = origin
        .fetch(OriginRequest {
            method: Method::POST,
            path_and_query: "/api/listings".to_string(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"{\"title\":\"bike\"}"),
        })
        .await
        .expect("origin response");

    assert_eq!(response.status, StatusCode::CREATED);
    let received = server.received_requests().await.expect("recorded requests");
    assert_eq!(received[0].body, b"{\"title\":\"bike\"}".to_vec());
}

#[tokio::test]
async fn stalled_body_times_out_between_bytes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut head = [0u8; 2048];
        let _ = socket.read(&mut head).await;
        socket
            .write_all(b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n5\r\nhello\r\n")
            .await
            .expect("write first chunk");
        socket.flush().await.expect("flush");
        tokio::time::sleep(Duration::from_secs(10)).await;
    });

    let settings = OriginSettings {
        between_bytes_timeout: Duration::from_millis(200),
        ..settings_for(port)
    };
    let origin = ReqwestOrigin::new(&settings).expect("origin");
    let err = origin
        .fetch(get("/stream.mp4", HeaderMap::new()))
        .await
        .expect_err("stalled body");

    assert_eq!(
        err,
        OriginError::Timeout {
            phase: TimeoutPhase::BetweenBytes
        }
    );
    assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
    server.abort();
}

/// A listener whose accept queue is full drops new SYNs, so connecting hangs.
#[cfg(target_os = "linux")]
#[tokio::test]
async fn saturated_listener_times_out_while_connecting() {
    let socket = TcpSocket::new_v4().expect("socket");
    socket
        .bind("127.0.0.1:0".parse().expect("addr"))
        .expect("bind");
    let listener = socket.listen(0).expect("listen");
    let addr = listener.local_addr().expect("addr");
    let _queued = TcpStream::connect(addr).await.expect("fill accept queue");

    let settings = OriginSettings {
        connect_timeout: Duration::from_millis(200),
        first_byte_timeout: Duration::from_secs(5),
        ..settings_for(addr.port())
    };
    let origin = ReqwestOrigin::new(&settings).expect("origin");
    let err = origin
        .fetch(get("/photo.jpg", HeaderMap::new()))
        .await
        .expect_err("connect timeout");

    assert_eq!(
        err,
        OriginError::Timeout {
            phase: TimeoutPhase::Connect
        }
    );
    drop(listener);
}
