//! End-to-end tests: a real listener in front of in-process hyper backends.

use super::{ProxyServer, ReverseProxy};
use crate::config::{Config, RouteConfig, ServiceDiscoveryConfig};
use crate::discovery::tests::ScriptedDiscovery;
use crate::host_list::HostList;
use crate::liveness::HostStatusRegistry;
use crate::metrics;
use crate::route::RouteRuntime;
use crate::session::{AuthToken, Session};
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

async fn spawn_backend<F, Fut>(handler: F) -> SocketAddr
where
    F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let handler = Arc::clone(&handler);
                    async move { Ok::<_, Infallible>((*handler)(req).await) }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .with_upgrades()
                    .await;
            });
        }
    });
    addr
}

/// Backend that describes the request it received as JSON.
async fn echo(req: Request<Incoming>) -> Response<Full<Bytes>> {
    let (parts, body) = req.into_parts();
    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };
    let body = body.collect().await.map(|b| b.to_bytes()).unwrap_or_default();

    let echoed = serde_json::json!({
        "method": parts.method.as_str(),
        "uri": parts.uri.to_string(),
        "host": header("host"),
        "user_agent": header("user-agent"),
        "forwarded_for": header("x-forwarded-for"),
        "x_foo": parts.headers.contains_key("x-foo"),
        "x_bar": header("x-bar"),
        "body": String::from_utf8_lossy(&body),
    });
    Response::new(Full::new(Bytes::from(echoed.to_string())))
}

fn status_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

fn config(routes: &str) -> Config {
    Config::from_yaml(&format!("listen:\n  port: 0\nroutes:\n{routes}")).unwrap()
}

fn route_config(routes: &str) -> RouteConfig {
    config(routes).routes.remove(0)
}

async fn spawn_proxy(config: Config, proxy: Option<ReverseProxy>) -> SocketAddr {
    let proxy =
        proxy.unwrap_or_else(|| ReverseProxy::new(config.proxy.clone(), &config.connection_pool));
    let server = ProxyServer::with_proxy(config, proxy).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener, CancellationToken::new()));
    addr
}

fn client() -> Client<HttpConnector, Full<Bytes>> {
    Client::builder(TokioExecutor::new()).build_http()
}

async fn send(req: Request<Full<Bytes>>) -> (StatusCode, HeaderMap, String) {
    let response = client().request(req).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8(body.to_vec()).unwrap())
}

async fn get(url: String) -> (StatusCode, HeaderMap, String) {
    send(Request::get(url).body(Full::new(Bytes::new())).unwrap()).await
}

#[tokio::test]
async fn test_static_route_joins_path_and_query() {
    let backend = spawn_backend(echo).await;
    let proxy = spawn_proxy(
        config(&format!(
            r#"
  - id: "orders"
    listen_path: "/api/"
    strip_listen_path: true
    routing:
      mode: static
      target_url: "http://{backend}/base?key=1"
"#
        )),
        None,
    )
    .await;

    let (status, _, body) = get(format!("http://{proxy}/api/users?page=2")).await;
    assert_eq!(status, StatusCode::OK);

    let echoed: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(echoed["uri"], "/base/users?key=1&page=2");
    assert_eq!(echoed["host"], backend.to_string());
    assert_eq!(echoed["forwarded_for"], "127.0.0.1");
    assert!(echoed["user_agent"]
        .as_str()
        .unwrap()
        .starts_with("portcullis/"));
}

#[tokio::test]
async fn test_forwarded_for_chain_and_body() {
    let backend = spawn_backend(echo).await;
    let proxy = spawn_proxy(
        config(&format!(
            r#"
  - id: "echo"
    listen_path: "/"
    routing:
      mode: static
      target_url: "http://{backend}"
"#
        )),
        None,
    )
    .await;

    let req = Request::post(format!("http://{proxy}/submit"))
        .header("x-forwarded-for", "203.0.113.7")
        .header("user-agent", "integration/1.0")
        .body(Full::new(Bytes::from_static(b"hello upstream")))
        .unwrap();
    let (status, _, body) = send(req).await;
    assert_eq!(status, StatusCode::OK);

    let echoed: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(echoed["method"], "POST");
    assert_eq!(echoed["uri"], "/submit");
    assert_eq!(echoed["forwarded_for"], "203.0.113.7, 127.0.0.1");
    assert_eq!(echoed["user_agent"], "integration/1.0");
    assert_eq!(echoed["body"], "hello upstream");
}

#[tokio::test]
async fn test_hop_by_hop_headers_are_stripped() {
    let backend = spawn_backend(|req: Request<Incoming>| async move {
        let mut response = echo(req).await;
        response
            .headers_mut()
            .insert("x-internal", HeaderValue::from_static("secret"));
        response
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("x-internal"));
        response
    })
    .await;
    let proxy = spawn_proxy(
        config(&format!(
            r#"
  - id: "hops"
    listen_path: "/"
    routing:
      mode: static
      target_url: "http://{backend}"
"#
        )),
        None,
    )
    .await;

    let req = Request::get(format!("http://{proxy}/hops"))
        .header("connection", "X-Foo")
        .header("x-foo", "1")
        .header("x-bar", "2")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let (status, headers, body) = send(req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(headers.get("x-internal").is_none());

    let echoed: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(echoed["x_foo"], false);
    assert_eq!(echoed["x_bar"], "2");
}

#[tokio::test]
async fn test_unmatched_route_is_not_found() {
    let backend = spawn_backend(echo).await;
    let proxy = spawn_proxy(
        config(&format!(
            r#"
  - id: "orders"
    listen_path: "/orders/"
    routing:
      mode: static
      target_url: "http://{backend}"
"#
        )),
        None,
    )
    .await;

    let (status, headers, body) = get(format!("http://{proxy}/ordersx")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(headers.get(header::CONTENT_TYPE).unwrap(), "application/json");
    assert_eq!(body, r#"{"error":"Not found"}"#);
}

#[tokio::test]
async fn test_breaker_short_circuits_after_threshold() {
    let hits = Arc::new(AtomicUsize::new(0));
    let failing = |hits: Arc<AtomicUsize>| {
        move |_req: Request<Incoming>| {
            let hits = Arc::clone(&hits);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                status_response(StatusCode::INTERNAL_SERVER_ERROR, "boom")
            }
        }
    };
    let backend0 = spawn_backend(failing(Arc::clone(&hits))).await;
    let backend1 = spawn_backend(failing(Arc::clone(&hits))).await;

    let proxy = spawn_proxy(
        config(&format!(
            r#"
  - id: "checkout"
    listen_path: "/"
    routing:
      mode: load_balanced
      targets: ["{backend0}", "{backend1}"]
    circuit_breakers:
      - path: "/checkout"
        failure_threshold: 3
        return_to_service_after_secs: 60
"#
        )),
        None,
    )
    .await;

    for _ in 0..3 {
        let (status, _, body) = get(format!("http://{proxy}/checkout")).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body, "boom");
    }
    assert_eq!(hits.load(Ordering::SeqCst), 3);

    let (status, _, body) = get(format!("http://{proxy}/checkout")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body, r#"{"error":"Service temporarily unavailable."}"#);
    assert_eq!(hits.load(Ordering::SeqCst), 3);

    // Paths outside the breaker pattern are unaffected.
    let (status, _, _) = get(format!("http://{proxy}/other")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(hits.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_load_balancer_skips_hosts_marked_down() {
    let named = |name: &'static str| {
        move |_req: Request<Incoming>| async move { status_response(StatusCode::OK, name) }
    };
    let backend0 = spawn_backend(named("zero")).await;
    let backend1 = spawn_backend(named("one")).await;

    let config = config(&format!(
        r#"
  - id: "users"
    listen_path: "/"
    check_host_against_uptime_tests: true
    routing:
      mode: load_balanced
      targets: ["{backend0}", "{backend1}"]
"#
    ));
    let liveness = Arc::new(HostStatusRegistry::new());
    liveness.mark_down(format!("http://{backend0}"));
    let reverse_proxy = ReverseProxy::new(config.proxy.clone(), &config.connection_pool)
        .with_host_checker(liveness);
    let proxy = spawn_proxy(config, Some(reverse_proxy)).await;

    for _ in 0..4 {
        let (status, _, body) = get(format!("http://{proxy}/users")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "one");
    }
}

#[tokio::test]
async fn test_discovery_keeps_last_good_hosts() {
    let backend = spawn_backend(|_req: Request<Incoming>| async {
        status_response(StatusCode::OK, "discovered")
    })
    .await;

    let config = config(
        r#"
  - id: "search"
    listen_path: "/"
    routing:
      mode: service_discovery
      query_endpoint: "search-service"
      load_balancing: true
      cache_timeout_secs: 0
"#,
    );
    let discovery = Arc::new(ScriptedDiscovery::new(vec![
        Ok(HostList::new([backend.to_string()])),
        Err(anyhow::anyhow!("registry unavailable")),
    ]));
    let reverse_proxy = ReverseProxy::new(config.proxy.clone(), &config.connection_pool)
        .with_discovery(discovery.clone());
    let proxy = spawn_proxy(config, Some(reverse_proxy)).await;

    for _ in 0..3 {
        let (status, _, body) = get(format!("http://{proxy}/query")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "discovered");
    }
    assert_eq!(discovery.calls(), 3);
}

#[tokio::test]
async fn test_discovery_failure_without_hosts_is_internal_error() {
    let config = config(
        r#"
  - id: "search"
    listen_path: "/"
    routing:
      mode: service_discovery
      query_endpoint: "search-service"
"#,
    );
    let discovery = Arc::new(ScriptedDiscovery::new(vec![Err(anyhow::anyhow!(
        "registry unavailable"
    ))]));
    let reverse_proxy = ReverseProxy::new(config.proxy.clone(), &config.connection_pool)
        .with_discovery(discovery);
    let proxy = spawn_proxy(config, Some(reverse_proxy)).await;

    let (status, _, body) = get(format!("http://{proxy}/query")).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, r#"{"error":"There was a problem proxying the request"}"#);
    assert!(!body.contains("registry"));
}

#[tokio::test]
async fn test_hard_timeout_returns_request_timeout() {
    let backend = spawn_backend(|_req: Request<Incoming>| async {
        tokio::time::sleep(Duration::from_secs(3)).await;
        status_response(StatusCode::OK, "too late")
    })
    .await;
    let proxy = spawn_proxy(
        config(&format!(
            r#"
  - id: "slow"
    listen_path: "/api/"
    strip_listen_path: true
    routing:
      mode: static
      target_url: "http://{backend}"
    enforced_timeouts:
      - method: GET
        path: "/slow"
        timeout_secs: 1
"#
        )),
        None,
    )
    .await;

    let (status, _, body) = get(format!("http://{proxy}/api/slow")).await;
    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    assert_eq!(body, r#"{"error":"Upstream service reached hard timeout."}"#);
}

#[tokio::test]
async fn test_close_connections_header() {
    let backend = spawn_backend(echo).await;
    let proxy = spawn_proxy(
        Config::from_yaml(&format!(
            r#"
listen:
  port: 0
proxy:
  close_connections: true
  flush_interval_ms: 5
routes:
  - id: "echo"
    listen_path: "/"
    routing:
      mode: static
      target_url: "http://{backend}"
"#
        ))
        .unwrap(),
        None,
    )
    .await;

    let (status, headers, body) = get(format!("http://{proxy}/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(headers.get(header::CONNECTION).unwrap(), "close");
    assert!(body.contains("\"uri\":\"/\""));
}

#[tokio::test]
async fn test_websocket_upgrade_is_tunnelled() {
    let backend = spawn_backend(|mut req: Request<Incoming>| async move {
        let has_upgrade = req.headers().get(header::UPGRADE).is_some();
        let upgrade = hyper::upgrade::on(&mut req);
        tokio::spawn(async move {
            if let Ok(upgraded) = upgrade.await {
                let mut io = TokioIo::new(upgraded);
                let mut buf = [0u8; 4];
                if io.read_exact(&mut buf).await.is_ok() {
                    let _ = io.write_all(&buf).await;
                }
            }
        });

        if !has_upgrade {
            return status_response(StatusCode::BAD_REQUEST, "no upgrade header");
        }
        let mut response = status_response(StatusCode::SWITCHING_PROTOCOLS, "");
        response
            .headers_mut()
            .insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        response
            .headers_mut()
            .insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        response
    })
    .await;
    let proxy = spawn_proxy(
        config(&format!(
            r#"
  - id: "chat"
    listen_path: "/"
    routing:
      mode: static
      target_url: "http://{backend}"
"#
        )),
        None,
    )
    .await;

    tokio::time::timeout(Duration::from_secs(5), async {
        let mut stream = TcpStream::connect(proxy).await.unwrap();
        stream
            .write_all(
                b"GET /ws HTTP/1.1\r\nHost: gateway\r\nConnection: Upgrade\r\nUpgrade: websocket\r\n\r\n",
            )
            .await
            .unwrap();

        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("HTTP/1.1 101"), "{head}");

        stream.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_cache_mode_returns_captured_response() {
    let backend = spawn_backend(|_req: Request<Incoming>| async {
        let mut response = status_response(StatusCode::CREATED, "cache me");
        response
            .headers_mut()
            .insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        response
    })
    .await;

    let route = RouteRuntime::new(
        route_config(&format!(
            r#"
  - id: "reports"
    listen_path: "/"
    response_handlers_active: true
    response_headers:
      x-served-by: "portcullis"
    routing:
      mode: static
      target_url: "http://{backend}"
"#
        )),
        &ServiceDiscoveryConfig::default(),
    )
    .unwrap();
    let config = config("  []\n");
    let proxy = ReverseProxy::new(config.proxy.clone(), &config.connection_pool);

    let req = Request::get("/report")
        .extension(Session {
            alias: "alice".to_string(),
            quota_max: 1000,
            quota_remaining: 999,
            quota_renews: 1_700_000_000,
        })
        .extension(AuthToken("secret-token-1234".to_string()))
        .body(Full::new(Bytes::new()))
        .unwrap();

    let (response, captured) = proxy.serve_for_cache(&route, req).await;
    let captured = captured.unwrap();
    assert_eq!(captured.status, StatusCode::CREATED);
    assert_eq!(captured.body().as_ref(), b"cache me");
    assert_eq!(captured.content_length, Some(8));

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers().get("x-served-by").unwrap(), "portcullis");
    assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "1000");
    assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "999");
    assert_eq!(response.headers().get("x-ratelimit-reset").unwrap(), "1700000000");

    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.as_ref(), b"cache me");
}

#[tokio::test]
async fn test_serve_without_session_has_no_rate_limit_headers() {
    let backend = spawn_backend(echo).await;
    let route = RouteRuntime::new(
        route_config(&format!(
            r#"
  - id: "plain"
    listen_path: "/"
    routing:
      mode: static
      target_url: "http://{backend}"
"#
        )),
        &ServiceDiscoveryConfig::default(),
    )
    .unwrap();
    let config = config("  []\n");
    let proxy = ReverseProxy::new(config.proxy.clone(), &config.connection_pool);

    let response = proxy
        .serve(&route, Request::get("/x").body(Full::new(Bytes::new())).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-ratelimit-limit").is_none());
}

#[tokio::test]
#[traced_test]
async fn test_upstream_error_logs_redacted_token() {
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);

    let route = RouteRuntime::new(
        route_config(&format!(
            r#"
  - id: "down"
    org_id: "acme"
    listen_path: "/"
    routing:
      mode: static
      target_url: "http://{addr}"
"#
        )),
        &ServiceDiscoveryConfig::default(),
    )
    .unwrap();
    let config = config("  []\n");
    let proxy = ReverseProxy::new(config.proxy.clone(), &config.connection_pool);

    let req = Request::get("/x")
        .extension(AuthToken("secret-token-1234".to_string()))
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = proxy.serve(&route, req).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

    assert!(logs_contain("http: proxy error"));
    assert!(logs_contain("****1234"));
    assert!(!logs_contain("secret-token-1234"));
}

#[tokio::test]
async fn test_client_disconnect_cancels_backend_call() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend = listener.local_addr().unwrap();
    let (received_tx, received_rx) = oneshot::channel();
    let (closed_tx, closed_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let mut head = Vec::new();
        while !head.windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => head.extend_from_slice(&buf[..n]),
            }
        }
        let _ = received_tx.send(());
        // Never answer; the proxy must hang up on its own.
        let hung_up = matches!(stream.read(&mut buf).await, Ok(0) | Err(_));
        let _ = closed_tx.send(hung_up);
    });

    let route = Arc::new(
        RouteRuntime::new(
            route_config(&format!(
                r#"
  - id: "slow"
    listen_path: "/"
    routing:
      mode: static
      target_url: "http://{backend}"
"#
            )),
            &ServiceDiscoveryConfig::default(),
        )
        .unwrap(),
    );
    let config = config("  []\n");
    let proxy = Arc::new(ReverseProxy::new(config.proxy.clone(), &config.connection_pool));

    let request = tokio::spawn(async move {
        proxy
            .serve(&route, Request::get("/report").body(Full::new(Bytes::new())).unwrap())
            .await
    });
    tokio::time::timeout(Duration::from_secs(5), received_rx)
        .await
        .expect("backend never received the request")
        .unwrap();

    request.abort();
    assert!(request.await.unwrap_err().is_cancelled());

    let hung_up = tokio::time::timeout(Duration::from_secs(2), closed_rx)
        .await
        .expect("backend call outlived the client")
        .unwrap();
    assert!(hung_up);
}

#[tokio::test]
async fn test_aborted_half_open_request_does_not_wedge_breaker() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let backend = spawn_backend(move |_req: Request<Incoming>| {
        let hit = counter.fetch_add(1, Ordering::SeqCst) + 1;
        async move {
            match hit {
                1 => status_response(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
                2 => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    status_response(StatusCode::OK, "too late")
                }
                _ => status_response(StatusCode::OK, "recovered"),
            }
        }
    })
    .await;

    let route = Arc::new(
        RouteRuntime::new(
            route_config(&format!(
                r#"
  - id: "checkout-probe"
    listen_path: "/"
    routing:
      mode: static
      target_url: "http://{backend}"
    circuit_breakers:
      - path: "/checkout"
        failure_threshold: 1
        return_to_service_after_secs: 1
"#
            )),
            &ServiceDiscoveryConfig::default(),
        )
        .unwrap(),
    );
    let config = config("  []\n");
    let proxy = Arc::new(ReverseProxy::new(config.proxy.clone(), &config.connection_pool));
    let checkout = || Request::get("/checkout").body(Full::new(Bytes::new())).unwrap();

    assert_eq!(
        proxy.serve(&route, checkout()).await.status(),
        StatusCode::INTERNAL_SERVER_ERROR
    );
    assert_eq!(
        proxy.serve(&route, checkout()).await.status(),
        StatusCode::SERVICE_UNAVAILABLE
    );

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let probe = {
        let (proxy, route) = (proxy.clone(), route.clone());
        tokio::spawn(async move { proxy.serve(&route, checkout()).await })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while hits.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("probe never reached the backend");
    probe.abort();
    assert!(probe.await.unwrap_err().is_cancelled());

    let response = proxy.serve(&route, checkout()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(hits.load(Ordering::SeqCst), 3);
    assert_eq!(proxy.serve(&route, checkout()).await.status(), StatusCode::OK);

    let short_circuited = metrics::REQUESTS_TOTAL
        .with_label_values(&["checkout-probe", "503"])
        .get();
    assert_eq!(short_circuited, 1.0);
}
