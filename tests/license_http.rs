use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use base64::Engine;
use rstest::rstest;
use tokio::net::TcpListener;
use url::Url;

use rslicense::asset::WIDEVINE_UUID;
use rslicense::callback::{DrmCallback, KeyRequest, MediaDrmCallback, ProvisionRequest};
use rslicense::custom_data::{CustomDataBuilder, Identity, RequestInfo, StaticRequestInfo};
use rslicense::transport::{
    CancellationToken, Headers, HttpDataSourceConfig, LicenseTransport, ReqwestExecutor,
    TransportCause, MAX_MANUAL_REDIRECTS,
};
use rslicense::Error;

// ============================================================================
// Test server infrastructure
// ============================================================================

/// axum server on its own runtime thread, so blocking clients can call it
/// from plain `#[test]` functions.
struct TestServer {
    base_url: Url,
    hits: Arc<AtomicUsize>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl TestServer {
    fn start() -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = router(hits.clone());
        let (addr_tx, addr_rx) = std::sync::mpsc::channel::<SocketAddr>();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                addr_tx.send(listener.local_addr().unwrap()).unwrap();
                axum::serve(listener, router)
                    .with_graceful_shutdown(async {
                        shutdown_rx.await.ok();
                    })
                    .await
                    .unwrap();
            });
        });

        let addr = addr_rx.recv().unwrap();
        Self {
            base_url: Url::parse(&format!("http://{}", addr)).unwrap(),
            hits,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    fn url(&self, path: &str) -> String {
        self.base_url.join(path).unwrap().to_string()
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
        }
    }
}

// ============================================================================
// Test endpoints
// ============================================================================

fn router(hits: Arc<AtomicUsize>) -> Router {
    Router::new()
        .route("/hop/{n}", post(hop_endpoint))
        .route("/status/{code}", post(status_endpoint))
        .route("/no-location", post(no_location_endpoint))
        .route("/slow", post(slow_endpoint))
        .route("/provision", post(provision_endpoint))
        .with_state(hits)
}

/// Redirects `n` more times, alternating 307/308 and relative/absolute
/// `Location`, then answers with the license JSON.
async fn hop_endpoint(
    State(hits): State<Arc<AtomicUsize>>,
    Path(n): Path<u32>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    hits.fetch_add(1, Ordering::SeqCst);

    if n > 0 {
        let status = if n % 2 == 0 {
            StatusCode::PERMANENT_REDIRECT
        } else {
            StatusCode::TEMPORARY_REDIRECT
        };
        let location = match headers.get(header::HOST).and_then(|h| h.to_str().ok()) {
            Some(host) if n % 2 == 0 => format!("http://{}/hop/{}", host, n - 1),
            _ => format!("/hop/{}", n - 1),
        };
        return (status, [(header::LOCATION, location)]).into_response();
    }

    if !headers.contains_key("custom-data") {
        return (StatusCode::BAD_REQUEST, "missing custom-data").into_response();
    }
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };

    Json(serde_json::json!({
        "license": base64::engine::general_purpose::STANDARD.encode(&body),
        "contentType": header_value("content-type"),
        "token": header_value("x-token"),
    }))
    .into_response()
}

async fn status_endpoint(Path(code): Path<u16>) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, [("x-reason", "scripted")], "denied").into_response()
}

async fn no_location_endpoint() -> StatusCode {
    StatusCode::TEMPORARY_REDIRECT
}

async fn slow_endpoint() -> &'static str {
    tokio::time::sleep(Duration::from_secs(3)).await;
    "{}"
}

async fn provision_endpoint(Query(query): Query<HashMap<String, String>>) -> Response {
    match query.get("signedRequest") {
        Some(signed) => format!("certificate-for:{}", signed).into_response(),
        None => (StatusCode::BAD_REQUEST, "missing signedRequest").into_response(),
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn transport(config: &HttpDataSourceConfig) -> LicenseTransport {
    LicenseTransport::new(Arc::new(ReqwestExecutor::new(config).unwrap()))
}

fn callback(default_url: Option<String>) -> DrmCallback {
    DrmCallback::new(
        default_url,
        false,
        transport(&HttpDataSourceConfig::default()),
        CustomDataBuilder::new(
            Arc::new(Identity {
                merchant_id: "merchant".to_string(),
                app_id: "app".to_string(),
                user_id: "user".to_string(),
                session_id: "session".to_string(),
            }),
            Arc::new(StaticRequestInfo(RequestInfo {
                request_id: "req-1".to_string(),
                device_info: "device".to_string(),
            })),
        ),
    )
    .unwrap()
}

fn transport_error(err: Error) -> rslicense::transport::TransportError {
    match err {
        Error::Transport(e) => e,
        other => panic!("expected transport error, got {:?}", other),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[rstest]
#[case(0)]
#[case(1)]
#[case(3)]
#[case(MAX_MANUAL_REDIRECTS as u32)]
fn key_request_follows_redirect_chain(#[case] hops: u32) {
    let server = TestServer::start();
    let callback = callback(None);

    let license = callback
        .execute_key_request(
            WIDEVINE_UUID,
            &KeyRequest {
                data: b"challenge-bytes".to_vec(),
                license_server_url: server.url(&format!("/hop/{}", hops)),
            },
        )
        .unwrap();

    assert_eq!(license, b"challenge-bytes");
    assert_eq!(server.hits(), hops as usize + 1);
}

#[test]
fn redirect_beyond_limit_is_not_followed() {
    let server = TestServer::start();
    let callback = callback(None);
    let first = server.url("/hop/6");

    let err = callback
        .execute_key_request(
            WIDEVINE_UUID,
            &KeyRequest {
                data: b"challenge".to_vec(),
                license_server_url: first.clone(),
            },
        )
        .unwrap_err();

    let err = transport_error(err);
    assert_eq!(
        err.cause,
        TransportCause::TooManyRedirects {
            limit: MAX_MANUAL_REDIRECTS
        }
    );
    assert_eq!(err.original_request.url, first);
    assert!(err.last_uri.ends_with("/hop/1"), "last uri {}", err.last_uri);
    assert!(err.response_headers.contains_key("location"));
    assert_eq!(server.hits(), MAX_MANUAL_REDIRECTS + 1);
}

#[test]
fn redirects_preserve_method_headers_and_body() {
    let server = TestServer::start();
    let transport = transport(&HttpDataSourceConfig::default());

    let mut headers = Headers::new();
    headers.insert("Content-Type".to_string(), "application/octet-stream".to_string());
    headers.insert("custom-data".to_string(), "e30=".to_string());
    headers.insert("X-Token".to_string(), "secret".to_string());

    let body = transport
        .post(&server.url("/hop/4"), headers, Some(vec![1, 2, 3, 4]))
        .unwrap();

    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["license"], "AQIDBA==");
    assert_eq!(value["contentType"], "application/octet-stream");
    assert_eq!(value["token"], "secret");
}

#[test]
fn key_request_header_override_reaches_server() {
    let server = TestServer::start();
    let callback = callback(Some(server.url("/hop/1")));
    callback.set_key_request_property("content-type", "application/x-license");
    callback.set_key_request_property("X-Token", "abc");

    let outgoing = callback
        .build_key_request(&KeyRequest {
            data: b"payload".to_vec(),
            license_server_url: String::new(),
        })
        .unwrap();
    let body = transport(&HttpDataSourceConfig::default())
        .send(outgoing)
        .unwrap();

    let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(value["contentType"], "application/x-license");
    assert_eq!(value["token"], "abc");
}

#[rstest]
#[case(403)]
#[case(404)]
#[case(500)]
fn error_status_is_reported(#[case] code: u16) {
    let server = TestServer::start();
    let url = server.url(&format!("/status/{}", code));

    let err = transport(&HttpDataSourceConfig::default())
        .post(&url, Headers::new(), Some(b"x".to_vec()))
        .unwrap_err();

    assert_eq!(err.cause, TransportCause::Status { status: code });
    assert_eq!(err.last_uri, url);
    assert_eq!(
        err.response_headers.get("x-reason"),
        Some(&vec!["scripted".to_string()])
    );
}

#[test]
fn redirect_without_location_fails() {
    let server = TestServer::start();

    let err = transport(&HttpDataSourceConfig::default())
        .post(&server.url("/no-location"), Headers::new(), None)
        .unwrap_err();

    assert_eq!(err.cause, TransportCause::MissingLocation { status: 307 });
}

#[test]
fn slow_server_times_out() {
    let server = TestServer::start();
    let config = HttpDataSourceConfig {
        timeout: Some(Duration::from_millis(200)),
        ..Default::default()
    };

    let err = transport(&config)
        .post(&server.url("/slow"), Headers::new(), None)
        .unwrap_err();

    assert_eq!(err.cause, TransportCause::Timeout);
}

/// Answers one connection with half of a `Content-Length: 20` body, then
/// holds the socket open.
fn start_stalling_server() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    std::thread::spawn(move || {
        if let Ok((mut stream, _)) = listener.accept() {
            let mut request = [0u8; 4096];
            let _ = stream.read(&mut request);
            let _ = stream.write_all(
                b"HTTP/1.1 200 OK\r\nContent-Length: 20\r\nContent-Type: application/json\r\n\r\n0123456789",
            );
            let _ = stream.flush();
            std::thread::sleep(Duration::from_secs(3));
        }
    });

    format!("http://{}/license", addr)
}

#[test]
fn stalled_body_times_out() {
    let url = start_stalling_server();
    let config = HttpDataSourceConfig {
        timeout: Some(Duration::from_millis(500)),
        ..Default::default()
    };

    let err = transport(&config)
        .post(&url, Headers::new(), Some(b"challenge".to_vec()))
        .unwrap_err();

    assert_eq!(err.cause, TransportCause::Timeout);
    assert_eq!(err.bytes_read, 10);
    assert_eq!(err.last_uri, url);
}

#[test]
fn cancelled_transport_sends_nothing() {
    let server = TestServer::start();
    let token = CancellationToken::new();
    let transport = transport(&HttpDataSourceConfig::default()).with_cancellation(token.clone());
    token.cancel();

    let err = transport
        .post(&server.url("/hop/0"), Headers::new(), None)
        .unwrap_err();

    assert_eq!(err.cause, TransportCause::Cancelled);
    assert_eq!(server.hits(), 0);
}

#[test]
fn provisioning_sends_signed_request_in_query() {
    let server = TestServer::start();
    let callback = callback(None);

    let response = callback
        .execute_provision_request(
            WIDEVINE_UUID,
            &ProvisionRequest {
                default_url: server.url("/provision"),
                data: b"signed-blob".to_vec(),
            },
        )
        .unwrap();

    assert_eq!(response, b"certificate-for:signed-blob");
}

#[test]
fn malformed_license_response_is_typed() {
    let server = TestServer::start();
    let callback = callback(None);

    // The provisioning endpoint answers with plain text.
    let err = callback
        .execute_key_request(
            WIDEVINE_UUID,
            &KeyRequest {
                data: b"x".to_vec(),
                license_server_url: format!("{}?signedRequest=abc", server.url("/provision")),
            },
        )
        .unwrap_err();

    assert!(matches!(err, Error::LicenseResponseMalformed(_)));
}
