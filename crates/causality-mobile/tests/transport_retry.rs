//! Transport retry semantics against a real local HTTP server: which
//! statuses retry, which are terminal, and how `Retry-After` interacts
//! with the backoff strategy.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use causality_mobile::backoff::BackoffPolicy;
use causality_mobile::transport::{HttpTransport, Transport, TransportError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// One scripted response: status plus optional Retry-After value.
type Scripted = (u16, Option<&'static str>);

struct ServerState {
    script: Mutex<VecDeque<Scripted>>,
    hits: AtomicUsize,
    last_headers: Mutex<Option<HeaderMap>>,
    last_body: Mutex<Option<serde_json::Value>>,
}

async fn batch_handler(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> axum::response::Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    *state.last_headers.lock().unwrap() = Some(headers);
    *state.last_body.lock().unwrap() = Some(body);

    let next = state.script.lock().unwrap().pop_front();
    let (status, retry_after) = next.unwrap_or((200, None));
    let mut response = axum::response::Response::builder().status(status);
    if let Some(value) = retry_after {
        response = response.header("Retry-After", value);
    }
    response.body(axum::body::Body::empty()).unwrap()
}

async fn spawn_server(script: Vec<Scripted>) -> (String, Arc<ServerState>) {
    let state = Arc::new(ServerState {
        script: Mutex::new(script.into()),
        hits: AtomicUsize::new(0),
        last_headers: Mutex::new(None),
        last_body: Mutex::new(None),
    });
    let router = Router::new()
        .route("/v1/events/batch", post(batch_handler))
        .with_state(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    (format!("http://{}", addr), state)
}

fn fast_policy(max_attempts: u32) -> BackoffPolicy {
    BackoffPolicy {
        base: Duration::from_millis(10),
        cap: Duration::from_millis(100),
        max_attempts,
        jitter: 0.0,
    }
}

fn events(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{{\"n\":{}}}", i)).collect()
}

#[tokio::test]
async fn request_shape_carries_key_agent_and_events_array() {
    let (endpoint, state) = spawn_server(vec![(200, None)]).await;
    let transport = HttpTransport::new(&endpoint, "secret-key", fast_policy(3)).unwrap();

    transport.send_batch(&events(5)).await.unwrap();

    let headers = state.last_headers.lock().unwrap().clone().unwrap();
    assert_eq!(headers.get("x-api-key").unwrap(), "secret-key");
    assert!(headers
        .get("user-agent")
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("causality-mobile/"));
    assert_eq!(
        headers.get("content-type").unwrap().to_str().unwrap(),
        "application/json"
    );

    let body = state.last_body.lock().unwrap().clone().unwrap();
    assert_eq!(body["events"].as_array().unwrap().len(), 5);
    assert_eq!(body["events"][2]["n"], 2);
}

#[tokio::test]
async fn transient_statuses_retry_until_success() {
    let script = vec![
        (500, None),
        (502, None),
        (503, None),
        (504, None),
        (429, None),
        (200, None),
    ];
    let (endpoint, state) = spawn_server(script).await;
    let transport = HttpTransport::new(&endpoint, "k", fast_policy(10)).unwrap();

    transport.send_batch(&events(1)).await.unwrap();
    assert_eq!(state.hits.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn client_errors_are_terminal_after_one_attempt() {
    for status in [400u16, 401, 403, 404, 422] {
        let (endpoint, state) = spawn_server(vec![(status, None)]).await;
        let transport = HttpTransport::new(&endpoint, "k", fast_policy(10)).unwrap();

        let err = transport.send_batch(&events(1)).await.unwrap_err();
        match err {
            TransportError::Client { status: got } => assert_eq!(got, status),
            other => panic!("expected Client error for {}, got {:?}", status, other),
        }
        assert_eq!(
            state.hits.load(Ordering::SeqCst),
            1,
            "status {} must not retry",
            status
        );
    }
}

#[tokio::test]
async fn attempts_are_capped() {
    let (endpoint, state) = spawn_server(vec![(503, None); 10]).await;
    let transport = HttpTransport::new(&endpoint, "k", fast_policy(3)).unwrap();

    let err = transport.send_batch(&events(1)).await.unwrap_err();
    assert!(matches!(
        err,
        TransportError::RetriesExhausted { attempts: 3, .. }
    ));
    assert_eq!(state.hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retry_after_raises_the_wait_above_the_strategy_delay() {
    let (endpoint, state) = spawn_server(vec![(429, Some("2")), (200, None)]).await;
    // Strategy delay is 10ms; the header must win.
    let transport = HttpTransport::new(&endpoint, "k", fast_policy(5)).unwrap();

    let start = Instant::now();
    transport.send_batch(&events(1)).await.unwrap();
    assert!(
        start.elapsed() >= Duration::from_secs(2),
        "second attempt arrived after only {:?}",
        start.elapsed()
    );
    assert_eq!(state.hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn connection_failure_is_retryable_then_exhausts() {
    // Nothing listens on this port.
    let transport =
        HttpTransport::new("http://127.0.0.1:1", "k", fast_policy(2)).unwrap();
    let err = transport.send_batch(&events(1)).await.unwrap_err();
    assert!(matches!(
        err,
        TransportError::RetriesExhausted { attempts: 2, .. }
    ));
}
