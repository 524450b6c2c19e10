use artspark::failover::*;
use artspark::types::*;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

type HitLog = Arc<Mutex<Vec<&'static str>>>;

fn fast_policy() -> FailoverPolicy {
    FailoverPolicy {
        max_retries: 2,
        request_timeout: Duration::from_secs(5),
        server_error_backoff: Duration::from_millis(5),
        transport_error_backoff: Duration::from_millis(5),
        endpoint_switch_delay: Duration::from_millis(5),
    }
}

fn requester(policy: FailoverPolicy) -> FailoverRequester {
    FailoverRequester::new(reqwest::Client::new(), policy)
}

async fn spawn_upstream(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test upstream");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve test upstream");
    });
    format!("http://{}/v1/draw/completions", addr)
}

/// An upstream that logs `label` on every hit and answers with `status`.
async fn fixed_status(label: &'static str, status: StatusCode, log: HitLog) -> String {
    let app = Router::new().route(
        "/v1/draw/completions",
        post(move || {
            let log = log.clone();
            async move {
                log.lock().expect("hit log").push(label);
                (status, format!("{} says {}", label, status.as_u16()))
            }
        }),
    );
    spawn_upstream(app).await
}

async fn dead_endpoint() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("http://{}/v1/draw/completions", addr)
}

#[tokio::test]
async fn test_server_errors_retry_then_fail_over_in_order() {
    let log: HitLog = Arc::default();
    let a = fixed_status("a", StatusCode::SERVICE_UNAVAILABLE, log.clone()).await;
    let b = fixed_status("b", StatusCode::OK, log.clone()).await;
    let endpoints = EndpointList::new([a, b]).expect("endpoints");

    let response = requester(fast_policy())
        .send(&endpoints, &json!({"prompt": "x"}), "test-key")
        .await
        .expect("second endpoint succeeds");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(*log.lock().expect("hit log"), vec!["a", "a", "a", "b"]);
}

#[tokio::test]
async fn test_client_error_moves_on_without_retry() {
    let log: HitLog = Arc::default();
    let a = fixed_status("a", StatusCode::BAD_REQUEST, log.clone()).await;
    let b = fixed_status("b", StatusCode::OK, log.clone()).await;
    let endpoints = EndpointList::new([a, b]).expect("endpoints");

    requester(fast_policy())
        .send(&endpoints, &json!({}), "test-key")
        .await
        .expect("second endpoint succeeds");

    assert_eq!(*log.lock().expect("hit log"), vec!["a", "b"]);
}

#[tokio::test]
async fn test_first_success_short_circuits() {
    let log: HitLog = Arc::default();
    let a = fixed_status("a", StatusCode::OK, log.clone()).await;
    let b = fixed_status("b", StatusCode::OK, log.clone()).await;
    let endpoints = EndpointList::new([a, b]).expect("endpoints");

    requester(fast_policy())
        .send(&endpoints, &json!({}), "test-key")
        .await
        .expect("first endpoint succeeds");

    assert_eq!(*log.lock().expect("hit log"), vec!["a"]);
}

#[tokio::test]
async fn test_persistent_503_exhausts_after_three_attempts() {
    let log: HitLog = Arc::default();
    let a = fixed_status("a", StatusCode::SERVICE_UNAVAILABLE, log.clone()).await;
    let endpoints = EndpointList::new([a]).expect("endpoints");

    let err = requester(fast_policy())
        .send(&endpoints, &json!({}), "test-key")
        .await
        .expect_err("all attempts fail");

    assert_eq!(log.lock().expect("hit log").len(), 3);
    match &err.inner {
        ArtsparkError::AllEndpointsFailed { attempts, last } => {
            assert_eq!(*attempts, 3);
            assert!(last.contains("503"), "last error was {}", last);
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(err.inner.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(err.inner.code(), "UPSTREAM_UNAVAILABLE");
}

#[tokio::test]
async fn test_unreachable_endpoints_count_every_attempt() {
    let endpoints = EndpointList::new([dead_endpoint().await, dead_endpoint().await])
        .expect("endpoints");

    let err = requester(fast_policy())
        .send(&endpoints, &json!({}), "test-key")
        .await
        .expect_err("nothing is listening");

    match err.inner {
        ArtsparkError::AllEndpointsFailed { attempts, .. } => assert_eq!(attempts, 6),
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_transport_failure_then_healthy_fallback() {
    let log: HitLog = Arc::default();
    let dead = dead_endpoint().await;
    let b = fixed_status("b", StatusCode::OK, log.clone()).await;
    let endpoints = EndpointList::new([dead, b]).expect("endpoints");

    let response = requester(fast_policy())
        .send(&endpoints, &json!({}), "test-key")
        .await
        .expect("fallback succeeds");

    assert!(response.status().is_success());
    assert_eq!(*log.lock().expect("hit log"), vec!["b"]);
}

#[tokio::test]
async fn test_slow_upstream_is_cut_by_attempt_timeout() {
    let app = Router::new().route(
        "/v1/draw/completions",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            StatusCode::OK
        }),
    );
    let slow = spawn_upstream(app).await;
    let endpoints = EndpointList::new([slow]).expect("endpoints");
    let policy = FailoverPolicy {
        max_retries: 0,
        request_timeout: Duration::from_millis(100),
        ..fast_policy()
    };

    let started = std::time::Instant::now();
    let err = requester(policy)
        .send(&endpoints, &json!({}), "test-key")
        .await
        .expect_err("attempt times out");

    assert!(started.elapsed() < Duration::from_secs(5));
    match err.inner {
        ArtsparkError::AllEndpointsFailed { attempts, last } => {
            assert_eq!(attempts, 1);
            assert!(last.contains("no response within"), "last error was {}", last);
        }
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_bearer_credential_and_body_are_forwarded() {
    let seen: Arc<Mutex<Option<(String, serde_json::Value)>>> = Arc::default();
    let captured = seen.clone();
    let app = Router::new().route(
        "/v1/draw/completions",
        post(move |headers: HeaderMap, axum::Json(body): axum::Json<serde_json::Value>| {
            let captured = captured.clone();
            async move {
                let auth = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                *captured.lock().expect("capture") = Some((auth, body));
                StatusCode::OK
            }
        }),
    );
    let endpoints = EndpointList::new([spawn_upstream(app).await]).expect("endpoints");

    requester(fast_policy())
        .send(&endpoints, &json!({"model": "sora-image"}), "secret-key")
        .await
        .expect("succeeds");

    let (auth, body) = seen.lock().expect("capture").clone().expect("request captured");
    assert_eq!(auth, "Bearer secret-key");
    assert_eq!(body["model"], "sora-image");
}

type TimedLog = Arc<Mutex<Vec<(&'static str, Duration)>>>;

/// Like `fixed_status`, but records when each hit arrived relative to `start`.
async fn timed_status(
    label: &'static str,
    status: StatusCode,
    start: std::time::Instant,
    log: TimedLog,
) -> String {
    let app = Router::new().route(
        "/v1/draw/completions",
        post(move || {
            let log = log.clone();
            async move {
                log.lock().expect("hit log").push((label, start.elapsed()));
                status
            }
        }),
    );
    spawn_upstream(app).await
}

fn assert_near(actual: Duration, expected_secs: f64) {
    let actual = actual.as_secs_f64();
    assert!(
        (actual - expected_secs).abs() < 0.75,
        "expected a hit near {}s, got {:.3}s",
        expected_secs,
        actual
    );
}

#[tokio::test]
async fn test_default_policy_backoff_schedule_for_server_errors() {
    let log: TimedLog = Arc::default();
    let start = std::time::Instant::now();
    let a = timed_status("a", StatusCode::SERVICE_UNAVAILABLE, start, log.clone()).await;
    let b = timed_status("b", StatusCode::OK, start, log.clone()).await;
    let endpoints = EndpointList::new([a, b]).expect("endpoints");

    requester(FailoverPolicy::default())
        .send(&endpoints, &json!({}), "test-key")
        .await
        .expect("second endpoint succeeds");

    let hits = log.lock().expect("hit log").clone();
    let labels: Vec<&str> = hits.iter().map(|(label, _)| *label).collect();
    assert_eq!(labels, vec!["a", "a", "a", "b"]);
    // 2s then 4s between retries, 2s endpoint switch
    for ((_, at), expected) in hits.iter().zip([0.0, 2.0, 6.0, 8.0]) {
        assert_near(*at, expected);
    }
}

#[tokio::test]
async fn test_default_policy_backoff_schedule_for_transport_errors() {
    // accepts and immediately drops every connection
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let start = std::time::Instant::now();
    let accepted: Arc<Mutex<Vec<Duration>>> = Arc::default();
    let accepts = accepted.clone();
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            accepts.lock().expect("accept log").push(start.elapsed());
            drop(socket);
        }
    });
    let endpoints =
        EndpointList::new([format!("http://{}/v1/draw/completions", addr)]).expect("endpoints");

    let err = requester(FailoverPolicy::default())
        .send(&endpoints, &json!({}), "test-key")
        .await
        .expect_err("every attempt is cut off");

    assert!(matches!(
        err.inner,
        ArtsparkError::AllEndpointsFailed { attempts: 3, .. }
    ));
    let hits = accepted.lock().expect("accept log").clone();
    assert_eq!(hits.len(), 3);
    // 3s then 6s between retries
    for (at, expected) in hits.iter().zip([0.0, 3.0, 9.0]) {
        assert_near(*at, expected);
    }
}
