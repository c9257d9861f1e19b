//! Graceful shutdown tests against a real listener.
//!
//! Tests cover:
//! - In-flight requests finishing within the grace period
//! - Forced termination when the grace period is too short
//! - Background task drain
//! - Second-signal escalation
//! - Resource release

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use axum::{routing::get, Router};
use greenlight_core::{
    api::{self, AppState},
    config::{CorsConfig, Environment},
    db::memory::MemoryStore,
    middleware::{AuthConfig, ClientLimiter, IdentityResolver, RateLimitConfig},
    shutdown::{ShutdownConfig, ShutdownCoordinator, ShutdownOutcome, ShutdownState},
    tasks::{TaskTracker, TracingNotifier},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

// ============================================================================
// Helpers
// ============================================================================

fn app(tasks: TaskTracker) -> Router {
    let store = Arc::new(MemoryStore::new());
    let state = AppState {
        limiter: Arc::new(ClientLimiter::new(RateLimitConfig::default())),
        resolver: Arc::new(IdentityResolver::new(store.clone(), store, AuthConfig::default())),
        tasks,
        notifier: Arc::new(TracingNotifier),
        environment: Environment::Development,
        request_timeout: Duration::from_secs(30),
        cors: CorsConfig::default(),
        metrics: None,
        limiter_bypass: None,
    };

    let routes = Router::new().route(
        "/v1/slow",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(2)).await;
            "done"
        }),
    );
    api::build_router(state, routes)
}

struct Server {
    coordinator: Arc<ShutdownCoordinator>,
    tasks: TaskTracker,
    addr: std::net::SocketAddr,
    handle: JoinHandle<ShutdownOutcome>,
}

async fn start(grace: Duration) -> Server {
    let tasks = TaskTracker::new();
    let coordinator = Arc::new(ShutdownCoordinator::new(
        ShutdownConfig { grace_period: grace },
        tasks.clone(),
    ));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = app(tasks.clone());

    let handle = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.serve(listener, app).await.unwrap() })
    };

    Server {
        coordinator,
        tasks,
        addr,
        handle,
    }
}

/// Send a raw HTTP/1.1 request and return the connection for reading.
async fn send_slow_request(addr: std::net::SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /v1/slow HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    // Give the server time to accept and start handling it.
    tokio::time::sleep(Duration::from_millis(200)).await;
    stream
}

async fn read_response(mut stream: TcpStream) -> String {
    let mut buf = Vec::new();
    let _ = stream.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

// ============================================================================
// Listener Drain
// ============================================================================

#[tokio::test]
async fn test_in_flight_request_completes_within_grace() {
    let server = start(Duration::from_secs(5)).await;
    let stream = send_slow_request(server.addr).await;

    server.coordinator.trigger("test");
    assert_eq!(server.coordinator.state(), ShutdownState::Draining);

    let outcome = server.handle.await.unwrap();
    assert_eq!(outcome, ShutdownOutcome::Clean);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(server.coordinator.state(), ShutdownState::Terminated);

    let response = read_response(stream).await;
    assert!(response.starts_with("HTTP/1.1 200"), "got: {}", response);
    assert!(response.ends_with("done"));
}

#[tokio::test]
async fn test_short_grace_forces_termination() {
    let server = start(Duration::from_secs(1)).await;
    let _stream = send_slow_request(server.addr).await;

    let started = Instant::now();
    server.coordinator.trigger("test");

    let outcome = server.handle.await.unwrap();
    assert_eq!(outcome, ShutdownOutcome::Forced);
    assert_eq!(outcome.exit_code(), 1);
    assert!(started.elapsed() < Duration::from_millis(1900));
}

#[tokio::test]
async fn test_new_connections_refused_after_drain() {
    let server = start(Duration::from_secs(5)).await;
    server.coordinator.trigger("test");
    assert_eq!(server.handle.await.unwrap(), ShutdownOutcome::Clean);

    assert!(TcpStream::connect(server.addr).await.is_err());
}

#[tokio::test]
async fn test_second_signal_forces_termination() {
    let server = start(Duration::from_secs(30)).await;
    let _stream = send_slow_request(server.addr).await;

    let started = Instant::now();
    server.coordinator.trigger("SIGTERM");
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.coordinator.trigger("SIGINT");

    assert_eq!(server.handle.await.unwrap(), ShutdownOutcome::Forced);
    assert!(started.elapsed() < Duration::from_secs(2));
}

// ============================================================================
// Task Drain and Release
// ============================================================================

#[tokio::test]
async fn test_background_tasks_are_awaited() {
    let server = start(Duration::from_secs(5)).await;
    let finished = Arc::new(AtomicBool::new(false));

    let flag = finished.clone();
    server.tasks.run("email", async move {
        tokio::time::sleep(Duration::from_millis(500)).await;
        flag.store(true, Ordering::SeqCst);
        Ok::<_, std::convert::Infallible>(())
    });

    server.coordinator.trigger("test");
    assert_eq!(server.handle.await.unwrap(), ShutdownOutcome::Clean);
    assert!(finished.load(Ordering::SeqCst));
    assert_eq!(server.tasks.in_flight(), 0);
}

#[tokio::test]
async fn test_stuck_background_task_forces_termination() {
    let server = start(Duration::from_millis(300)).await;
    server.tasks.run("stuck", async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok::<_, std::convert::Infallible>(())
    });

    server.coordinator.trigger("test");
    assert_eq!(server.handle.await.unwrap(), ShutdownOutcome::Forced);
    assert_eq!(server.tasks.in_flight(), 1);
}

#[tokio::test]
async fn test_resources_released_after_drain() {
    let server = start(Duration::from_secs(5)).await;
    let released = Arc::new(AtomicBool::new(false));

    let flag = released.clone();
    server.coordinator.on_release("database pool", move || async move {
        flag.store(true, Ordering::SeqCst);
    });

    let sweeper = Arc::new(ClientLimiter::new(RateLimitConfig::default()))
        .spawn_sweeper(server.coordinator.drain_token());

    server.coordinator.trigger("test");
    assert_eq!(server.handle.await.unwrap(), ShutdownOutcome::Clean);
    assert!(released.load(Ordering::SeqCst));
    assert!(sweeper.await.is_ok());
}
