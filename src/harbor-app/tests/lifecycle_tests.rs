//! Application lifecycle tests: singleton access, listen/close and the
//! shutdown acknowledgment protocol.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::http::header::CONTENT_LENGTH;
use axum::http::{HeaderMap, HeaderValue};
use bytes::Bytes;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use harbor_app::{
    AppError, AppResult, ApplicationCore, ApplicationOptions, EventPayload, Formatter, Payload,
    SHUTDOWN_EVENT, Settings, ShutdownAck, ShutdownPhase, get_application, try_application,
};

fn local_settings() -> Settings {
    Settings {
        env: "TEST".to_string(),
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        ..Settings::default()
    }
}

fn app() -> Arc<ApplicationCore> {
    let app = Arc::new(ApplicationCore::new(ApplicationOptions::new()));
    app.set_settings(local_settings());
    app
}

/// Register `count` shutdown listeners that park their tokens in `parked`.
fn park_acks(app: &ApplicationCore, count: usize) -> Arc<Mutex<Vec<ShutdownAck>>> {
    let parked = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..count {
        let parked = Arc::clone(&parked);
        app.on_shutdown(move |ack| parked.lock().push(ack));
    }
    parked
}

async fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

struct CsvFormatter;

impl Formatter for CsvFormatter {
    fn format(&self, payload: Payload, headers: &mut HeaderMap) -> AppResult<Bytes> {
        let body = match payload {
            Payload::Text(text) => Bytes::from(text),
            other => Bytes::from(format!("{other:?}")),
        };
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        Ok(body)
    }
}

#[test]
fn test_singleton_ignores_later_options() {
    let first = get_application(ApplicationOptions::new().with_formatter("text/csv", CsvFormatter));
    let second =
        get_application(ApplicationOptions::new().with_formatter("application/xml", CsvFormatter));

    assert!(Arc::ptr_eq(&first, &second));
    assert!(Arc::ptr_eq(&first, &try_application().unwrap()));

    let formatters = second.server().formatters();
    assert!(formatters.contains("text/csv"));
    assert!(!formatters.contains("application/xml"));
}

#[tokio::test]
async fn test_listen_marks_ready_and_exposes_url() {
    let app = app();
    assert!(!app.is_ready());

    let addr = app.listen(|server| assert!(server.is_listening())).await.unwrap();
    assert!(app.is_ready());
    assert_eq!(app.get("is-test-mode"), Some(json!(true)));
    assert_eq!(app.get("port"), Some(json!(addr.port())));
    assert_eq!(
        app.get("url"),
        Some(json!(format!("http://127.0.0.1:{}", addr.port())))
    );

    app.close().await.unwrap();
    assert!(app.server().is_closed());
    assert!(matches!(app.close().await, Err(AppError::NotListening)));
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let occupied = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = occupied.local_addr().unwrap().port();

    let app = Arc::new(ApplicationCore::new(ApplicationOptions::new()));
    app.set_settings(Settings {
        port,
        ..local_settings()
    });

    let err = app.listen(|_| panic!("must not be called")).await.unwrap_err();
    assert!(matches!(err, AppError::Bind { .. }));
    assert!(!app.is_ready());
}

#[tokio::test]
async fn test_ping_over_real_socket() {
    let app = app();
    app.add_ping_endpoint().unwrap();
    let addr = app.listen(|_| {}).await.unwrap();

    let response = http_get(addr, "/ping").await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.contains("content-length: 6"), "{response}");
    assert!(response.ends_with("\"pong\""), "{response}");

    app.close().await.unwrap();
}

#[tokio::test]
async fn test_custom_events_reach_listeners() {
    let app = app();
    let seen = Arc::new(Mutex::new(Vec::<Value>::new()));
    let sink = Arc::clone(&seen);
    app.on("cache:flushed", move |payload: EventPayload| {
        if let Some(data) = payload.data() {
            sink.lock().push(data.clone());
        }
    });

    assert_eq!(app.emit("cache:flushed", json!({"entries": 3})), 1);
    assert_eq!(app.emit("cache:unknown", Value::Null), 0);
    assert_eq!(*seen.lock(), vec![json!({"entries": 3})]);
}

#[tokio::test]
async fn test_shutdown_without_listeners_closes_server() {
    let app = app();
    app.listen(|_| {}).await.unwrap();

    assert_eq!(app.shutdown_phase(), ShutdownPhase::Idle);
    let report = app.graceful_shutdown().await.unwrap();
    assert_eq!(report.expected_acks, 0);
    assert_eq!(
        report.phases,
        vec![ShutdownPhase::Closing, ShutdownPhase::Done]
    );
    assert!(report.server_closed);
    assert!(!report.timed_out);
    assert_eq!(app.shutdown_phase(), ShutdownPhase::Done);
    assert!(app.server().is_closed());
}

#[tokio::test]
async fn test_shutdown_waits_for_single_ack() {
    let app = app();
    app.listen(|_| {}).await.unwrap();
    let parked = park_acks(&app, 1);

    let shutdown = tokio::spawn({
        let app = Arc::clone(&app);
        async move { app.graceful_shutdown().await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!shutdown.is_finished());
    assert_eq!(app.shutdown_phase(), ShutdownPhase::AwaitingAcks);
    assert!(app.server().is_listening());

    let ack = parked.lock().pop().unwrap();
    ack.ack();

    let report = shutdown.await.unwrap().unwrap();
    assert_eq!(report.expected_acks, 1);
    assert_eq!(report.received_acks, 1);
    assert!(report.server_closed);
    assert!(app.server().is_closed());
}

#[tokio::test]
async fn test_shutdown_waits_for_every_ack() {
    let app = app();
    app.listen(|_| {}).await.unwrap();
    let parked = park_acks(&app, 3);
    assert_eq!(app.events().listener_count(SHUTDOWN_EVENT), 3);

    let shutdown = tokio::spawn({
        let app = Arc::clone(&app);
        async move { app.graceful_shutdown().await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let acks: Vec<ShutdownAck> = parked.lock().drain(..).collect();
    assert_eq!(acks.len(), 3);

    let mut acks = acks.into_iter();
    for ack in acks.by_ref().take(2) {
        ack.ack();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!shutdown.is_finished());
    }
    assert!(app.server().is_listening());

    for ack in acks {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            ack.ack();
        });
    }

    let report = shutdown.await.unwrap().unwrap();
    assert_eq!(report.received_acks, 3);
    assert_eq!(app.shutdown_phase(), ShutdownPhase::Done);
}

#[tokio::test]
async fn test_listeners_may_ack_synchronously() {
    let app = app();
    let calls = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let calls = Arc::clone(&calls);
        app.on_shutdown(move |ack| {
            calls.fetch_add(1, Ordering::SeqCst);
            ack.ack();
        });
    }

    let report = app.graceful_shutdown().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(report.received_acks, 2);
    assert!(!report.server_closed);
}

#[tokio::test]
async fn test_shutdown_triggers_once() {
    let app = app();
    app.graceful_shutdown().await.unwrap();
    assert!(matches!(
        app.graceful_shutdown().await,
        Err(AppError::ShutdownAlreadyTriggered)
    ));
}

#[tokio::test]
async fn test_shutdown_timeout_gives_up_on_silent_listener() {
    let app = Arc::new(ApplicationCore::new(ApplicationOptions::new()));
    app.set_settings(Settings {
        shutdown_timeout: Some(1),
        ..local_settings()
    });
    app.listen(|_| {}).await.unwrap();
    let _parked = park_acks(&app, 1);

    let report = app.graceful_shutdown().await.unwrap();
    assert!(report.timed_out);
    assert_eq!(report.received_acks, 0);
    assert!(report.server_closed);
}

#[tokio::test]
async fn test_run_until_exit_waits_for_signal() {
    let app = app();
    app.listen(|_| {}).await.unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let exit = tokio::spawn({
        let app = Arc::clone(&app);
        async move {
            app.run_until_exit(async {
                let _ = rx.await;
            })
            .await
        }
    });

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(app.shutdown_phase(), ShutdownPhase::Idle);
    assert!(app.server().is_listening());

    tx.send(()).unwrap();
    let report = exit.await.unwrap().unwrap();
    assert!(report.server_closed);
}
