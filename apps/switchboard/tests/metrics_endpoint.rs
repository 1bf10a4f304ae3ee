//! Installs the process-wide Prometheus recorder, so it lives in its own test
//! binary.

use std::time::Duration;

use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use futures_util::SinkExt;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tower::util::ServiceExt;

use switchboard::config::Config;
use switchboard::server::{self, AppState};
use switchboard::telemetry;

async fn scrape(state: &AppState) -> String {
    let response = server::router(state.clone())
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body::to_bytes(response.into_body(), 256 * 1024).await.unwrap();
    String::from_utf8(body.to_vec()).unwrap()
}

#[test_timeout::tokio_timeout_test]
async fn metrics_endpoint_reports_relay_activity() {
    let handle = telemetry::install_metrics().unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = AppState::new(Config::default(), Some(handle));
    tokio::spawn(server::serve(listener, state.clone(), std::future::pending()));

    let (mut ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    for data in [json!({"sessionId": "s1"}), json!({})] {
        let frame = json!({ "event": "controller-join", "data": data }).to_string();
        ws.send(Message::Text(frame.into())).await.unwrap();
    }

    let mut text = String::new();
    for _ in 0..100 {
        text = scrape(&state).await;
        if text.contains("switchboard_dropped_total") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(
        text.contains(r#"switchboard_events_total{event="controller-join"} 2"#),
        "missing event counter:\n{}",
        text
    );
    let dropped = text
        .lines()
        .find(|line| line.starts_with("switchboard_dropped_total{"))
        .unwrap_or_else(|| panic!("missing drop counter:\n{}", text));
    assert!(dropped.contains(r#"reason="missing_routing_key""#));
    assert!(dropped.ends_with(" 1"));
    let connections: f64 = text
        .lines()
        .find_map(|line| line.strip_prefix("switchboard_connections "))
        .unwrap_or_else(|| panic!("missing connection gauge:\n{}", text))
        .trim()
        .parse()
        .unwrap();
    assert_eq!(connections, 1.0);
}
