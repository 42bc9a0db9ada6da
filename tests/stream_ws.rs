//! Stream tails over WebSocket and the history endpoint

use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use paas_engine::engine::Workers;
use paas_engine::server::auth::{issue_token, Role};
use paas_engine::server::{create_router, AppState};
use paas_engine::settings::Settings;
use paas_engine::store::Store;
use paas_engine::Engine;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const JWT_SECRET: &str = "it-jwt-secret";

fn find_available_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .expect("Failed to bind to address")
        .local_addr()
        .expect("Failed to get local address")
        .port()
}

async fn start_engine() -> (Arc<Engine>, u16, Workers) {
    let mut settings = Settings::default();
    settings.crypto.secret = "it-crypto-secret".to_string();
    settings.auth.jwt_secret = JWT_SECRET.to_string();
    let engine = Arc::new(Engine::new(settings, Arc::new(Store::new()), Vec::new()).unwrap());
    let workers = engine.start_workers();
    let app = create_router(AppState::new(engine.clone(), workers.queue.clone()));

    let port = find_available_port();
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .expect("Failed to bind engine");
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    sleep(Duration::from_millis(100)).await;
    (engine, port, workers)
}

fn token() -> String {
    issue_token(JWT_SECRET, Role::InternalSys, None, 300).unwrap()
}

async fn open(port: u16, channel: Uuid, since: Option<u64>) -> Socket {
    let mut url = format!("ws://127.0.0.1:{}/api/streams/{}/ws", port, channel);
    if let Some(since) = since {
        url.push_str(&format!("?since={}", since));
    }
    let mut request = url.into_client_request().unwrap();
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {}", token()).parse().unwrap(),
    );
    let (socket, _) = connect_async(request).await.expect("websocket connect");
    socket
}

/// Read JSON events until the server closes the socket
async fn drain(socket: &mut Socket) -> Vec<Value> {
    let mut events = Vec::new();
    loop {
        let next = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("stream stalled");
        match next {
            Some(Ok(Message::Text(text))) => events.push(serde_json::from_str(text.as_str()).unwrap()),
            Some(Ok(Message::Close(_))) | None => return events,
            Some(Ok(_)) => {}
            Some(Err(e)) => panic!("websocket error: {}", e),
        }
    }
}

#[tokio::test]
async fn test_ws_replays_finished_channel() {
    let (engine, port, _workers) = start_engine().await;
    let id = Uuid::new_v4();
    let channel = engine.streams.channel(id, "default");
    channel.write_message("step 1").await.unwrap();
    channel.write_message("step 2").await.unwrap();
    channel.close("successful").await.unwrap();

    let mut socket = open(port, id, None).await;
    let events = drain(&mut socket).await;

    assert_eq!(events.len(), 3);
    assert_eq!(events[0]["event"], "message");
    assert_eq!(events[0]["data"]["line"], "step 1");
    assert_eq!(events[1]["data"]["line"], "step 2");
    assert_eq!(events[2]["data"]["type"], "close");
    assert_eq!(events[2]["data"]["status"], "successful");
}

#[tokio::test]
async fn test_ws_follows_live_writes() {
    let (engine, port, _workers) = start_engine().await;
    let id = Uuid::new_v4();
    let channel = engine.streams.channel(id, "default");
    channel.write_message("before").await.unwrap();

    let mut socket = open(port, id, None).await;
    let first = timeout(Duration::from_secs(5), socket.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let first: Value = serde_json::from_str(first.to_text().unwrap()).unwrap();
    assert_eq!(first["data"]["line"], "before");

    channel.write_message("after").await.unwrap();
    channel.close("failed").await.unwrap();
    let rest = drain(&mut socket).await;
    assert_eq!(rest[0]["data"]["line"], "after");
    assert_eq!(rest.last().unwrap()["data"]["status"], "failed");
}

#[tokio::test]
async fn test_ws_resumes_after_cursor() {
    let (engine, port, _workers) = start_engine().await;
    let id = Uuid::new_v4();
    let channel = engine.streams.channel(id, "default");
    for line in ["a", "b", "c"] {
        channel.write_message(line).await.unwrap();
    }
    channel.close("successful").await.unwrap();

    let mut socket = open(port, id, Some(2)).await;
    let events = drain(&mut socket).await;
    assert_eq!(events[0]["data"]["line"], "c");
    assert_eq!(events.len(), 2);
}

#[tokio::test]
async fn test_history_hides_internal_events() {
    let (engine, port, _workers) = start_engine().await;
    let id = Uuid::new_v4();
    let channel = engine.streams.channel(id, "default");
    channel.write_message("only line").await.unwrap();
    channel.close("successful").await.unwrap();

    let response = reqwest::Client::new()
        .get(format!("http://127.0.0.1:{}/api/streams/{}/history", port, id))
        .bearer_auth(token())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 200);
    let events: Vec<Value> = response.json().await.unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["data"]["line"], "only line");
}

#[tokio::test]
async fn test_ws_requires_token() {
    let (_engine, port, _workers) = start_engine().await;
    let url = format!("ws://127.0.0.1:{}/api/streams/{}/ws", port, Uuid::new_v4());
    assert!(connect_async(url).await.is_err());
}
