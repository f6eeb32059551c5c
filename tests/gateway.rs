//! HTTP and WebSocket surface, end to end

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tower::ServiceExt;

use parley_gateway::api::ApiServer;
use parley_gateway::config::SegmenterConfig;
use parley_gateway::session::TurnServices;
use parley_gateway::voice::TtsClient;

mod common;
use common::{EchoSynth, MockTts, ScriptedRecognizer, ScriptedReplies, test_config};

const GREETING: &str = "你好，我是测试助手。";

fn services(synthesizer: Arc<dyn parley_gateway::voice::Synthesizer>) -> TurnServices {
    TurnServices {
        recognizer: Arc::new(ScriptedRecognizer::new(&["去", "去南京"])),
        synthesizer,
        replies: Arc::new(ScriptedReplies::new(&["好的，", "南京见。"])),
        segmenter: SegmenterConfig::default(),
        max_chunk_bytes: 64 * 1024,
    }
}

async fn spawn_server(server: ApiServer) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(server.serve(listener));
    addr
}

/// Read frames until a status idle arrives; returns (events, binary chunks)
async fn read_turn<S>(ws: &mut S) -> (Vec<serde_json::Value>, Vec<Vec<u8>>)
where
    S: futures::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut events = Vec::new();
    let mut chunks = Vec::new();
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out")
            .expect("socket open")
            .expect("valid frame");
        match message {
            Message::Text(text) => {
                let event: serde_json::Value = serde_json::from_str(&text).unwrap();
                let idle = event["type"] == "status" && event["state"] == "idle";
                events.push(event);
                if idle {
                    return (events, chunks);
                }
            }
            Message::Binary(data) => chunks.push(data.to_vec()),
            _ => {}
        }
    }
}

#[tokio::test]
async fn health_endpoint() {
    let server = ApiServer::new(services(Arc::new(EchoSynth::instant())), GREETING.into(), 0);

    let response = server
        .router()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn static_client_is_served() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("index.html"), "<html>parley</html>").unwrap();

    let server = ApiServer::new(services(Arc::new(EchoSynth::instant())), GREETING.into(), 0)
        .static_dir(Some(dir.path().to_path_buf()));

    let response = server
        .router()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(&body[..], b"<html>parley</html>");
}

#[tokio::test]
async fn session_greets_then_answers_text() {
    let addr = spawn_server(ApiServer::new(
        services(Arc::new(EchoSynth::instant())),
        GREETING.into(),
        0,
    ))
    .await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();

    // Greeting
    let mut greeting = Vec::new();
    for _ in 0..2 {
        let Some(Ok(Message::Text(text))) = ws.next().await else {
            panic!("expected greeting");
        };
        greeting.push(serde_json::from_str::<serde_json::Value>(&text).unwrap());
    }
    assert_eq!(greeting[0]["type"], "chat_agent_start");
    assert_eq!(greeting[0]["latency"], "0ms");
    assert_eq!(greeting[1]["type"], "chat_agent_stream");
    assert_eq!(greeting[1]["text"], GREETING);

    ws.send(Message::text(r#"{"type":"text_input","text":"我想去南京"}"#))
        .await
        .unwrap();
    let (events, chunks) = read_turn(&mut ws).await;

    let types: Vec<&str> = events.iter().filter_map(|e| e["type"].as_str()).collect();
    assert_eq!(types.first(), Some(&"status"));
    assert!(types.contains(&"chat_agent_start"));
    assert_eq!(events.last().unwrap()["state"], "idle");

    // One sentence-ending segment: the comma alone never cuts the first one
    let audio: Vec<String> = chunks
        .iter()
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect();
    assert_eq!(audio, vec!["好的，南京见。|a", "好的，南京见。|b"]);
}

#[tokio::test]
async fn session_voice_turn_over_socket() {
    let addr = spawn_server(ApiServer::new(
        services(Arc::new(EchoSynth::instant())),
        GREETING.into(),
        0,
    ))
    .await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    // Skip greeting
    ws.next().await;
    ws.next().await;

    ws.send(Message::text(r#"{"type":"start_recording"}"#))
        .await
        .unwrap();
    ws.send(Message::binary(vec![0u8; 3200])).await.unwrap();
    ws.send(Message::binary(vec![0u8; 3200])).await.unwrap();
    ws.send(Message::text(r#"{"type":"stop_recording"}"#))
        .await
        .unwrap();

    let (events, chunks) = read_turn(&mut ws).await;
    let final_text = events
        .iter()
        .find(|e| e["type"] == "chat_user")
        .expect("final transcript");
    assert_eq!(final_text["text"], "去南京");
    assert!(events.iter().any(|e| e["type"] == "chat_user_temp"));
    assert!(!chunks.is_empty());
}

#[tokio::test]
async fn session_with_streaming_synthesis_backend() {
    let tts = MockTts::spawn(&[]).await;
    let synth = TtsClient::new(test_config("ws://unused", &tts.url)).unwrap();
    let addr = spawn_server(ApiServer::new(
        services(Arc::new(synth)),
        GREETING.into(),
        0,
    ))
    .await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    ws.next().await;
    ws.next().await;

    ws.send(Message::text(r#"{"type":"text_input","text":"去南京"}"#))
        .await
        .unwrap();
    let (_, chunks) = read_turn(&mut ws).await;

    let audio: Vec<String> = chunks
        .iter()
        .map(|c| String::from_utf8_lossy(c).into_owned())
        .collect();
    assert_eq!(audio, vec!["好的，南京见。#0", "好的，南京见。#1"]);
    assert_eq!(*tts.texts.lock().unwrap(), vec!["好的，南京见。"]);
}

#[tokio::test]
async fn unknown_messages_are_ignored() {
    let addr = spawn_server(ApiServer::new(
        services(Arc::new(EchoSynth::instant())),
        GREETING.into(),
        0,
    ))
    .await;
    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    ws.next().await;
    ws.next().await;

    ws.send(Message::text("not json")).await.unwrap();
    ws.send(Message::text(r#"{"type":"dance"}"#)).await.unwrap();
    // Audio while not recording is dropped
    ws.send(Message::binary(vec![1u8; 64])).await.unwrap();
    ws.send(Message::text(r#"{"type":"text_input","text":"还在吗"}"#))
        .await
        .unwrap();

    let (events, _) = read_turn(&mut ws).await;
    assert_eq!(events.last().unwrap()["state"], "idle");
}
