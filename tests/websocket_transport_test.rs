//! WebSocket 传输：对本地 tungstenite 服务器收发

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use hive::transport::{Transport, WebSocketTransport};

#[tokio::test]
async fn test_login_roundtrip_and_server_close() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (received_tx, received_rx) = oneshot::channel::<Vec<String>>();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        let mut received = Vec::new();

        while received.len() < 2 {
            match ws.next().await {
                Some(Ok(WsMessage::Text(text))) => {
                    if received.is_empty() {
                        ws.send(WsMessage::Text(
                            json!({"message_type": 7, "type": "assign-name", "data": {"name": "Bob"}})
                                .to_string(),
                        ))
                        .await
                        .unwrap();
                    }
                    received.push(text);
                }
                Some(Ok(_)) => continue,
                _ => break,
            }
        }
        let _ = received_tx.send(received);
        let _ = ws.close(None).await;
    });

    let transport = WebSocketTransport::new(&format!("ws://{addr}"), Some(json!({"type": "join", "gameId": 7})));
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport.connect(tx).await.unwrap();

    let first = rx.recv().await.unwrap();
    assert!(first.contains("assign-name"));

    transport.send(r#"{"type":"player-is-ready"}"#.to_string()).await.unwrap();

    let received = received_rx.await.unwrap();
    assert_eq!(received[0], json!({"type": "join", "gameId": 7}).to_string());
    assert_eq!(received[1], r#"{"type":"player-is-ready"}"#);

    assert_eq!(rx.recv().await, None, "inbound channel closes with the connection");
    server.await.unwrap();
    transport.close().await;
}

#[tokio::test]
async fn test_send_before_connect_fails() {
    let transport = WebSocketTransport::new("ws://127.0.0.1:9", None);
    let err = transport.send("{}".to_string()).await.unwrap_err();
    assert_eq!(err.kind(), "transport_failure");
}
