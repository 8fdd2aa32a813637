use super::*;
use axum::{
    extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};
use shared::protocol::{ClientPush, Reply, ServerEvent};
use tokio::{net::TcpListener, sync::broadcast::error::RecvError};

async fn reply_then_close(mut socket: WebSocket) {
    let Some(Ok(WsMessage::Text(text))) = socket.recv().await else {
        return;
    };
    let frame: ClientFrame = match serde_json::from_str(&text) {
        Ok(frame) => frame,
        Err(_) => return,
    };
    let reply = ServerFrame::Reply {
        topic: frame.topic.clone(),
        push_ref: frame.push_ref,
        reply: Reply::Ok(serde_json::json!({})),
    };
    let deleted = ServerFrame::Broadcast {
        topic: frame.topic,
        event: ServerEvent::MessageDeleted {
            message_id: "m7".into(),
        },
    };
    for outbound in [reply, deleted] {
        let text = serde_json::to_string(&outbound).expect("encode");
        if socket.send(WsMessage::Text(text)).await.is_err() {
            return;
        }
    }
    let _ = socket.send(WsMessage::Text("not json".into())).await;
    let _ = socket.send(WsMessage::Close(None)).await;
}

async fn ws_handler(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(reply_then_close)
}

async fn spawn_socket_server() -> Result<String> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = Router::new().route("/socket", get(ws_handler));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(format!("http://{addr}/socket"))
}

#[tokio::test]
async fn pushes_frames_and_fans_out_replies_and_broadcasts() {
    let server_url = spawn_socket_server().await.expect("spawn server");
    let transport = WsTransport::connect(&server_url, 16).await.expect("connect");
    let mut frames = transport.subscribe();

    transport
        .push(ClientFrame::new(
            "room:42",
            1,
            ClientPush::Join {
                room_id: "42".into(),
            },
        ))
        .await
        .expect("push");

    let first = frames.recv().await.expect("reply");
    assert!(matches!(
        first,
        ServerFrame::Reply {
            push_ref: 1,
            reply: Reply::Ok(_),
            ..
        }
    ));
    let second = frames.recv().await.expect("broadcast");
    assert_eq!(second.topic(), "room:42");

    // the malformed frame is dropped and the close surfaces as a closed subscription
    assert!(matches!(frames.recv().await, Err(RecvError::Closed)));
    assert!(matches!(
        transport.subscribe().recv().await,
        Err(RecvError::Closed)
    ));
}

#[test]
fn websocket_url_maps_http_schemes() {
    assert_eq!(
        websocket_url("https://chat.example.com/socket").expect("https"),
        "wss://chat.example.com/socket"
    );
    assert_eq!(
        websocket_url("http://127.0.0.1:4000/socket").expect("http"),
        "ws://127.0.0.1:4000/socket"
    );
    assert_eq!(
        websocket_url("ws://127.0.0.1:4000/socket").expect("ws"),
        "ws://127.0.0.1:4000/socket"
    );
    assert!(websocket_url("chat.example.com").is_err());
}
