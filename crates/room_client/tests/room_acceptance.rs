use std::sync::Arc;

use axum::{
    extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};
use chrono::{TimeZone, Utc};
use room_client::{
    ChangeCause, ChannelSession, RenderSync, SendOutcome, SessionConfig, SessionState,
    ViewRenderer, Viewport, WsTransport,
};
use serde_json::json;
use shared::{
    domain::{MessageId, MessageKind, Participant, RoomId},
    protocol::{ClientFrame, ClientPush, Reply, ServerEvent, ServerFrame, WireMessage},
};
use tokio::net::TcpListener;

fn history() -> Vec<WireMessage> {
    (0..3)
        .map(|n| WireMessage {
            id: MessageId::from(format!("history{n}")),
            user_id: "bob".into(),
            user_name: "Bob".into(),
            content: format!("old message {n}"),
            message_type: MessageKind::Text,
            attachment_url: None,
            inserted_at: Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, n).unwrap(),
        })
        .collect()
}

/// A minimal room server: acknowledges every push and broadcasts new and
/// deleted messages back on the same socket.
async fn room_server(mut socket: WebSocket) {
    let mut next_id = 0;
    while let Some(Ok(WsMessage::Text(text))) = socket.recv().await {
        let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
            continue;
        };
        let mut broadcasts = Vec::new();
        let response = match &frame.push {
            ClientPush::Join { .. } | ClientPush::Leave => json!({}),
            ClientPush::HistorySync => json!({ "messages": history() }),
            ClientPush::NewMessage { content } => {
                next_id += 1;
                let wire = WireMessage {
                    id: MessageId::from(format!("srv-{next_id}")),
                    user_id: "alice".into(),
                    user_name: "Alice".into(),
                    content: content.clone(),
                    message_type: MessageKind::Text,
                    attachment_url: None,
                    inserted_at: Utc::now(),
                };
                broadcasts.push(ServerEvent::MessageNew(wire.clone()));
                json!(wire)
            }
            ClientPush::FileMessage { .. } => json!({}),
            ClientPush::DeleteMessage { message_id } => {
                broadcasts.push(ServerEvent::MessageDeleted {
                    message_id: message_id.clone(),
                });
                json!({})
            }
        };

        let mut outbound = vec![ServerFrame::Reply {
            topic: frame.topic.clone(),
            push_ref: frame.push_ref,
            reply: Reply::Ok(response),
        }];
        outbound.extend(broadcasts.into_iter().map(|event| ServerFrame::Broadcast {
            topic: frame.topic.clone(),
            event,
        }));
        for frame in outbound {
            let text = serde_json::to_string(&frame).expect("encode frame");
            if socket.send(WsMessage::Text(text)).await.is_err() {
                return;
            }
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(room_server)
}

async fn spawn_room_server() -> String {
    let app = Router::new().route("/socket", get(ws_handler));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("ws://{addr}/socket")
}

#[tokio::test]
async fn join_room_42_send_and_delete() {
    let server_url = spawn_room_server().await;
    let transport = WsTransport::connect(&server_url, 64).await.expect("connect");
    let session = ChannelSession::new(
        RoomId::from("42"),
        Participant::new("alice", "Alice"),
        Arc::new(transport),
        SessionConfig::default(),
    );

    session.join().await.expect("join");
    assert_eq!(session.state().await, SessionState::Joined);
    assert_eq!(session.snapshot().await.len(), 3);

    let pending = session.send_text("A").await.expect("send");
    let SendOutcome::Confirmed(id) = pending.outcome().await else {
        panic!("send was not confirmed");
    };
    let ids: Vec<String> = session
        .snapshot()
        .await
        .iter()
        .map(|m| m.id.to_string())
        .collect();
    assert_eq!(ids, vec!["history0", "history1", "history2", id.as_str()]);

    let mut sync = RenderSync::new(ViewRenderer::new("alice".into()), "alice".into());
    let mut view = Vec::new();
    sync.reconcile(&session.snapshot().await, ChangeCause::History, Viewport::at_bottom())
        .apply(&mut view);
    assert_eq!(view.len(), 4);
    assert!(view[3].1.delete.is_some());

    session
        .delete(id.clone())
        .await
        .expect("delete accepted")
        .outcome()
        .await
        .expect("delete confirmed");
    assert!(session.snapshot().await.iter().all(|m| m.id != id));

    session.leave().await;
    assert_eq!(session.state().await, SessionState::Disconnected);
}
