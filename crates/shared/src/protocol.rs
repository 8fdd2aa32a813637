use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{MessageId, MessageKind, RoomId, UserId},
    error::ApiError,
};

/// A message as the server stores and broadcasts it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: MessageId,
    pub user_id: UserId,
    pub user_name: String,
    pub content: String,
    pub message_type: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment_url: Option<String>,
    pub inserted_at: DateTime<Utc>,
}

/// Pushes a client sends on a room topic. Every push is answered by exactly
/// one [`Reply`] carrying the same `ref`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ClientPush {
    #[serde(rename = "join")]
    Join { room_id: RoomId },
    #[serde(rename = "history:sync")]
    HistorySync,
    #[serde(rename = "message:new")]
    NewMessage { content: String },
    #[serde(rename = "message:file")]
    FileMessage { file_data: String, file_name: String },
    #[serde(rename = "message:delete")]
    DeleteMessage { message_id: MessageId },
    #[serde(rename = "leave")]
    Leave,
}

impl ClientPush {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::HistorySync => "history:sync",
            Self::NewMessage { .. } => "message:new",
            Self::FileMessage { .. } => "message:file",
            Self::DeleteMessage { .. } => "message:delete",
            Self::Leave => "leave",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub topic: String,
    #[serde(rename = "ref")]
    pub push_ref: u64,
    pub push: ClientPush,
}

impl ClientFrame {
    pub fn new(topic: impl Into<String>, push_ref: u64, push: ClientPush) -> Self {
        Self {
            topic: topic.into(),
            push_ref,
            push,
        }
    }
}

/// Broadcasts delivered to every subscriber of a room topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload")]
pub enum ServerEvent {
    #[serde(rename = "messages:history")]
    History { messages: Vec<WireMessage> },
    #[serde(rename = "message:new")]
    MessageNew(WireMessage),
    #[serde(rename = "message:deleted")]
    MessageDeleted { message_id: MessageId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "response", rename_all = "snake_case")]
pub enum Reply {
    Ok(serde_json::Value),
    Error(ApiError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    Reply {
        topic: String,
        #[serde(rename = "ref")]
        push_ref: u64,
        reply: Reply,
    },
    Broadcast {
        topic: String,
        event: ServerEvent,
    },
}

impl ServerFrame {
    pub fn topic(&self) -> &str {
        match self {
            Self::Reply { topic, .. } | Self::Broadcast { topic, .. } => topic,
        }
    }
}
