use std::fmt;

use chrono::{DateTime, Utc};
use shared::{
    domain::{MessageId, MessageKind, Participant, UserId},
    protocol::WireMessage,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    LocalPending,
    Confirmed,
    Remote,
    Failed,
}

impl Origin {
    pub fn is_settled(self) -> bool {
        matches!(self, Self::Confirmed | Self::Remote)
    }
}

/// Client reference for a locally submitted message. `seq` is the submission
/// order within a session and never changes, including across retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalRef {
    pub seq: u64,
    pub token: Uuid,
}

impl LocalRef {
    pub fn new(seq: u64) -> Self {
        Self {
            seq,
            token: Uuid::new_v4(),
        }
    }

    pub fn placeholder_id(&self) -> MessageId {
        MessageId(format!("local-{}", self.token))
    }
}

impl fmt::Display for LocalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.seq)
    }
}

/// Stable identity of a visible entry. Locally originated entries keep their
/// local key after confirmation so they are replaced in place.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RenderKey {
    Local(LocalRef),
    Server(MessageId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    File {
        file_name: String,
        attachment_url: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub author_id: UserId,
    pub author_name: String,
    pub body: MessageBody,
    pub created_at: DateTime<Utc>,
    pub origin: Origin,
    pub local_ref: Option<LocalRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidMessage {
    #[error("file message {0} has no attachment_url")]
    MissingAttachmentUrl(MessageId),
    #[error("message has an empty id")]
    EmptyId,
}

impl Message {
    pub fn local_pending(
        local_ref: LocalRef,
        author: &Participant,
        body: MessageBody,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: local_ref.placeholder_id(),
            author_id: author.user_id.clone(),
            author_name: author.display_name.clone(),
            body,
            created_at,
            origin: Origin::LocalPending,
            local_ref: Some(local_ref),
        }
    }

    pub fn from_wire(wire: WireMessage, origin: Origin) -> Result<Self, InvalidMessage> {
        if wire.id.as_str().is_empty() {
            return Err(InvalidMessage::EmptyId);
        }
        let body = match wire.message_type {
            MessageKind::Text => MessageBody::Text(wire.content),
            MessageKind::File => MessageBody::File {
                attachment_url: wire
                    .attachment_url
                    .ok_or_else(|| InvalidMessage::MissingAttachmentUrl(wire.id.clone()))?,
                file_name: wire.content,
            },
        };
        Ok(Self {
            id: wire.id,
            author_id: wire.user_id,
            author_name: wire.user_name,
            body,
            created_at: wire.inserted_at,
            origin,
            local_ref: None,
        })
    }

    pub fn kind(&self) -> MessageKind {
        match self.body {
            MessageBody::Text(_) => MessageKind::Text,
            MessageBody::File { .. } => MessageKind::File,
        }
    }

    pub fn attachment_url(&self) -> Option<&str> {
        match &self.body {
            MessageBody::Text(_) => None,
            MessageBody::File { attachment_url, .. } => Some(attachment_url),
        }
    }

    pub fn render_key(&self) -> RenderKey {
        match self.local_ref {
            Some(local_ref) => RenderKey::Local(local_ref),
            None => RenderKey::Server(self.id.clone()),
        }
    }

    pub fn is_authored_by(&self, user_id: &UserId) -> bool {
        &self.author_id == user_id
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = InvalidMessage;

    fn try_from(wire: WireMessage) -> Result<Self, Self::Error> {
        Self::from_wire(wire, Origin::Remote)
    }
}
