use room_client::{
    AttachmentCodec, ChangeCause, DeleteRequest, LocalRef, Message, MessageBody, MessageRenderer,
    Origin, RenderOp, RenderSync, ResourceRef, SessionEvent, SessionState, Viewport,
};
use shared::domain::UserId;

/// Renders one message as a single terminal line.
pub struct TerminalRenderer;

impl MessageRenderer for TerminalRenderer {
    type Node = String;

    fn render(&mut self, message: &Message, delete: Option<DeleteRequest>) -> String {
        let body = match &message.body {
            MessageBody::Text(content) => sanitize(content),
            MessageBody::File {
                file_name,
                attachment_url,
            } => match AttachmentCodec::decode(attachment_url) {
                ResourceRef::Inline { bytes, .. } => {
                    format!("[file {} ({} bytes)]", sanitize(file_name), bytes.len())
                }
                ResourceRef::Remote(url) => format!("[file {} {url}]", sanitize(file_name)),
                ResourceRef::Relative(path) | ResourceRef::Opaque(path) => {
                    format!("[file {} {}]", sanitize(file_name), sanitize(&path))
                }
            },
        };
        let status = match (message.origin, message.local_ref) {
            (Origin::LocalPending, _) => " (sending)".to_string(),
            (Origin::Failed, Some(local_ref)) => format!(" (failed, /retry {})", local_ref.seq),
            _ => String::new(),
        };
        let handle = match delete {
            Some(request) => format!(" [{}]", sanitize(request.message_id.as_str())),
            None => String::new(),
        };
        format!(
            "{} {}: {body}{status}{handle}",
            message.created_at.format("%H:%M"),
            sanitize(&message.author_name),
        )
    }
}

/// Drops control characters so remote text cannot drive the terminal.
pub fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|ch| if ch.is_control() { ' ' } else { ch })
        .collect()
}

/// Line-oriented view of one room.
pub struct Screen {
    sync: RenderSync<TerminalRenderer>,
    messages: Vec<Message>,
}

impl Screen {
    pub fn new(viewer: UserId, follow_threshold_px: f32) -> Self {
        Self {
            sync: RenderSync::new(TerminalRenderer, viewer).with_follow_threshold(follow_threshold_px),
            messages: Vec::new(),
        }
    }

    pub fn local_ref(&self, seq: u64) -> Option<LocalRef> {
        self.messages
            .iter()
            .filter_map(|message| message.local_ref)
            .find(|local_ref| local_ref.seq == seq)
    }

    /// Prints what changed. Returns false once the session is gone.
    pub fn on_event(&mut self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::StoreChanged { cause, messages } => {
                for line in self.update(&messages, cause) {
                    println!("{line}");
                }
            }
            SessionEvent::StateChanged(SessionState::Disconnected) => {
                println!("-- disconnected");
                return false;
            }
            SessionEvent::StateChanged(state) => println!("-- {state:?}"),
            SessionEvent::SendFailed { .. } => {}
            SessionEvent::DeleteRejected(rejected) => println!("-- {rejected}"),
            SessionEvent::Error(error) => println!("-- {error}"),
        }
        true
    }

    /// Terminal output is append-only, so every op becomes a line.
    pub fn update(&mut self, messages: &[Message], cause: ChangeCause) -> Vec<String> {
        self.messages = messages.to_vec();
        let pass = self.sync.reconcile(messages, cause, Viewport::at_bottom());
        pass.ops
            .into_iter()
            .map(|op| match op {
                RenderOp::Insert { node, .. } => node,
                RenderOp::Replace { node, .. } => format!("~ {node}"),
                RenderOp::Remove { key, .. } => format!("- removed {key:?}"),
            })
            .collect()
    }
}
