//! Client-side synchronization core for real-time room chat.

pub mod attachment;
pub mod config;
pub mod error;
pub mod render;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;

pub use attachment::{AttachmentCodec, AttachmentFetcher, EncodedPayload, ResourceRef};
pub use config::{load_settings, ClientSettings};
pub use error::{AttachmentError, ConfigError, DeleteRejected, PushFailure, SessionError};
pub use render::{
    DeleteRequest, MessageRenderer, MessageView, RenderOp, RenderPass, RenderSync, ScrollAction,
    ViewRenderer, Viewport,
};
pub use session::{
    ChangeCause, ChannelSession, PendingDelete, PendingSend, SendOutcome, SessionConfig,
    SessionEvent, SessionState,
};
pub use store::MessageStore;
pub use transport::{ChannelTransport, WsTransport};
pub use types::{LocalRef, Message, MessageBody, Origin, RenderKey};
