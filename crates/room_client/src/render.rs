use std::collections::{HashMap, HashSet};

use shared::domain::{MessageId, UserId};

use crate::{
    attachment::{AttachmentCodec, ResourceRef},
    session::ChangeCause,
    types::{LocalRef, Message, MessageBody, Origin, RenderKey},
};

pub const DEFAULT_FOLLOW_THRESHOLD_PX: f32 = 48.0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteRequest {
    pub message_id: MessageId,
}

pub trait MessageRenderer {
    type Node: Clone;

    fn render(&mut self, message: &Message, delete: Option<DeleteRequest>) -> Self::Node;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub offset: f32,
    pub height: f32,
    pub content_height: f32,
}

impl Viewport {
    pub fn at_bottom() -> Self {
        Self {
            offset: 0.0,
            height: 0.0,
            content_height: 0.0,
        }
    }

    pub fn distance_from_bottom(&self) -> f32 {
        (self.content_height - self.height - self.offset).max(0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScrollAction {
    FollowBottom,
    Preserve { offset: f32 },
}

/// One view mutation. Indices refer to the list as it stands when the op is
/// applied, so ops must be applied in order.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderOp<N> {
    Insert { index: usize, key: RenderKey, node: N },
    Replace { index: usize, key: RenderKey, node: N },
    Remove { index: usize, key: RenderKey },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderPass<N> {
    pub ops: Vec<RenderOp<N>>,
    pub scroll: ScrollAction,
}

impl<N> RenderPass<N> {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn apply(self, view: &mut Vec<(RenderKey, N)>) {
        for op in self.ops {
            match op {
                RenderOp::Insert { index, key, node } => view.insert(index, (key, node)),
                RenderOp::Replace { index, key, node } => view[index] = (key, node),
                RenderOp::Remove { index, .. } => {
                    view.remove(index);
                }
            }
        }
    }
}

pub struct RenderSync<R: MessageRenderer> {
    renderer: R,
    viewer: UserId,
    follow_threshold: f32,
    rendered: Vec<(RenderKey, Message, R::Node)>,
}

impl<R: MessageRenderer> RenderSync<R> {
    pub fn new(renderer: R, viewer: UserId) -> Self {
        Self {
            renderer,
            viewer,
            follow_threshold: DEFAULT_FOLLOW_THRESHOLD_PX,
            rendered: Vec::new(),
        }
    }

    pub fn with_follow_threshold(mut self, threshold_px: f32) -> Self {
        self.follow_threshold = threshold_px.max(0.0);
        self
    }

    pub fn renderer(&self) -> &R {
        &self.renderer
    }

    pub fn keys(&self) -> impl Iterator<Item = &RenderKey> {
        self.rendered.iter().map(|(key, ..)| key)
    }

    pub fn len(&self) -> usize {
        self.rendered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rendered.is_empty()
    }

    pub fn reconcile(
        &mut self,
        messages: &[Message],
        cause: ChangeCause,
        viewport: Viewport,
    ) -> RenderPass<R::Node> {
        let target: Vec<(RenderKey, &Message)> = messages
            .iter()
            .map(|message| (message.render_key(), message))
            .collect();
        let target_index: HashMap<&RenderKey, usize> = target
            .iter()
            .enumerate()
            .map(|(index, (key, _))| (key, index))
            .collect();

        // Old entries that survive, as positions in the target order. The
        // longest increasing run stays put; everything else is re-inserted
        // with the node it already had.
        let survivors: Vec<(usize, usize)> = self
            .rendered
            .iter()
            .enumerate()
            .filter_map(|(old, (key, ..))| target_index.get(key).map(|&new| (old, new)))
            .collect();
        let positions: Vec<usize> = survivors.iter().map(|&(_, new)| new).collect();
        let stable: HashSet<usize> = longest_increasing_run(&positions)
            .into_iter()
            .map(|at| survivors[at].0)
            .collect();

        let mut ops = Vec::new();
        let mut moved: HashMap<RenderKey, (Message, R::Node)> = HashMap::new();
        for old in (0..self.rendered.len()).rev() {
            if stable.contains(&old) {
                continue;
            }
            let (key, message, node) = self.rendered.remove(old);
            ops.push(RenderOp::Remove {
                index: old,
                key: key.clone(),
            });
            moved.insert(key, (message, node));
        }
        let mut kept: HashMap<RenderKey, (Message, R::Node)> = self
            .rendered
            .drain(..)
            .map(|(key, message, node)| (key, (message, node)))
            .collect();

        let mut rendered = Vec::with_capacity(target.len());
        for (index, (key, message)) in target.into_iter().enumerate() {
            let node = if let Some((old, node)) = kept.remove(&key) {
                if &old == message {
                    node
                } else {
                    let node = self.render(message);
                    ops.push(RenderOp::Replace {
                        index,
                        key: key.clone(),
                        node: node.clone(),
                    });
                    node
                }
            } else {
                let node = match moved.remove(&key) {
                    Some((old, node)) if &old == message => node,
                    _ => self.render(message),
                };
                ops.push(RenderOp::Insert {
                    index,
                    key: key.clone(),
                    node: node.clone(),
                });
                node
            };
            rendered.push((key, message.clone(), node));
        }
        self.rendered = rendered;

        let scroll = if ops.is_empty() {
            ScrollAction::Preserve {
                offset: viewport.offset,
            }
        } else if cause.is_own_send() || viewport.distance_from_bottom() <= self.follow_threshold {
            ScrollAction::FollowBottom
        } else {
            ScrollAction::Preserve {
                offset: viewport.offset,
            }
        };
        RenderPass { ops, scroll }
    }

    fn render(&mut self, message: &Message) -> R::Node {
        let delete = (message.origin.is_settled() && message.is_authored_by(&self.viewer)).then(|| {
            DeleteRequest {
                message_id: message.id.clone(),
            }
        });
        self.renderer.render(message, delete)
    }
}

fn longest_increasing_run(values: &[usize]) -> Vec<usize> {
    let mut tails: Vec<usize> = Vec::new();
    let mut parent: Vec<Option<usize>> = vec![None; values.len()];
    for (at, &value) in values.iter().enumerate() {
        let slot = tails.partition_point(|&tail| values[tail] < value);
        if slot > 0 {
            parent[at] = Some(tails[slot - 1]);
        }
        if slot == tails.len() {
            tails.push(at);
        } else {
            tails[slot] = at;
        }
    }

    let mut run = Vec::with_capacity(tails.len());
    let mut cursor = tails.last().copied();
    while let Some(at) = cursor {
        run.push(at);
        cursor = parent[at];
    }
    run.reverse();
    run
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewStatus {
    Sending,
    Sent,
    Received,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentView {
    pub file_name: String,
    pub resource: ResourceRef,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageView {
    pub key: RenderKey,
    pub author: String,
    pub text: Option<String>,
    pub attachment: Option<AttachmentView>,
    pub timestamp: String,
    pub status: ViewStatus,
    pub own: bool,
    pub delete: Option<DeleteRequest>,
    pub retry: Option<LocalRef>,
}

pub struct ViewRenderer {
    viewer: UserId,
}

impl ViewRenderer {
    pub fn new(viewer: UserId) -> Self {
        Self { viewer }
    }
}

impl MessageRenderer for ViewRenderer {
    type Node = MessageView;

    fn render(&mut self, message: &Message, delete: Option<DeleteRequest>) -> MessageView {
        let (text, attachment) = match &message.body {
            MessageBody::Text(content) => (Some(escape_text(content)), None),
            MessageBody::File {
                file_name,
                attachment_url,
            } => (
                None,
                Some(AttachmentView {
                    file_name: escape_text(file_name),
                    resource: AttachmentCodec::decode(attachment_url),
                }),
            ),
        };
        let status = match message.origin {
            Origin::LocalPending => ViewStatus::Sending,
            Origin::Confirmed => ViewStatus::Sent,
            Origin::Remote => ViewStatus::Received,
            Origin::Failed => ViewStatus::Failed,
        };
        MessageView {
            key: message.render_key(),
            author: escape_text(&message.author_name),
            text,
            attachment,
            timestamp: message.created_at.format("%H:%M").to_string(),
            status,
            own: message.is_authored_by(&self.viewer),
            delete,
            retry: match message.origin {
                Origin::Failed => message.local_ref,
                _ => None,
            },
        }
    }
}

pub fn escape_text(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

#[cfg(test)]
#[path = "tests/render_tests.rs"]
mod tests;
