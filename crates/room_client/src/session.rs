use std::{
    collections::{HashMap, HashSet, VecDeque},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use shared::{
    domain::{MessageId, Participant, RoomId},
    protocol::{ClientFrame, ClientPush, Reply, ServerEvent, ServerFrame, WireMessage},
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, oneshot, Mutex},
    task::JoinHandle,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    attachment::{AttachmentCodec, EncodedPayload},
    config::ClientSettings,
    error::{DeleteRejected, PushFailure, SessionError},
    store::MessageStore,
    transport::ChannelTransport,
    types::{LocalRef, Message, MessageBody},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Joining,
    Joined,
    JoinFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeCause {
    History,
    RemoteNew,
    RemoteDelete,
    LocalSend,
    Retry,
    Acknowledged,
    SendFailed,
    Discarded,
    Deleted,
    Disconnect,
}

impl ChangeCause {
    pub fn is_own_send(self) -> bool {
        matches!(self, Self::LocalSend | Self::Retry)
    }
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged(SessionState),
    StoreChanged {
        cause: ChangeCause,
        messages: Arc<[Message]>,
    },
    SendFailed {
        local_ref: LocalRef,
        failure: PushFailure,
    },
    DeleteRejected(DeleteRejected),
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Confirmed(MessageId),
    Failed(PushFailure),
    Cancelled,
}

#[derive(Debug)]
pub struct PendingSend {
    local_ref: LocalRef,
    outcome: oneshot::Receiver<SendOutcome>,
}

impl PendingSend {
    pub fn local_ref(&self) -> LocalRef {
        self.local_ref
    }

    pub async fn outcome(self) -> SendOutcome {
        self.outcome.await.unwrap_or(SendOutcome::Cancelled)
    }
}

#[derive(Debug)]
pub struct PendingDelete {
    message_id: MessageId,
    outcome: oneshot::Receiver<Result<(), DeleteRejected>>,
}

impl PendingDelete {
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    pub async fn outcome(self) -> Result<(), DeleteRejected> {
        match self.outcome.await {
            Ok(result) => result,
            Err(_) => Err(DeleteRejected::Failed {
                message_id: self.message_id,
                failure: PushFailure::Cancelled,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub ack_timeout: Duration,
    pub max_attachment_bytes: u64,
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::from(&ClientSettings::default())
    }
}

impl From<&ClientSettings> for SessionConfig {
    fn from(settings: &ClientSettings) -> Self {
        Self {
            ack_timeout: settings.ack_timeout(),
            max_attachment_bytes: settings.max_attachment_bytes,
            event_buffer: settings.event_buffer,
        }
    }
}

#[derive(Debug, Deserialize)]
struct HistoryReply {
    #[serde(default)]
    messages: Option<Vec<WireMessage>>,
}

fn history_batch(value: &Value) -> Result<Option<Vec<WireMessage>>, serde_json::Error> {
    if value.is_null() {
        return Ok(None);
    }
    HistoryReply::deserialize(value).map(|reply| reply.messages)
}

struct OutboundSend {
    push: ClientPush,
    completion: Option<oneshot::Sender<SendOutcome>>,
}

struct Dispatch {
    epoch: u64,
    local_ref: LocalRef,
    frame: ClientFrame,
    reply: oneshot::Receiver<Reply>,
}

struct SessionInner {
    state: SessionState,
    epoch: u64,
    history_synced: bool,
    store: MessageStore,
    next_seq: u64,
    awaiting_replies: HashMap<u64, oneshot::Sender<Reply>>,
    history_refs: HashSet<u64>,
    outbound: HashMap<LocalRef, OutboundSend>,
    queued: VecDeque<LocalRef>,
    router: Option<JoinHandle<()>>,
}

impl SessionInner {
    fn accepts_inbound(&self, epoch: u64) -> bool {
        self.epoch == epoch && matches!(self.state, SessionState::Joining | SessionState::Joined)
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.epoch == epoch && self.state == SessionState::Joined
    }
}

pub struct ChannelSession {
    room_id: RoomId,
    topic: String,
    participant: Participant,
    transport: Arc<dyn ChannelTransport>,
    codec: AttachmentCodec,
    ack_timeout: Duration,
    next_ref: AtomicU64,
    inner: Mutex<SessionInner>,
    events: broadcast::Sender<SessionEvent>,
}

impl ChannelSession {
    pub fn new(
        room_id: RoomId,
        participant: Participant,
        transport: Arc<dyn ChannelTransport>,
        config: SessionConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Arc::new(Self {
            topic: room_id.topic(),
            room_id,
            transport,
            codec: AttachmentCodec::new(config.max_attachment_bytes),
            ack_timeout: config.ack_timeout,
            next_ref: AtomicU64::new(1),
            inner: Mutex::new(SessionInner {
                state: SessionState::Disconnected,
                epoch: 0,
                history_synced: false,
                store: MessageStore::new(participant.user_id.clone()),
                next_seq: 0,
                awaiting_replies: HashMap::new(),
                history_refs: HashSet::new(),
                outbound: HashMap::new(),
                queued: VecDeque::new(),
                router: None,
            }),
            participant,
            events,
        })
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn participant(&self) -> &Participant {
        &self.participant
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    pub async fn snapshot(&self) -> Vec<Message> {
        self.inner.lock().await.store.snapshot()
    }

    pub fn is_own(&self, message: &Message) -> bool {
        message.is_authored_by(&self.participant.user_id)
    }

    pub async fn join(self: &Arc<Self>) -> Result<(), SessionError> {
        let (epoch, frame, reply) = {
            let mut inner = self.inner.lock().await;
            match inner.state {
                SessionState::Joining => return Err(SessionError::JoinInProgress),
                SessionState::Joined => return Err(SessionError::AlreadyJoined),
                SessionState::Disconnected | SessionState::JoinFailed => {}
            }
            inner.epoch += 1;
            inner.history_synced = false;
            let epoch = inner.epoch;
            inner.router = Some(self.spawn_router(epoch));
            self.set_state(&mut inner, SessionState::Joining);
            let (push_ref, reply) = self.register_reply(&mut inner);
            let push = ClientPush::Join {
                room_id: self.room_id.clone(),
            };
            (epoch, self.frame(push_ref, push), reply)
        };

        info!(room_id = %self.room_id, epoch, "session: joining room");
        if let Err(failure) = self.request(frame, reply).await {
            return Err(self.fail_join(epoch, failure).await);
        }

        let (frame, reply) = {
            let mut inner = self.inner.lock().await;
            if !inner.accepts_inbound(epoch) {
                return Err(SessionError::JoinFailed(PushFailure::Cancelled));
            }
            self.set_state(&mut inner, SessionState::Joined);
            let (push_ref, reply) = self.register_history(&mut inner);
            (self.frame(push_ref, ClientPush::HistorySync), reply)
        };

        info!(room_id = %self.room_id, epoch, "session: joined, requesting history");
        let value = match self.request(frame, reply).await {
            Ok(value) => value,
            Err(failure) => return Err(self.fail_join(epoch, failure).await),
        };
        // the router applied any batch in the ack before handing it over
        match history_batch(&value) {
            Ok(Some(_)) => {}
            Ok(None) => debug!(room_id = %self.room_id, "session: history will arrive as broadcast"),
            Err(err) => {
                return Err(self
                    .fail_join(epoch, PushFailure::InvalidReply(err.to_string()))
                    .await)
            }
        }
        Ok(())
    }

    pub async fn leave(&self) {
        let frame = {
            let mut inner = self.inner.lock().await;
            if inner.state == SessionState::Disconnected {
                return;
            }
            info!(room_id = %self.room_id, epoch = inner.epoch, "session: leaving room");
            self.teardown(&mut inner);
            self.frame(self.next_push_ref(), ClientPush::Leave)
        };
        if let Err(err) = self.transport.push(frame).await {
            debug!(room_id = %self.room_id, "session: leave push failed: {err}");
        }
    }

    pub async fn send_text(
        self: &Arc<Self>,
        content: impl Into<String>,
    ) -> Result<PendingSend, SessionError> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        let push = ClientPush::NewMessage {
            content: content.clone(),
        };
        self.submit(MessageBody::Text(content), push).await
    }

    pub async fn send_file(
        self: &Arc<Self>,
        path: impl AsRef<Path>,
    ) -> Result<PendingSend, SessionError> {
        let payload = self.codec.encode(path).await?;
        self.send_attachment(payload).await
    }

    pub async fn send_attachment(
        self: &Arc<Self>,
        payload: EncodedPayload,
    ) -> Result<PendingSend, SessionError> {
        let body = MessageBody::File {
            file_name: payload.file_name.clone(),
            attachment_url: payload.data_url(),
        };
        self.submit(body, payload.to_push()).await
    }

    pub async fn retry(self: &Arc<Self>, local_ref: LocalRef) -> Result<PendingSend, SessionError> {
        let (tx, rx) = oneshot::channel();
        let dispatch = {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::Joined {
                return Err(SessionError::NotJoined(inner.state));
            }
            if inner.store.local_entry(local_ref).is_none()
                || !inner.outbound.contains_key(&local_ref)
            {
                return Err(SessionError::UnknownLocalRef(local_ref));
            }
            if !inner.store.mark_pending(local_ref) {
                return Err(SessionError::NotFailed(local_ref));
            }
            if let Some(outbound) = inner.outbound.get_mut(&local_ref) {
                outbound.completion = Some(tx);
            }
            self.emit_store(&inner, ChangeCause::Retry);
            debug!(room_id = %self.room_id, %local_ref, "session: retrying message");
            self.dispatch_or_queue(&mut inner, local_ref)
        };
        if let Some(dispatch) = dispatch {
            self.dispatch(dispatch).await;
        }
        Ok(PendingSend {
            local_ref,
            outcome: rx,
        })
    }

    pub async fn discard(&self, local_ref: LocalRef) -> Result<Message, SessionError> {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Joined {
            return Err(SessionError::NotJoined(inner.state));
        }
        let Some(message) = inner.store.discard(local_ref) else {
            return match inner.store.local_entry(local_ref) {
                Some(_) => Err(SessionError::NotFailed(local_ref)),
                None => Err(SessionError::UnknownLocalRef(local_ref)),
            };
        };
        inner.outbound.remove(&local_ref);
        self.emit_store(&inner, ChangeCause::Discarded);
        Ok(message)
    }

    pub async fn delete(
        self: &Arc<Self>,
        message_id: MessageId,
    ) -> Result<PendingDelete, DeleteRejected> {
        let (epoch, frame, reply) = {
            let mut inner = self.inner.lock().await;
            let rejection = if inner.state != SessionState::Joined {
                Some(DeleteRejected::NotJoined(message_id.clone()))
            } else {
                match inner.store.get(&message_id) {
                    None => Some(DeleteRejected::NotFound(message_id.clone())),
                    Some(message) if !self.is_own(message) => {
                        Some(DeleteRejected::NotAuthor(message_id.clone()))
                    }
                    Some(message) if !message.origin.is_settled() => {
                        Some(DeleteRejected::NotConfirmed(message_id.clone()))
                    }
                    Some(_) => None,
                }
            };
            if let Some(rejected) = rejection {
                warn!(room_id = %self.room_id, "session: {rejected}");
                let _ = self.events.send(SessionEvent::DeleteRejected(rejected.clone()));
                return Err(rejected);
            }
            let (push_ref, reply) = self.register_reply(&mut inner);
            let push = ClientPush::DeleteMessage {
                message_id: message_id.clone(),
            };
            (inner.epoch, self.frame(push_ref, push), reply)
        };

        let (tx, rx) = oneshot::channel();
        let push_ref = frame.push_ref;
        if let Err(failure) = self.transmit(frame).await {
            self.forget_reply(push_ref).await;
            self.complete_delete(epoch, message_id.clone(), Err(failure), tx)
                .await;
        } else {
            let session = Arc::clone(self);
            let id = message_id.clone();
            tokio::spawn(async move {
                let result = session
                    .await_reply(push_ref, "message:delete", reply)
                    .await
                    .map(|_| ());
                session.complete_delete(epoch, id, result, tx).await;
            });
        }

        Ok(PendingDelete {
            message_id,
            outcome: rx,
        })
    }

    async fn submit(
        self: &Arc<Self>,
        body: MessageBody,
        push: ClientPush,
    ) -> Result<PendingSend, SessionError> {
        let (tx, rx) = oneshot::channel();
        let (local_ref, dispatch) = {
            let mut inner = self.inner.lock().await;
            if inner.state != SessionState::Joined {
                return Err(SessionError::NotJoined(inner.state));
            }
            inner.next_seq += 1;
            let local_ref = LocalRef::new(inner.next_seq);
            let message = Message::local_pending(local_ref, &self.participant, body, Utc::now());
            inner.store.append_local_pending(message);
            inner.outbound.insert(
                local_ref,
                OutboundSend {
                    push,
                    completion: Some(tx),
                },
            );
            self.emit_store(&inner, ChangeCause::LocalSend);
            (local_ref, self.dispatch_or_queue(&mut inner, local_ref))
        };
        if let Some(dispatch) = dispatch {
            self.dispatch(dispatch).await;
        }
        Ok(PendingSend {
            local_ref,
            outcome: rx,
        })
    }

    fn dispatch_or_queue(&self, inner: &mut SessionInner, local_ref: LocalRef) -> Option<Dispatch> {
        if inner.history_synced {
            self.prepare_dispatch(inner, local_ref)
        } else {
            debug!(room_id = %self.room_id, %local_ref, "session: queueing send until history arrives");
            inner.queued.push_back(local_ref);
            None
        }
    }

    fn prepare_dispatch(&self, inner: &mut SessionInner, local_ref: LocalRef) -> Option<Dispatch> {
        let push = inner.outbound.get(&local_ref)?.push.clone();
        let (push_ref, reply) = self.register_reply(inner);
        Some(Dispatch {
            epoch: inner.epoch,
            local_ref,
            frame: self.frame(push_ref, push),
            reply,
        })
    }

    async fn dispatch(self: &Arc<Self>, dispatch: Dispatch) {
        let Dispatch {
            epoch,
            local_ref,
            frame,
            reply,
        } = dispatch;
        let push_ref = frame.push_ref;
        let event = frame.push.event_name();
        if let Err(failure) = self.transmit(frame).await {
            self.forget_reply(push_ref).await;
            self.complete_send(epoch, local_ref, Err(failure)).await;
            return;
        }
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let result = session.await_reply(push_ref, event, reply).await;
            session.complete_send(epoch, local_ref, result).await;
        });
    }

    async fn complete_send(
        &self,
        epoch: u64,
        local_ref: LocalRef,
        result: Result<Value, PushFailure>,
    ) {
        let mut inner = self.inner.lock().await;
        if !inner.is_current(epoch) {
            debug!(room_id = %self.room_id, %local_ref, "session: discarding stale acknowledgement");
            return;
        }

        match result.and_then(decode_ack) {
            Ok(server) => {
                let Some(mut outbound) = inner.outbound.remove(&local_ref) else {
                    return;
                };
                let message_id = server.id.clone();
                if inner.store.mark_confirmed(local_ref, server) {
                    self.emit_store(&inner, ChangeCause::Acknowledged);
                }
                debug!(room_id = %self.room_id, %local_ref, %message_id, "session: message confirmed");
                if let Some(completion) = outbound.completion.take() {
                    let _ = completion.send(SendOutcome::Confirmed(message_id));
                }
            }
            Err(failure) => {
                warn!(room_id = %self.room_id, %local_ref, "session: send failed: {failure}");
                if inner.store.mark_failed(local_ref) {
                    self.emit_store(&inner, ChangeCause::SendFailed);
                }
                let _ = self.events.send(SessionEvent::SendFailed {
                    local_ref,
                    failure: failure.clone(),
                });
                if let Some(completion) = inner
                    .outbound
                    .get_mut(&local_ref)
                    .and_then(|outbound| outbound.completion.take())
                {
                    let _ = completion.send(SendOutcome::Failed(failure));
                }
            }
        }
    }

    async fn complete_delete(
        &self,
        epoch: u64,
        message_id: MessageId,
        result: Result<(), PushFailure>,
        completion: oneshot::Sender<Result<(), DeleteRejected>>,
    ) {
        let outcome = {
            let mut inner = self.inner.lock().await;
            if !inner.is_current(epoch) {
                Err(DeleteRejected::Failed {
                    message_id,
                    failure: PushFailure::Cancelled,
                })
            } else {
                match result {
                    Ok(()) => {
                        if inner.store.apply_deleted(&message_id) {
                            self.emit_store(&inner, ChangeCause::Deleted);
                        }
                        info!(room_id = %self.room_id, %message_id, "session: message deleted");
                        Ok(())
                    }
                    Err(failure) => {
                        let rejected = DeleteRejected::Failed {
                            message_id,
                            failure,
                        };
                        warn!(room_id = %self.room_id, "session: {rejected}");
                        let _ = self
                            .events
                            .send(SessionEvent::DeleteRejected(rejected.clone()));
                        Err(rejected)
                    }
                }
            }
        };
        let _ = completion.send(outcome);
    }

    fn spawn_router(self: &Arc<Self>, epoch: u64) -> JoinHandle<()> {
        let mut frames = self.transport.subscribe();
        let session = Arc::downgrade(self);
        let topic = self.topic.clone();
        tokio::spawn(async move {
            loop {
                let frame = match frames.recv().await {
                    Ok(frame) => frame,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(%topic, skipped, "session: inbound frames lagged, resyncing history");
                        let Some(session) = session.upgrade() else {
                            break;
                        };
                        session.spawn_resync(epoch);
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        if let Some(session) = session.upgrade() {
                            session.on_transport_closed(epoch).await;
                        }
                        break;
                    }
                };
                if frame.topic() != topic {
                    continue;
                }
                let Some(session) = session.upgrade() else {
                    break;
                };
                session.handle_frame(epoch, frame).await;
            }
        })
    }

    async fn handle_frame(self: &Arc<Self>, epoch: u64, frame: ServerFrame) {
        match frame {
            ServerFrame::Reply {
                push_ref, reply, ..
            } => {
                let (waiter, is_history) = {
                    let mut inner = self.inner.lock().await;
                    (
                        inner.awaiting_replies.remove(&push_ref),
                        inner.history_refs.remove(&push_ref),
                    )
                };
                // applied before the next frame is read, so broadcasts that
                // follow the ack land on top of the batch
                if let (true, Reply::Ok(value)) = (is_history, &reply) {
                    if let Ok(Some(messages)) = history_batch(value) {
                        self.apply_history(epoch, messages).await;
                    }
                }
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(reply);
                    }
                    None => debug!(push_ref, "session: ignoring reply for unknown ref"),
                }
            }
            ServerFrame::Broadcast { event, .. } => self.handle_event(epoch, event).await,
        }
    }

    async fn handle_event(self: &Arc<Self>, epoch: u64, event: ServerEvent) {
        match event {
            ServerEvent::History { messages } => self.apply_history(epoch, messages).await,
            ServerEvent::MessageNew(wire) => {
                let message = match Message::try_from(wire) {
                    Ok(message) => message,
                    Err(err) => {
                        warn!(room_id = %self.room_id, "session: dropping invalid message: {err}");
                        return;
                    }
                };
                let mut inner = self.inner.lock().await;
                if inner.accepts_inbound(epoch) && inner.store.apply_new(message) {
                    self.emit_store(&inner, ChangeCause::RemoteNew);
                }
            }
            ServerEvent::MessageDeleted { message_id } => {
                let mut inner = self.inner.lock().await;
                if inner.accepts_inbound(epoch) && inner.store.apply_deleted(&message_id) {
                    self.emit_store(&inner, ChangeCause::RemoteDelete);
                }
            }
        }
    }

    async fn apply_history(self: &Arc<Self>, epoch: u64, wire: Vec<WireMessage>) {
        let dispatches = {
            let mut inner = self.inner.lock().await;
            if !inner.accepts_inbound(epoch) {
                return;
            }
            let batch = wire
                .into_iter()
                .filter_map(|wire| match Message::try_from(wire) {
                    Ok(message) => Some(message),
                    Err(err) => {
                        warn!(room_id = %self.room_id, "session: dropping invalid history entry: {err}");
                        None
                    }
                })
                .collect::<Vec<_>>();
            info!(room_id = %self.room_id, count = batch.len(), "session: history received");
            if inner.store.apply_history(batch) {
                self.emit_store(&inner, ChangeCause::History);
            }
            inner.history_synced = true;

            let mut dispatches = Vec::with_capacity(inner.queued.len());
            while let Some(local_ref) = inner.queued.pop_front() {
                if let Some(dispatch) = self.prepare_dispatch(&mut inner, local_ref) {
                    dispatches.push(dispatch);
                }
            }
            dispatches
        };
        for dispatch in dispatches {
            self.dispatch(dispatch).await;
        }
    }

    fn spawn_resync(self: &Arc<Self>, epoch: u64) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let (frame, reply) = {
                let mut inner = session.inner.lock().await;
                if !inner.is_current(epoch) {
                    return;
                }
                let (push_ref, reply) = session.register_history(&mut inner);
                (session.frame(push_ref, ClientPush::HistorySync), reply)
            };
            if let Err(failure) = session.request(frame, reply).await {
                let _ = session.events.send(SessionEvent::Error(format!(
                    "history resync for room {} failed: {failure}",
                    session.room_id
                )));
            }
        });
    }

    async fn on_transport_closed(&self, epoch: u64) {
        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch || inner.state == SessionState::Disconnected {
            return;
        }
        warn!(room_id = %self.room_id, epoch, "session: transport closed");
        // this runs on the router task itself; dropping the handle detaches it
        inner.router.take();
        self.teardown(&mut inner);
        let _ = self.events.send(SessionEvent::Error(format!(
            "connection to room {} closed",
            self.room_id
        )));
    }

    async fn fail_join(&self, epoch: u64, failure: PushFailure) -> SessionError {
        let mut inner = self.inner.lock().await;
        if inner.epoch == epoch && inner.state != SessionState::Disconnected {
            warn!(room_id = %self.room_id, epoch, "session: join failed: {failure}");
            self.set_state(&mut inner, SessionState::JoinFailed);
            self.teardown(&mut inner);
        }
        SessionError::JoinFailed(failure)
    }

    /// Ends the current epoch. The only store change allowed here is marking
    /// in-flight sends failed; nothing mutates the store afterwards.
    fn teardown(&self, inner: &mut SessionInner) {
        inner.awaiting_replies.clear();
        inner.history_refs.clear();
        inner.queued.clear();

        let mut changed = false;
        for local_ref in inner.store.pending_refs() {
            changed |= inner.store.mark_failed(local_ref);
        }
        if changed {
            self.emit_store(inner, ChangeCause::Disconnect);
        }
        for outbound in inner.outbound.values_mut() {
            if let Some(completion) = outbound.completion.take() {
                let _ = completion.send(SendOutcome::Cancelled);
            }
        }

        if let Some(router) = inner.router.take() {
            router.abort();
        }
        inner.history_synced = false;
        self.set_state(inner, SessionState::Disconnected);
    }

    async fn request(
        &self,
        frame: ClientFrame,
        reply: oneshot::Receiver<Reply>,
    ) -> Result<Value, PushFailure> {
        let push_ref = frame.push_ref;
        let event = frame.push.event_name();
        if let Err(failure) = self.transmit(frame).await {
            self.forget_reply(push_ref).await;
            return Err(failure);
        }
        self.await_reply(push_ref, event, reply).await
    }

    async fn transmit(&self, frame: ClientFrame) -> Result<(), PushFailure> {
        self.transport
            .push(frame)
            .await
            .map_err(|err| PushFailure::Transport(err.to_string()))
    }

    async fn await_reply(
        &self,
        push_ref: u64,
        event: &'static str,
        reply: oneshot::Receiver<Reply>,
    ) -> Result<Value, PushFailure> {
        match timeout(self.ack_timeout, reply).await {
            Ok(Ok(Reply::Ok(value))) => Ok(value),
            Ok(Ok(Reply::Error(error))) => Err(PushFailure::Rejected { event, error }),
            Ok(Err(_)) => Err(PushFailure::Cancelled),
            Err(_) => {
                self.forget_reply(push_ref).await;
                Err(PushFailure::TimedOut {
                    event,
                    after: self.ack_timeout,
                })
            }
        }
    }

    async fn forget_reply(&self, push_ref: u64) {
        let mut inner = self.inner.lock().await;
        inner.awaiting_replies.remove(&push_ref);
        inner.history_refs.remove(&push_ref);
    }

    fn register_history(&self, inner: &mut SessionInner) -> (u64, oneshot::Receiver<Reply>) {
        let (push_ref, reply) = self.register_reply(inner);
        inner.history_refs.insert(push_ref);
        (push_ref, reply)
    }

    fn register_reply(&self, inner: &mut SessionInner) -> (u64, oneshot::Receiver<Reply>) {
        let push_ref = self.next_push_ref();
        let (tx, rx) = oneshot::channel();
        inner.awaiting_replies.insert(push_ref, tx);
        (push_ref, rx)
    }

    fn next_push_ref(&self) -> u64 {
        self.next_ref.fetch_add(1, Ordering::Relaxed)
    }

    fn frame(&self, push_ref: u64, push: ClientPush) -> ClientFrame {
        ClientFrame::new(self.topic.clone(), push_ref, push)
    }

    fn set_state(&self, inner: &mut SessionInner, state: SessionState) {
        inner.state = state;
        let _ = self.events.send(SessionEvent::StateChanged(state));
    }

    fn emit_store(&self, inner: &SessionInner, cause: ChangeCause) {
        let _ = self.events.send(SessionEvent::StoreChanged {
            cause,
            messages: inner.store.snapshot().into(),
        });
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        if let Some(router) = self.inner.get_mut().router.take() {
            router.abort();
        }
    }
}

fn decode_ack(value: Value) -> Result<Message, PushFailure> {
    let wire = serde_json::from_value::<WireMessage>(value)
        .map_err(|err| PushFailure::InvalidReply(err.to_string()))?;
    Message::try_from(wire).map_err(|err| PushFailure::InvalidReply(err.to_string()))
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
