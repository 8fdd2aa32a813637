use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::{ClientFrame, ServerFrame};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn push(&self, frame: ClientFrame) -> Result<()>;
    /// Every inbound frame, for every topic. The receiver reports `Closed`
    /// once the underlying connection is gone.
    fn subscribe(&self) -> broadcast::Receiver<ServerFrame>;
}

pub struct WsTransport {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    frames: Arc<Mutex<Option<broadcast::Sender<ServerFrame>>>>,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl WsTransport {
    pub async fn connect(server_url: &str, buffer: usize) -> Result<Self> {
        let ws_url = websocket_url(server_url)?;
        let (ws_stream, _) = connect_async(&ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        info!(url = %ws_url, "transport: websocket connected");
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (frames_tx, _) = broadcast::channel(buffer.max(1));
        let frames = Arc::new(Mutex::new(Some(frames_tx.clone())));
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();

        let writer_task = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(push_ref = frame.push_ref, "transport: failed to encode frame: {err}");
                        continue;
                    }
                };
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!("transport: websocket send failed: {err}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let reader_frames = Arc::clone(&frames);
        let reader_task = tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => {
                            let _ = frames_tx.send(frame);
                        }
                        Err(err) => warn!("transport: invalid server frame: {err}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!("transport: websocket receive failed: {err}");
                        break;
                    }
                }
            }
            debug!("transport: websocket reader finished");
            close_frames(&reader_frames);
        });

        Ok(Self {
            outbound,
            frames,
            reader_task,
            writer_task,
        })
    }
}

#[async_trait]
impl ChannelTransport for WsTransport {
    async fn push(&self, frame: ClientFrame) -> Result<()> {
        self.outbound
            .send(frame)
            .map_err(|_| anyhow!("websocket writer is closed"))
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerFrame> {
        let guard = match self.frames.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match guard.as_ref() {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

fn close_frames(frames: &Mutex<Option<broadcast::Sender<ServerFrame>>>) {
    let mut guard = match frames.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    guard.take();
}

pub fn websocket_url(server_url: &str) -> Result<String> {
    if server_url.starts_with("ws://") || server_url.starts_with("wss://") {
        Ok(server_url.to_string())
    } else if let Some(rest) = server_url.strip_prefix("https://") {
        Ok(format!("wss://{rest}"))
    } else if let Some(rest) = server_url.strip_prefix("http://") {
        Ok(format!("ws://{rest}"))
    } else {
        Err(anyhow!(
            "server_url must start with ws://, wss://, http:// or https://"
        ))
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
