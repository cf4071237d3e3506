//! Consumer side of the control socket

use crate::control::Request;
use crate::error::Error;
use crate::painter::{Capabilities, ConnectRequest, ConsumerEvent, GrabHint, UpdateStatus};
use crate::registry::{Mode, PixelFormat};
use crate::wire::{self, PixelUpdate, Response, ServerMessage};
use anyhow::{anyhow, bail, Context, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Events kept for a consumer that is slow to poll; newer ones are dropped
const EVENT_BACKLOG: usize = 256;

type Pending = Arc<Mutex<HashMap<u32, oneshot::Sender<crate::Result<Response>>>>>;

/// Connection to a `vdisplay serve` socket. Calls take `&self`, so one
/// task can wait for updates while another answers events.
pub struct Consumer {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Pending,
    next_seq: AtomicU32,
    events: tokio::sync::Mutex<mpsc::Receiver<ConsumerEvent>>,
    reader: JoinHandle<()>,
}

impl Consumer {
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .await
            .with_context(|| format!("failed to connect to {}", path.display()))?;
        let (mut rd, wr) = stream.into_split();

        let pending: Pending = Arc::default();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BACKLOG);
        let reader = {
            let pending = Arc::clone(&pending);
            tokio::spawn(async move {
                loop {
                    let frame = match wire::read_frame(&mut rd).await {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "control socket read failed");
                            break;
                        }
                    };
                    match wire::decode_server_message(&frame) {
                        Ok(ServerMessage::Response { seq, result }) => {
                            let waiter = pending
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .remove(&seq);
                            match waiter {
                                Some(tx) => {
                                    let _ = tx.send(result);
                                }
                                None => tracing::debug!(seq, "reply for unknown request"),
                            }
                        }
                        Ok(ServerMessage::Event(event)) => {
                            if let Err(TrySendError::Full(_)) = events_tx.try_send(event) {
                                tracing::debug!("event backlog full, event dropped");
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "undecodable frame from server");
                            break;
                        }
                    }
                }
                // fails every outstanding call
                pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clear();
            })
        };

        Ok(Self {
            writer: tokio::sync::Mutex::new(wr),
            pending,
            next_seq: AtomicU32::new(1),
            events: tokio::sync::Mutex::new(events_rx),
            reader,
        })
    }

    pub async fn call(&self, request: Request) -> Result<Response> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(seq, tx);

        let frame = wire::encode_request(seq, &request);
        if let Err(e) = wire::write_frame(&mut *self.writer.lock().await, &frame).await {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&seq);
            return Err(e).context("failed to send request");
        }

        let result = rx.await.map_err(|_| anyhow!("connection closed"))?;
        Ok(result?)
    }

    pub async fn bind(&self, mode: Mode, format: PixelFormat, capabilities: Capabilities) -> Result<()> {
        let request = Request::Connect(ConnectRequest {
            mode,
            format,
            capabilities,
        });
        match self.call(request).await? {
            Response::Connected => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn request_update(&self, timeout: Duration) -> Result<UpdateStatus> {
        match self.call(Request::RequestUpdate { timeout }).await? {
            Response::Update(status) => Ok(status),
            other => Err(unexpected(other)),
        }
    }

    pub async fn grab(&self, hint: GrabHint) -> Result<PixelUpdate> {
        match self.call(Request::GrabPixels(hint)).await? {
            Response::Pixels(update) => Ok(update),
            other => Err(unexpected(other)),
        }
    }

    pub async fn display_control_reply(&self, payload: Vec<u8>) -> Result<()> {
        self.ack(Request::DisplayControlReply(payload)).await
    }

    pub async fn enable_cursor_events(&self, enabled: bool) -> Result<()> {
        self.ack(Request::EnableCursorEvents(enabled)).await
    }

    async fn ack(&self, request: Request) -> Result<()> {
        match self.call(request).await? {
            Response::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// `None` once the server has gone away
    pub async fn next_event(&self) -> Option<ConsumerEvent> {
        self.events.lock().await.recv().await
    }

    pub fn try_next_event(&self) -> Option<ConsumerEvent> {
        self.events.try_lock().ok()?.try_recv().ok()
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

fn unexpected(response: Response) -> anyhow::Error {
    let name = match response {
        Response::Connected => "CONNECTED",
        Response::Update(_) => "UPDATE",
        Response::Pixels(_) => "PIXELS",
        Response::Ack => "ACK",
    };
    anyhow::Error::new(Error::Protocol(format!("unexpected {name} reply")))
}

/// Single full-frame grab, used by `vdisplay grab`
pub async fn grab_once(path: impl AsRef<Path>, mode: Mode, format: PixelFormat) -> Result<PixelUpdate> {
    let consumer = Consumer::connect(path).await?;
    consumer.bind(mode, format, Capabilities::empty()).await?;
    let update = consumer.grab(GrabHint::default()).await?;
    if update.rects.len() != 1 || update.rects[0] != update.mode.bounds() {
        bail!("first grab did not cover the whole frame");
    }
    Ok(update)
}
