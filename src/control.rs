//! Control channel
//!
//! The fixed opcode set a consumer may invoke, and the per-open channel
//! object that checks access and routes calls to the painter.

use crate::config::DriverConfig;
use crate::device::{DeviceManager, VirtualDisplay};
use crate::error::{Error, Result};
use crate::painter::{ConnectRequest, ConsumerEvent, ConsumerId, Grab, GrabHint, UpdateStatus};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Connect = 0x00,
    RequestUpdate = 0x01,
    GrabPixels = 0x02,
    DisplayControlReply = 0x03,
    EnableCursorEvents = 0x04,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => Opcode::Connect,
            0x01 => Opcode::RequestUpdate,
            0x02 => Opcode::GrabPixels,
            0x03 => Opcode::DisplayControlReply,
            0x04 => Opcode::EnableCursorEvents,
            _ => return None,
        })
    }
}

/// Privilege of whoever holds a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Access {
    Unprivileged,
    Render,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpcodeDesc {
    pub opcode: Opcode,
    pub name: &'static str,
    pub required: Access,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpcodeTable {
    entries: Vec<OpcodeDesc>,
}

impl OpcodeTable {
    pub fn standard() -> Self {
        let entry = |opcode, name| OpcodeDesc {
            opcode,
            name,
            required: Access::Render,
        };
        Self {
            entries: vec![
                entry(Opcode::Connect, "CONNECT"),
                entry(Opcode::RequestUpdate, "REQUEST_UPDATE"),
                entry(Opcode::GrabPixels, "GRAB_PIXELS"),
                entry(Opcode::DisplayControlReply, "DISPLAY_CONTROL_REPLY"),
                entry(Opcode::EnableCursorEvents, "ENABLE_CURSOR_EVENTS"),
            ],
        }
    }

    pub fn lookup(&self, opcode: Opcode) -> Option<&OpcodeDesc> {
        self.entries.iter().find(|e| e.opcode == opcode)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OpcodeDesc> {
        self.entries.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Connect(ConnectRequest),
    RequestUpdate { timeout: Duration },
    GrabPixels(GrabHint),
    DisplayControlReply(Vec<u8>),
    EnableCursorEvents(bool),
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Connect(_) => Opcode::Connect,
            Request::RequestUpdate { .. } => Opcode::RequestUpdate,
            Request::GrabPixels(_) => Opcode::GrabPixels,
            Request::DisplayControlReply(_) => Opcode::DisplayControlReply,
            Request::EnableCursorEvents(_) => Opcode::EnableCursorEvents,
        }
    }
}

#[derive(Debug)]
pub enum Reply {
    Connected,
    Update(UpdateStatus),
    Pixels(Grab),
    Ack,
}

/// One open handle on an adapter. Closing or dropping it releases any
/// binding it holds, which covers consumers that exit without disconnecting.
pub struct ControlChannel {
    display: Arc<VirtualDisplay>,
    config: Arc<DriverConfig>,
    identity: ConsumerId,
    access: Access,
    opener: String,
    events_tx: mpsc::Sender<ConsumerEvent>,
    events_rx: Mutex<mpsc::Receiver<ConsumerEvent>>,
    closed: AtomicBool,
}

impl ControlChannel {
    pub fn open(
        manager: &DeviceManager,
        index: u32,
        access: Access,
        opener: impl Into<String>,
    ) -> Result<Self> {
        let display = manager
            .get(index)
            .ok_or(Error::InvalidArgument("unknown device"))?;
        let opener = opener.into();
        let identity = display.on_open(&opener)?;
        let (events_tx, events_rx) = mpsc::channel(manager.config().painter.event_queue_depth.max(1));
        Ok(Self {
            display,
            config: Arc::clone(manager.config()),
            identity,
            access,
            opener,
            events_tx,
            events_rx: Mutex::new(events_rx),
            closed: AtomicBool::new(false),
        })
    }

    pub fn identity(&self) -> ConsumerId {
        self.identity
    }

    pub fn display(&self) -> &Arc<VirtualDisplay> {
        &self.display
    }

    pub async fn call(&self, request: Request) -> Result<Reply> {
        let opcode = request.opcode();
        let desc = self
            .config
            .opcodes
            .lookup(opcode)
            .ok_or_else(|| Error::Protocol(format!("opcode {opcode:?} not in table")))?;
        if self.access < desc.required {
            tracing::warn!(
                card = self.display.index(),
                identity = %self.identity,
                op = desc.name,
                "permission denied"
            );
            return Err(Error::PermissionDenied);
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::NotConnected);
        }
        self.display.enter()?;
        tracing::trace!(card = self.display.index(), identity = %self.identity, op = desc.name, "dispatch");

        let painter = self.display.painter();
        match request {
            Request::Connect(req) => {
                self.display
                    .connect(self.identity, req, self.events_tx.clone())?;
                // close() may have run on_close between the check above and the bind
                if self.closed.load(Ordering::Acquire) {
                    painter.disconnect(self.identity);
                    return Err(Error::NotConnected);
                }
                Ok(Reply::Connected)
            }
            Request::RequestUpdate { timeout } => painter
                .request_update(self.identity, timeout)
                .await
                .map(Reply::Update),
            Request::GrabPixels(hint) => painter.fetch_pixels(self.identity, hint).map(Reply::Pixels),
            Request::DisplayControlReply(payload) => {
                painter.display_control_reply(self.identity, payload)?;
                Ok(Reply::Ack)
            }
            Request::EnableCursorEvents(enabled) => {
                painter.set_cursor_subscription(self.identity, enabled)?;
                Ok(Reply::Ack)
            }
        }
    }

    /// Next out-of-band event for this channel's binding
    pub async fn next_event(&self) -> Option<ConsumerEvent> {
        self.events_rx.lock().await.recv().await
    }

    /// Idempotent
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.display.on_close(self.identity, &self.opener);
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlChannel")
            .field("card", &self.display.index())
            .field("identity", &self.identity)
            .field("access", &self.access)
            .field("opener", &self.opener)
            .finish()
    }
}
