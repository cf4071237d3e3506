//! Connection state machine
//!
//! Owns the single consumer binding of a virtual display. The producer side
//! marks dirty regions and cursor changes; the consumer side connects, waits
//! for updates, grabs pixels and answers display-control requests.
//!
//! Locking: one `Mutex<State>` guards the binding and the dirty set. It is
//! never held across an `.await`. Lock order is painter -> registry.
//! `request_update` suspends on a per-binding `watch` channel; dropping the
//! binding drops the sender, which is what wakes waiters with `Disconnected`.

use crate::cursor::{CursorChange, CursorSnapshot, CursorState};
use crate::damage::{self, DirtyRegionSet, Rect};
use crate::error::{Error, Result};
use crate::ledger::ResourceToken;
use crate::registry::{Framebuffer, FramebufferHandle, FramebufferRegistry, Mode, PixelFormat};
use bitflags::bitflags;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

/// Opaque identity of whoever opened a control channel. Compared by value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(NonZeroU64);

impl ConsumerId {
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer#{}", self.0)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Capabilities: u32 {
        const CURSOR_EVENTS = 1 << 0;
        const DISPLAY_CONTROL = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequest {
    pub mode: Mode,
    pub format: PixelFormat,
    pub capabilities: Capabilities,
}

/// Delivered to the bound consumer out of band
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerEvent {
    ModeChanged {
        mode: Mode,
        format: PixelFormat,
        handle: FramebufferHandle,
    },
    CursorSet(CursorSnapshot),
    CursorMove {
        x: i32,
        y: i32,
    },
    DisplayControlRequest(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStatus {
    Updated,
    NoChange,
    /// The binding ended while waiting
    Disconnected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GrabHint {
    pub format: Option<PixelFormat>,
    pub max_rects: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct PainterConfig {
    pub dirty_rect_limit: usize,
    pub display_control_timeout: Duration,
    pub display_control_max_payload: usize,
    /// Per-binding event backlog before events are dropped
    pub event_queue_depth: usize,
}

impl Default for PainterConfig {
    fn default() -> Self {
        Self {
            dirty_rect_limit: 16,
            display_control_timeout: Duration::from_millis(50),
            display_control_max_payload: 64,
            event_queue_depth: 64,
        }
    }
}

struct PendingReply {
    id: u64,
    tx: oneshot::Sender<Vec<u8>>,
}

struct Binding {
    identity: ConsumerId,
    capabilities: Capabilities,
    events: mpsc::Sender<ConsumerEvent>,
    wake: watch::Sender<u64>,
    grabbing: Arc<AtomicBool>,
    pending_reply: Option<PendingReply>,
    /// A cursor event was dropped; the next one carries the full cursor
    cursor_stale: bool,
}

impl Binding {
    /// False if the consumer's queue is full and `event` was dropped
    fn notify(&self, event: ConsumerEvent) -> bool {
        match self.events.try_send(event) {
            Ok(()) => true,
            // receiver gone means the channel is closing; on_close will unbind
            Err(TrySendError::Closed(_)) => true,
            Err(TrySendError::Full(_)) => {
                tracing::debug!(identity = %self.identity, "event queue full, event dropped");
                false
            }
        }
    }

    fn wake(&self) {
        self.wake.send_modify(|seq| *seq = seq.wrapping_add(1));
    }
}

struct State {
    binding: Option<Binding>,
    dirty: DirtyRegionSet,
    next_request: u64,
}

impl State {
    fn bound_to(&self, identity: ConsumerId) -> Result<&Binding> {
        match &self.binding {
            Some(b) if b.identity == identity => Ok(b),
            _ => Err(Error::NotConnected),
        }
    }

    fn bound_to_mut(&mut self, identity: ConsumerId) -> Result<&mut Binding> {
        match &mut self.binding {
            Some(b) if b.identity == identity => Ok(b),
            _ => Err(Error::NotConnected),
        }
    }
}

/// Clears the binding's in-flight flag when dropped
#[derive(Debug)]
struct GrabGuard(Arc<AtomicBool>);

impl Drop for GrabGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Result of `fetch_pixels`. Holds the buffer by reference count, so reads
/// stay valid even if the registry moves on. Further fetches on the same
/// binding fail with `Busy` until this is dropped.
#[derive(Debug)]
pub struct Grab {
    handle: FramebufferHandle,
    framebuffer: Arc<Framebuffer>,
    rects: Vec<Rect>,
    _guard: GrabGuard,
}

impl Grab {
    pub fn handle(&self) -> FramebufferHandle {
        self.handle
    }

    pub fn framebuffer(&self) -> &Arc<Framebuffer> {
        &self.framebuffer
    }

    pub fn rects(&self) -> &[Rect] {
        &self.rects
    }

    /// Pixels of every dirty rect, row by row, in `rects()` order
    pub fn pixels(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for rect in &self.rects {
            self.framebuffer.copy_rect(rect, &mut out);
        }
        out
    }
}

pub struct Painter {
    index: u32,
    config: PainterConfig,
    registry: Arc<FramebufferRegistry>,
    cursor: Arc<CursorState>,
    state: Mutex<State>,
    claimed: watch::Sender<bool>,
    token: Mutex<Option<ResourceToken>>,
}

impl Painter {
    pub fn new(
        index: u32,
        config: PainterConfig,
        registry: Arc<FramebufferRegistry>,
        cursor: Arc<CursorState>,
        token: ResourceToken,
    ) -> Self {
        let bounds = registry
            .mode()
            .map(|(mode, _)| mode.bounds())
            .unwrap_or(Rect::new(0, 0, 0, 0));
        let (claimed, _) = watch::channel(false);
        Self {
            index,
            config,
            registry,
            cursor,
            state: Mutex::new(State {
                binding: None,
                dirty: DirtyRegionSet::new(bounds, config.dirty_rect_limit),
                next_request: 0,
            }),
            claimed,
            token: Mutex::new(Some(token)),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Bind `identity`. Events for the binding go to `events`.
    pub fn connect(
        &self,
        identity: ConsumerId,
        request: ConnectRequest,
        events: mpsc::Sender<ConsumerEvent>,
    ) -> Result<()> {
        let mut st = self.state();
        if st.binding.is_some() {
            tracing::debug!(card = self.index, %identity, "connect rejected, already bound");
            return Err(Error::AlreadyConnected);
        }
        if self.registry.mode() != Some((request.mode, request.format)) {
            self.registry.mode_set(request.mode, request.format)?;
        }

        st.dirty.reset(request.mode.bounds());
        st.dirty.mark_full();

        let (wake, _) = watch::channel(0);
        st.binding = Some(Binding {
            identity,
            capabilities: request.capabilities,
            events,
            wake,
            grabbing: Arc::new(AtomicBool::new(false)),
            pending_reply: None,
            cursor_stale: false,
        });
        self.claimed.send_replace(true);
        tracing::info!(
            card = self.index,
            %identity,
            mode = %request.mode,
            format = ?request.format,
            caps = ?request.capabilities,
            "consumer connected"
        );
        Ok(())
    }

    /// Idempotent. A stale identity never affects a newer binding.
    pub fn disconnect(&self, identity: ConsumerId) -> bool {
        let mut st = self.state();
        match &st.binding {
            Some(b) if b.identity == identity => {}
            _ => return false,
        }
        let binding = st.binding.take();
        st.dirty.drain();
        self.cursor.set_events_enabled(false);
        self.claimed.send_replace(false);
        drop(st);
        drop(binding);
        tracing::info!(card = self.index, %identity, "consumer disconnected");
        true
    }

    pub fn is_connected(&self) -> bool {
        *self.claimed.borrow()
    }

    /// Follows bind/unbind transitions
    pub fn claims(&self) -> watch::Receiver<bool> {
        self.claimed.subscribe()
    }

    pub fn mark_dirty(&self, rect: Rect) {
        let mut st = self.state();
        if st.binding.is_none() {
            return;
        }
        st.dirty.mark(rect);
        if !st.dirty.is_empty() {
            if let Some(b) = &st.binding {
                b.wake();
            }
        }
    }

    pub fn mark_full_dirty(&self) {
        let mut st = self.state();
        if st.binding.is_none() {
            return;
        }
        st.dirty.mark_full();
        if let Some(b) = &st.binding {
            b.wake();
        }
    }

    /// Suspend until something is dirty, the binding ends, or `timeout` passes
    pub async fn request_update(
        &self,
        identity: ConsumerId,
        timeout: Duration,
    ) -> Result<UpdateStatus> {
        let deadline = Instant::now() + timeout;
        let mut wake = {
            let st = self.state();
            let b = st.bound_to(identity)?;
            if !st.dirty.is_empty() {
                return Ok(UpdateStatus::Updated);
            }
            b.wake.subscribe()
        };

        loop {
            match tokio::time::timeout_at(deadline, wake.changed()).await {
                Err(_) => return Ok(UpdateStatus::NoChange),
                Ok(Err(_)) => return Ok(UpdateStatus::Disconnected),
                Ok(Ok(())) => {
                    let st = self.state();
                    if st.bound_to(identity).is_err() {
                        return Ok(UpdateStatus::Disconnected);
                    }
                    if !st.dirty.is_empty() {
                        return Ok(UpdateStatus::Updated);
                    }
                    // a concurrent grab drained it first, keep waiting
                }
            }
        }
    }

    /// Hand out the scanout buffer and drain the dirty set in one step
    pub fn fetch_pixels(&self, identity: ConsumerId, hint: GrabHint) -> Result<Grab> {
        let mut st = self.state();
        let b = st.bound_to(identity)?;
        if b
            .grabbing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Busy);
        }
        let guard = GrabGuard(Arc::clone(&b.grabbing));

        let (handle, framebuffer) = self.registry.handoff().ok_or(Error::StaleHandle)?;
        if let Some(format) = hint.format {
            if format != framebuffer.format() {
                return Err(Error::FormatMismatch);
            }
        }

        let rects = st.dirty.drain();
        let rects = match hint.max_rects {
            Some(max) => damage::limit(rects, max),
            None => rects,
        };
        Ok(Grab {
            handle,
            framebuffer,
            rects,
            _guard: guard,
        })
    }

    /// Consumer's answer to the outstanding display-control request
    pub fn display_control_reply(&self, identity: ConsumerId, payload: Vec<u8>) -> Result<()> {
        let mut st = self.state();
        let b = st.bound_to_mut(identity)?;
        if payload.len() > self.config.display_control_max_payload {
            return Err(Error::InvalidArgument("display-control payload too large"));
        }
        let pending = b.pending_reply.take().ok_or_else(|| {
            tracing::debug!(card = self.index, %identity, "stale display-control reply");
            Error::StaleReply
        })?;
        pending.tx.send(payload).map_err(|_| Error::StaleReply)
    }

    /// Host side: forward a request to the consumer and wait for its reply
    pub async fn display_control_request(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        if payload.len() > self.config.display_control_max_payload {
            return Err(Error::InvalidArgument("display-control payload too large"));
        }
        let (id, rx) = {
            let mut st = self.state();
            st.next_request = st.next_request.wrapping_add(1);
            let id = st.next_request;
            let b = st.binding.as_mut().ok_or(Error::NotConnected)?;
            if !b.capabilities.contains(Capabilities::DISPLAY_CONTROL) {
                return Err(Error::Unsupported);
            }
            if b.pending_reply.is_some() {
                return Err(Error::Busy);
            }
            if !b.notify(ConsumerEvent::DisplayControlRequest(payload)) {
                return Err(Error::Busy);
            }
            let (tx, rx) = oneshot::channel();
            b.pending_reply = Some(PendingReply { id, tx });
            (id, rx)
        };

        match tokio::time::timeout(self.config.display_control_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::NotConnected),
            Err(_) => {
                let mut st = self.state();
                if let Some(b) = st.binding.as_mut() {
                    if b.pending_reply.as_ref().is_some_and(|p| p.id == id) {
                        b.pending_reply = None;
                    }
                }
                tracing::debug!(card = self.index, "display-control request timed out");
                Err(Error::TimedOut)
            }
        }
    }

    /// No-op if unchanged. Enabling sends the current cursor right away and
    /// needs `CURSOR_EVENTS` in the binding's capabilities.
    pub fn set_cursor_subscription(&self, identity: ConsumerId, enabled: bool) -> Result<()> {
        let mut st = self.state();
        let b = st.bound_to_mut(identity)?;
        if enabled && !b.capabilities.contains(Capabilities::CURSOR_EVENTS) {
            return Err(Error::Unsupported);
        }
        if self.cursor.set_events_enabled(enabled) && enabled {
            b.cursor_stale = !b.notify(ConsumerEvent::CursorSet(self.cursor.snapshot()));
        }
        Ok(())
    }

    /// Relay an accepted cursor update to a subscribed consumer
    pub fn cursor_changed(&self, change: CursorChange) {
        if change.is_empty() {
            return;
        }
        let mut st = self.state();
        let Some(b) = st.binding.as_mut() else {
            return;
        };
        if !self.cursor.events_enabled() {
            return;
        }
        let snap = self.cursor.snapshot();
        let event = if change.shape_changed || b.cursor_stale {
            ConsumerEvent::CursorSet(snap)
        } else {
            ConsumerEvent::CursorMove {
                x: snap.x,
                y: snap.y,
            }
        };
        b.cursor_stale = !b.notify(event);
    }

    /// Host-driven mode change. Retires all framebuffer handles.
    pub fn mode_changed(&self, mode: Mode, format: PixelFormat) -> Result<FramebufferHandle> {
        let mut st = self.state();
        let handle = self.registry.mode_set(mode, format)?;
        st.dirty.reset(mode.bounds());
        if st.binding.is_none() {
            return Ok(handle);
        }
        st.dirty.mark_full();
        if let Some(b) = &st.binding {
            // a lagging consumer still learns the mode from its next grab
            if !b.notify(ConsumerEvent::ModeChanged {
                mode,
                format,
                handle,
            }) {
                tracing::warn!(card = self.index, identity = %b.identity, %mode, "mode change not queued");
            }
            b.wake();
        }
        Ok(handle)
    }

    /// Page flip to another registered buffer; the whole frame is dirty
    pub fn flip(&self, handle: FramebufferHandle) -> Result<()> {
        self.registry.flip(handle)?;
        self.mark_full_dirty();
        Ok(())
    }

    /// Teardown: force off any consumer and give back the resource token
    pub fn cleanup(&self) {
        let binding = {
            let mut st = self.state();
            st.dirty.drain();
            st.binding.take()
        };
        if let Some(b) = binding {
            tracing::info!(card = self.index, identity = %b.identity, "forcing consumer off");
            self.cursor.set_events_enabled(false);
            self.claimed.send_replace(false);
        }
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::CursorShape;
    use crate::ledger::{Resource, ResourceLedger};

    const MODE: Mode = Mode::new(64, 48, 60);

    fn id(n: u64) -> ConsumerId {
        ConsumerId::from_raw(n).unwrap()
    }

    fn request() -> ConnectRequest {
        ConnectRequest {
            mode: MODE,
            format: PixelFormat::Xrgb8888,
            capabilities: Capabilities::CURSOR_EVENTS | Capabilities::DISPLAY_CONTROL,
        }
    }

    fn bind(p: &Painter, identity: ConsumerId) -> Result<mpsc::Receiver<ConsumerEvent>> {
        let (tx, rx) = mpsc::channel(PainterConfig::default().event_queue_depth);
        p.connect(identity, request(), tx).map(|_| rx)
    }

    fn painter_with(config: PainterConfig) -> (Arc<ResourceLedger>, Arc<Painter>) {
        let ledger = ResourceLedger::new();
        let registry = Arc::new(FramebufferRegistry::new(ledger.acquire(Resource::Registry)));
        let cursor = Arc::new(CursorState::new(ledger.acquire(Resource::Cursor)));
        let painter = Painter::new(
            0,
            config,
            registry,
            cursor,
            ledger.acquire(Resource::Painter),
        );
        (ledger, Arc::new(painter))
    }

    fn painter() -> Arc<Painter> {
        painter_with(PainterConfig::default()).1
    }

    fn covered(rects: &[Rect], x: i32, y: i32) -> bool {
        rects.iter().any(|r| r.contains_point(x, y))
    }

    #[test]
    fn test_connect_forces_full_frame() {
        let p = painter();
        let _events = bind(&p, id(1)).unwrap();
        let grab = p.fetch_pixels(id(1), GrabHint::default()).unwrap();
        assert_eq!(grab.rects(), &[MODE.bounds()]);
        assert_eq!(grab.pixels().len(), 64 * 48 * 4);
    }

    #[test]
    fn test_single_binding() {
        let p = painter();
        let _a = bind(&p, id(1)).unwrap();
        assert_eq!(bind(&p, id(2)).unwrap_err(), Error::AlreadyConnected);
        // first-connected wins, even against itself
        assert_eq!(bind(&p, id(1)).unwrap_err(), Error::AlreadyConnected);
        assert!(p.disconnect(id(1)));
        let _b = bind(&p, id(2)).unwrap();
        assert!(p.is_connected());
    }

    #[test]
    fn test_stale_disconnect_is_noop() {
        let p = painter();
        let _a = bind(&p, id(1)).unwrap();
        assert!(p.disconnect(id(1)));
        assert!(!p.disconnect(id(1)));
        let _b = bind(&p, id(2)).unwrap();
        assert!(!p.disconnect(id(1)));
        assert!(p.is_connected());
        assert!(p.fetch_pixels(id(2), GrabHint::default()).is_ok());
    }

    #[test]
    fn test_operations_require_own_binding() {
        let p = painter();
        assert_eq!(
            p.fetch_pixels(id(1), GrabHint::default()).unwrap_err(),
            Error::NotConnected
        );
        let _a = bind(&p, id(1)).unwrap();
        assert_eq!(
            p.fetch_pixels(id(2), GrabHint::default()).unwrap_err(),
            Error::NotConnected
        );
        assert_eq!(
            p.display_control_reply(id(2), vec![1]).unwrap_err(),
            Error::NotConnected
        );
        assert_eq!(
            p.set_cursor_subscription(id(2), true).unwrap_err(),
            Error::NotConnected
        );
    }

    #[test]
    fn test_drain_between_fetches_is_union_of_marks() {
        let p = painter();
        let _a = bind(&p, id(1)).unwrap();
        drop(p.fetch_pixels(id(1), GrabHint::default()).unwrap());

        let marks = [
            Rect::new(0, 0, 4, 4),
            Rect::new(2, 2, 10, 6),
            Rect::new(30, 30, 40, 40),
        ];
        for r in marks {
            p.mark_dirty(r);
        }
        let grab = p.fetch_pixels(id(1), GrabHint::default()).unwrap();
        let rects = grab.rects().to_vec();
        drop(grab);
        for y in 0..48 {
            for x in 0..64 {
                let marked = marks.iter().any(|r| r.contains_point(x, y));
                assert_eq!(covered(&rects, x, y), marked, "({x},{y})");
            }
        }

        // nothing new, nothing returned
        let grab = p.fetch_pixels(id(1), GrabHint::default()).unwrap();
        assert!(grab.rects().is_empty());
    }

    #[test]
    fn test_concurrent_marks_drain_exactly_once() {
        let (_ledger, p) = painter_with(PainterConfig {
            dirty_rect_limit: 4096,
            ..PainterConfig::default()
        });
        let _a = bind(&p, id(1)).unwrap();
        drop(p.fetch_pixels(id(1), GrabHint::default()).unwrap());

        const PRODUCERS: i32 = 4;
        const PIXELS: i32 = 1024;
        fn drain(p: &Painter, hits: &mut [u32]) {
            let grab = p.fetch_pixels(id(1), GrabHint::default()).unwrap();
            for r in grab.rects() {
                for y in r.y1..r.y2 {
                    for x in r.x1..r.x2 {
                        hits[(y * 64 + x) as usize] += 1;
                    }
                }
            }
        }

        let done = AtomicBool::new(false);
        let hits = std::thread::scope(|s| {
            let producers: Vec<_> = (0..PRODUCERS)
                .map(|t| {
                    let p = &p;
                    s.spawn(move || {
                        for i in (t..PIXELS).step_by(PRODUCERS as usize) {
                            let (x, y) = (i % 64, i / 64);
                            p.mark_dirty(Rect::new(x, y, x + 1, y + 1));
                        }
                    })
                })
                .collect();
            let consumer = s.spawn(|| {
                let mut hits = vec![0u32; (MODE.width * MODE.height) as usize];
                while !done.load(Ordering::Acquire) {
                    drain(&p, &mut hits);
                }
                drain(&p, &mut hits);
                hits
            });
            for t in producers {
                t.join().unwrap();
            }
            done.store(true, Ordering::Release);
            consumer.join().unwrap()
        });

        for (i, count) in hits.iter().enumerate() {
            let expected = u32::from((i as i32) < PIXELS);
            assert_eq!(*count, expected, "pixel {i}");
        }
    }

    #[test]
    fn test_concurrent_fetch_is_busy() {
        let p = painter();
        let _a = bind(&p, id(1)).unwrap();
        let grab = p.fetch_pixels(id(1), GrabHint::default()).unwrap();
        assert_eq!(
            p.fetch_pixels(id(1), GrabHint::default()).unwrap_err(),
            Error::Busy
        );
        drop(grab);
        assert!(p.fetch_pixels(id(1), GrabHint::default()).is_ok());
    }

    #[test]
    fn test_grab_hint() {
        let p = painter();
        let _a = bind(&p, id(1)).unwrap();
        let hint = GrabHint {
            format: Some(PixelFormat::Rgb565),
            max_rects: None,
        };
        assert_eq!(p.fetch_pixels(id(1), hint).unwrap_err(), Error::FormatMismatch);
        // the failed fetch did not leave the binding busy, nor drain anything
        let grab = p
            .fetch_pixels(
                id(1),
                GrabHint {
                    format: None,
                    max_rects: Some(1),
                },
            )
            .unwrap();
        assert_eq!(grab.rects(), &[MODE.bounds()]);
        drop(grab);

        p.mark_dirty(Rect::new(0, 0, 1, 1));
        p.mark_dirty(Rect::new(10, 10, 11, 11));
        let grab = p
            .fetch_pixels(
                id(1),
                GrabHint {
                    format: None,
                    max_rects: Some(1),
                },
            )
            .unwrap();
        assert_eq!(grab.rects(), &[Rect::new(0, 0, 11, 11)]);
    }

    #[test]
    fn test_grab_survives_mode_change() {
        let p = painter();
        let _a = bind(&p, id(1)).unwrap();
        let grab = p.fetch_pixels(id(1), GrabHint::default()).unwrap();
        p.mode_changed(Mode::new(32, 32, 60), PixelFormat::Xrgb8888)
            .unwrap();
        assert_eq!(grab.pixels().len(), 64 * 48 * 4);
    }

    #[tokio::test]
    async fn test_request_update_times_out_with_no_change() {
        let p = painter();
        let _a = bind(&p, id(1)).unwrap();
        drop(p.fetch_pixels(id(1), GrabHint::default()).unwrap());

        let timeout = Duration::from_millis(60);
        let start = std::time::Instant::now();
        let status = p.request_update(id(1), timeout).await.unwrap();
        assert_eq!(status, UpdateStatus::NoChange);
        assert!(start.elapsed() >= timeout);
    }

    #[tokio::test]
    async fn test_request_update_returns_immediately_when_dirty() {
        let p = painter();
        let _a = bind(&p, id(1)).unwrap();
        let status = p
            .request_update(id(1), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(status, UpdateStatus::Updated);
    }

    #[tokio::test]
    async fn test_request_update_wakes_on_mark() {
        let p = painter();
        let _a = bind(&p, id(1)).unwrap();
        drop(p.fetch_pixels(id(1), GrabHint::default()).unwrap());

        let waiter = {
            let p = Arc::clone(&p);
            tokio::spawn(async move { p.request_update(id(1), Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        p.mark_dirty(Rect::new(5, 5, 6, 6));

        let status = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(status, UpdateStatus::Updated);
    }

    #[tokio::test]
    async fn test_disconnect_wakes_waiter() {
        let p = painter();
        let _a = bind(&p, id(1)).unwrap();
        drop(p.fetch_pixels(id(1), GrabHint::default()).unwrap());

        let waiter = {
            let p = Arc::clone(&p);
            tokio::spawn(async move { p.request_update(id(1), Duration::from_secs(10)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(p.disconnect(id(1)));

        let status = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(status, UpdateStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_request_update_unbound() {
        let p = painter();
        assert_eq!(
            p.request_update(id(1), Duration::from_millis(1))
                .await
                .unwrap_err(),
            Error::NotConnected
        );
    }

    #[tokio::test]
    async fn test_display_control_roundtrip() {
        let p = painter();
        let mut events = bind(&p, id(1)).unwrap();

        let host = {
            let p = Arc::clone(&p);
            tokio::spawn(async move { p.display_control_request(vec![0x51, 0x82]).await })
        };

        let event = events.recv().await.unwrap();
        assert_eq!(event, ConsumerEvent::DisplayControlRequest(vec![0x51, 0x82]));
        p.display_control_reply(id(1), vec![0x6e, 0x01]).unwrap();

        assert_eq!(host.await.unwrap().unwrap(), vec![0x6e, 0x01]);
        // nothing outstanding anymore
        assert_eq!(
            p.display_control_reply(id(1), vec![0]).unwrap_err(),
            Error::StaleReply
        );
    }

    #[tokio::test]
    async fn test_display_control_timeout_clears_pending() {
        let p = painter();
        let _events = bind(&p, id(1)).unwrap();
        assert_eq!(
            p.display_control_request(vec![1]).await.unwrap_err(),
            Error::TimedOut
        );
        assert_eq!(
            p.display_control_reply(id(1), vec![2]).unwrap_err(),
            Error::StaleReply
        );
    }

    #[tokio::test]
    async fn test_display_control_limits() {
        let p = painter();
        assert_eq!(
            p.display_control_request(vec![1]).await.unwrap_err(),
            Error::NotConnected
        );
        let _events = bind(&p, id(1)).unwrap();
        assert!(matches!(
            p.display_control_request(vec![0; 65]).await,
            Err(Error::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_capabilities_gate_events() {
        let p = painter();
        let (tx, mut events) = mpsc::channel(8);
        p.connect(
            id(1),
            ConnectRequest {
                capabilities: Capabilities::empty(),
                ..request()
            },
            tx,
        )
        .unwrap();

        let start = std::time::Instant::now();
        assert_eq!(
            p.display_control_request(vec![1]).await.unwrap_err(),
            Error::Unsupported
        );
        assert!(start.elapsed() < PainterConfig::default().display_control_timeout);
        assert_eq!(
            p.set_cursor_subscription(id(1), true).unwrap_err(),
            Error::Unsupported
        );
        p.set_cursor_subscription(id(1), false).unwrap();
        assert!(!p.cursor.events_enabled());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_event_queue_drops_and_resyncs_cursor() {
        let p = painter();
        let (tx, mut events) = mpsc::channel(1);
        p.connect(id(1), request(), tx).unwrap();

        p.set_cursor_subscription(id(1), true).unwrap();
        for x in 1..=3 {
            let change = p.cursor.update((x, 0), None, true).unwrap();
            p.cursor_changed(change);
        }
        // the queue held one event; host display control fails fast
        assert_eq!(
            p.display_control_request(vec![1]).await.unwrap_err(),
            Error::Busy
        );
        assert!(matches!(events.try_recv().unwrap(), ConsumerEvent::CursorSet(_)));
        assert!(events.try_recv().is_err());

        // dropped moves are made up for with the whole cursor
        let change = p.cursor.update((9, 4), None, true).unwrap();
        p.cursor_changed(change);
        match events.try_recv().unwrap() {
            ConsumerEvent::CursorSet(snap) => assert_eq!((snap.x, snap.y), (9, 4)),
            other => panic!("unexpected {other:?}"),
        }
        let change = p.cursor.update((10, 4), None, true).unwrap();
        p.cursor_changed(change);
        assert_eq!(
            events.try_recv().unwrap(),
            ConsumerEvent::CursorMove { x: 10, y: 4 }
        );
    }

    #[tokio::test]
    async fn test_display_control_one_outstanding() {
        let (_ledger, p) = painter_with(PainterConfig {
            display_control_timeout: Duration::from_secs(5),
            ..PainterConfig::default()
        });
        let mut events = bind(&p, id(1)).unwrap();
        let first = {
            let p = Arc::clone(&p);
            tokio::spawn(async move { p.display_control_request(vec![1]).await })
        };
        events.recv().await.unwrap();
        assert_eq!(
            p.display_control_request(vec![2]).await.unwrap_err(),
            Error::Busy
        );
        // consumer goes away: the waiting host request fails instead of hanging
        p.disconnect(id(1));
        assert_eq!(first.await.unwrap().unwrap_err(), Error::NotConnected);
    }

    #[tokio::test]
    async fn test_cursor_events_follow_subscription() {
        let p = painter();
        let mut events = bind(&p, id(1)).unwrap();
        let shape = CursorShape {
            width: 2,
            height: 2,
            hot_x: 1,
            hot_y: 1,
            stride: 8,
            pixels: vec![0xaa; 16].into(),
        };

        let change = p.cursor.update((3, 3), Some(shape.clone()), true).unwrap();
        p.cursor_changed(change);
        assert!(events.try_recv().is_err());

        p.set_cursor_subscription(id(1), true).unwrap();
        match events.try_recv().unwrap() {
            ConsumerEvent::CursorSet(snap) => assert_eq!(snap.shape, Some(shape)),
            other => panic!("unexpected {other:?}"),
        }
        // unchanged subscription is a no-op
        p.set_cursor_subscription(id(1), true).unwrap();
        assert!(events.try_recv().is_err());

        let change = p.cursor.update((7, 8), None, true).unwrap();
        p.cursor_changed(change);
        assert_eq!(
            events.try_recv().unwrap(),
            ConsumerEvent::CursorMove { x: 7, y: 8 }
        );

        p.disconnect(id(1));
        assert!(!p.cursor.events_enabled());
    }

    #[tokio::test]
    async fn test_mode_change_notifies_and_dirties() {
        let p = painter();
        let mut events = bind(&p, id(1)).unwrap();
        drop(p.fetch_pixels(id(1), GrabHint::default()).unwrap());

        let mode = Mode::new(16, 16, 30);
        let handle = p.mode_changed(mode, PixelFormat::Xrgb8888).unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            ConsumerEvent::ModeChanged {
                mode,
                format: PixelFormat::Xrgb8888,
                handle
            }
        );
        let grab = p.fetch_pixels(id(1), GrabHint::default()).unwrap();
        assert_eq!(grab.handle(), handle);
        assert_eq!(grab.rects(), &[mode.bounds()]);
    }

    #[test]
    fn test_claims_follow_binding() {
        let p = painter();
        let claims = p.claims();
        assert!(!*claims.borrow());
        let _a = bind(&p, id(1)).unwrap();
        assert!(*claims.borrow());
        p.disconnect(id(1));
        assert!(!*claims.borrow());
    }

    #[test]
    fn test_cleanup_forces_disconnect() {
        let (ledger, p) = painter_with(PainterConfig::default());
        let _a = bind(&p, id(1)).unwrap();
        p.cleanup();
        assert!(!p.is_connected());
        assert_eq!(ledger.live(Resource::Painter), 0);
        assert_eq!(
            p.fetch_pixels(id(1), GrabHint::default()).unwrap_err(),
            Error::NotConnected
        );
    }
}
