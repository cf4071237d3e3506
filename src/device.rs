//! Device lifecycle
//!
//! Builds a [`VirtualDisplay`] step by step against the host display stack.
//! Every step that succeeds pushes its undo onto an [`Unwind`] stack, so a
//! failure part way through releases everything already acquired, newest
//! first, before the error reaches the caller.

use crate::config::DriverConfig;
use crate::cursor::{CursorShape, CursorState};
use crate::damage::Rect;
use crate::error::{Error, Result, Step};
use crate::host::{HostDisplayStack, HostError};
use crate::ledger::{Resource, ResourceLedger, ResourceToken};
use crate::painter::{ConnectRequest, ConsumerEvent, ConsumerId, Painter};
use crate::registry::{Framebuffer, FramebufferHandle, FramebufferRegistry, Mode, PixelFormat};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Active,
    Unregistering,
    Destroyed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorStatus {
    Connected,
    Disconnected,
}

/// Undo actions for the steps of a partially built display
struct Unwind<'a> {
    index: u32,
    steps: Vec<(Step, Box<dyn FnOnce() + Send + 'a>)>,
}

impl<'a> Unwind<'a> {
    fn new(index: u32) -> Self {
        Self {
            index,
            steps: Vec::new(),
        }
    }

    fn push(&mut self, step: Step, undo: impl FnOnce() + Send + 'a) {
        self.steps.push((step, Box::new(undo)));
    }

    /// Construction finished; nothing to undo
    fn commit(mut self) {
        self.steps.clear();
    }
}

impl Drop for Unwind<'_> {
    fn drop(&mut self) {
        while let Some((step, undo)) = self.steps.pop() {
            tracing::debug!(card = self.index, %step, "rolling back");
            undo();
        }
    }
}

fn registration_failed(step: Step) -> impl FnOnce(HostError) -> Error {
    move |e| Error::RegistrationFailed {
        step,
        reason: e.to_string(),
    }
}

/// Handle on the legacy framebuffer-compat layer of one display
#[derive(Debug)]
struct LegacyCompat {
    token: Mutex<Option<ResourceToken>>,
}

impl LegacyCompat {
    fn release(&self) {
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

pub struct VirtualDisplay {
    index: u32,
    phase: Mutex<Phase>,
    host: Arc<dyn HostDisplayStack>,
    cursor: Arc<CursorState>,
    registry: Arc<FramebufferRegistry>,
    painter: Arc<Painter>,
    legacy: Option<Arc<LegacyCompat>>,
    connector: watch::Receiver<bool>,
    next_identity: AtomicU64,
    token: Mutex<Option<ResourceToken>>,
}

impl VirtualDisplay {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: Phase) -> Phase {
        let mut cur = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *cur, phase)
    }

    /// Gate for every external entry point
    pub fn enter(&self) -> Result<()> {
        match self.phase() {
            Phase::Active => Ok(()),
            _ => Err(Error::Unplugged),
        }
    }

    pub fn painter(&self) -> &Arc<Painter> {
        &self.painter
    }

    pub fn cursor(&self) -> &Arc<CursorState> {
        &self.cursor
    }

    pub fn registry(&self) -> &Arc<FramebufferRegistry> {
        &self.registry
    }

    pub fn has_legacy_compat(&self) -> bool {
        self.legacy.is_some()
    }

    pub fn connector_status(&self) -> ConnectorStatus {
        if *self.connector.borrow() {
            ConnectorStatus::Connected
        } else {
            ConnectorStatus::Disconnected
        }
    }

    /// Fires whenever the connector status flips
    pub fn hotplug(&self) -> watch::Receiver<bool> {
        self.connector.clone()
    }

    // producer side

    pub fn set_mode(&self, mode: Mode, format: PixelFormat) -> Result<FramebufferHandle> {
        self.enter()?;
        let handle = self.painter.mode_changed(mode, format)?;
        tracing::info!(card = self.index, %mode, ?format, %handle, "mode set");
        Ok(handle)
    }

    pub fn scanout(&self) -> Result<Arc<Framebuffer>> {
        self.enter()?;
        self.registry
            .scanout()
            .ok_or(Error::InvalidArgument("no mode set"))
    }

    pub fn allocate_framebuffer(&self) -> Result<FramebufferHandle> {
        self.enter()?;
        self.registry.allocate()
    }

    pub fn framebuffer(&self, handle: FramebufferHandle) -> Result<Arc<Framebuffer>> {
        self.enter()?;
        self.registry.get(handle)
    }

    pub fn release_framebuffer(&self, handle: FramebufferHandle) -> Result<()> {
        self.enter()?;
        self.registry.release(handle)
    }

    pub fn flip(&self, handle: FramebufferHandle) -> Result<()> {
        self.enter()?;
        self.painter.flip(handle)
    }

    pub fn mark_dirty(&self, rect: Rect) -> Result<()> {
        self.enter()?;
        self.painter.mark_dirty(rect);
        Ok(())
    }

    /// Render-complete notification for a batch of damaged rects
    pub fn flush(&self, rects: &[Rect]) -> Result<()> {
        self.enter()?;
        for rect in rects {
            self.painter.mark_dirty(*rect);
        }
        Ok(())
    }

    pub fn update_cursor(
        &self,
        position: (i32, i32),
        shape: Option<CursorShape>,
        visible: bool,
    ) -> Result<()> {
        self.enter()?;
        let change = self.cursor.update(position, shape, visible)?;
        self.painter.cursor_changed(change);
        Ok(())
    }

    /// Host-originated display-control query, answered by the consumer
    pub async fn display_control_request(&self, payload: Vec<u8>) -> Result<Vec<u8>> {
        self.enter()?;
        self.painter.display_control_request(payload).await
    }

    // channel bookkeeping

    pub fn on_open(&self, opener: &str) -> Result<ConsumerId> {
        self.enter()?;
        let raw = self.next_identity.fetch_add(1, Ordering::Relaxed);
        let identity = ConsumerId::from_raw(raw).ok_or(Error::AllocationFailed {
            step: Step::Device,
        })?;
        tracing::info!(card = self.index, %identity, "opened by {}", opener);
        Ok(identity)
    }

    /// Bind a consumer. A removal that lands between the phase gate and the
    /// bind is undone here, so a torn-down display never keeps a binding.
    pub fn connect(
        &self,
        identity: ConsumerId,
        request: ConnectRequest,
        events: mpsc::Sender<ConsumerEvent>,
    ) -> Result<()> {
        self.enter()?;
        self.painter.connect(identity, request, events)?;
        if self.phase() != Phase::Active {
            tracing::debug!(card = self.index, %identity, "unplugged while binding");
            self.painter.disconnect(identity);
            self.registry.clear();
            return Err(Error::Unplugged);
        }
        Ok(())
    }

    /// Runs for explicit closes and for abrupt consumer exits alike
    pub fn on_close(&self, identity: ConsumerId, opener: &str) {
        tracing::info!(card = self.index, %identity, "closed by {}", opener);
        self.painter.disconnect(identity);
    }

    /// Unplug first so no new call races the internal teardown
    fn teardown(&self) -> bool {
        if self.set_phase(Phase::Unregistering) != Phase::Active {
            self.set_phase(Phase::Destroyed);
            return false;
        }
        self.host.unplug(self.index);
        if let Some(legacy) = &self.legacy {
            self.host.fbdev_unplug(self.index);
            self.host.fbdev_cleanup(self.index);
            legacy.release();
        }
        self.cursor.release();
        self.painter.cleanup();
        self.registry.clear();
        self.host.modeset_cleanup(self.index);
        self.host.release(self.index);
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.set_phase(Phase::Destroyed);
        true
    }
}

impl fmt::Debug for VirtualDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualDisplay")
            .field("card", &self.index)
            .field("phase", &self.phase())
            .field("connected", &self.painter.is_connected())
            .field("legacy_compat", &self.legacy.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
struct Inner {
    devices: BTreeMap<u32, Arc<VirtualDisplay>>,
    reserved: BTreeSet<u32>,
}

impl Inner {
    fn lowest_free(&self) -> u32 {
        (0..)
            .find(|i| !self.devices.contains_key(i) && !self.reserved.contains(i))
            .unwrap_or(u32::MAX)
    }
}

pub struct DeviceManager {
    config: Arc<DriverConfig>,
    host: Arc<dyn HostDisplayStack>,
    ledger: Arc<ResourceLedger>,
    inner: Mutex<Inner>,
}

impl DeviceManager {
    pub fn new(config: Arc<DriverConfig>, host: Arc<dyn HostDisplayStack>) -> Self {
        tracing::info!("{}", config);
        Self {
            config,
            host,
            ledger: ResourceLedger::new(),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &Arc<DriverConfig> {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<ResourceLedger> {
        &self.ledger
    }

    pub fn get(&self, index: u32) -> Option<Arc<VirtualDisplay>> {
        self.inner().devices.get(&index).cloned()
    }

    pub fn devices(&self) -> Vec<Arc<VirtualDisplay>> {
        self.inner().devices.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner().devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn create(&self, parent: &str) -> Result<Arc<VirtualDisplay>> {
        let index = {
            let mut inner = self.inner();
            if inner.devices.len() + inner.reserved.len() >= self.config.max_devices {
                tracing::error!(parent, "no free device slot");
                return Err(Error::AllocationFailed { step: Step::Device });
            }
            let index = inner.lowest_free();
            inner.reserved.insert(index);
            index
        };

        let result = self.build(index);
        self.inner().reserved.remove(&index);
        let display = match result {
            Ok(display) => display,
            Err(e) => {
                tracing::error!(card = index, parent, error = %e, "failed to set up device");
                return Err(e);
            }
        };
        self.inner().devices.insert(index, Arc::clone(&display));
        tracing::info!(card = index, parent, "device created");
        Ok(display)
    }

    fn build(&self, index: u32) -> Result<Arc<VirtualDisplay>> {
        let host = &self.host;
        let token = self.ledger.acquire(Resource::Display);
        let mut unwind = Unwind::new(index);

        let cursor = Arc::new(CursorState::new(self.ledger.acquire(Resource::Cursor)));
        {
            let cursor = Arc::clone(&cursor);
            unwind.push(Step::Cursor, move || cursor.release());
        }

        host.modeset_init(index)
            .map_err(registration_failed(Step::Modeset))?;
        unwind.push(Step::Modeset, move || host.modeset_cleanup(index));

        let legacy = if self.config.legacy_fbdev {
            host.fbdev_init(index)
                .map_err(registration_failed(Step::LegacyCompat))?;
            let legacy = Arc::new(LegacyCompat {
                token: Mutex::new(Some(self.ledger.acquire(Resource::LegacyCompat))),
            });
            let undo = Arc::clone(&legacy);
            unwind.push(Step::LegacyCompat, move || {
                host.fbdev_cleanup(index);
                undo.release();
            });
            Some(legacy)
        } else {
            None
        };

        host.vblank_init(index)
            .map_err(registration_failed(Step::Vblank))?;

        let registry = Arc::new(FramebufferRegistry::new(
            self.ledger.acquire(Resource::Registry),
        ));
        let painter = Arc::new(Painter::new(
            index,
            self.config.painter,
            Arc::clone(&registry),
            Arc::clone(&cursor),
            self.ledger.acquire(Resource::Painter),
        ));
        {
            let painter = Arc::clone(&painter);
            let registry = Arc::clone(&registry);
            unwind.push(Step::Painter, move || {
                painter.cleanup();
                registry.clear();
            });
        }

        let connector = painter.claims();
        tracing::debug!(card = index, "connector polling ready");

        let display = Arc::new(VirtualDisplay {
            index,
            phase: Mutex::new(Phase::Uninitialized),
            host: Arc::clone(host),
            cursor,
            registry,
            painter,
            legacy,
            connector,
            next_identity: AtomicU64::new(1),
            token: Mutex::new(Some(token)),
        });

        host.register(index)
            .map_err(registration_failed(Step::Register))?;

        unwind.commit();
        display.set_phase(Phase::Active);
        Ok(display)
    }

    /// Tear down one display. Safe to call while consumers are attached;
    /// they are forced off.
    pub fn remove(&self, index: u32) -> Result<()> {
        let display = self
            .inner()
            .devices
            .remove(&index)
            .ok_or(Error::InvalidArgument("unknown device"))?;
        if display.teardown() {
            tracing::info!(card = index, "device removed");
        }
        Ok(())
    }

    /// Module unload
    pub fn remove_all(&self) {
        let indices: Vec<u32> = self.inner().devices.keys().copied().collect();
        for index in indices {
            let _ = self.remove(index);
        }
    }
}

impl Drop for DeviceManager {
    fn drop(&mut self) {
        self.remove_all();
    }
}
