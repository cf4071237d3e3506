//! Attachment of adapters under parent devices
//!
//! A parent (for example a USB dock) claims a free adapter and exposes it as
//! its display output. An adapter is free when no consumer is bound and no
//! parent holds it.

use crate::device::{DeviceManager, Phase, VirtualDisplay};
use crate::error::{Error, Result};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ParentId(String);

impl ParentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct PlatformDevice {
    display: Arc<VirtualDisplay>,
    attachment: Mutex<Option<ParentId>>,
}

impl PlatformDevice {
    pub fn new(display: Arc<VirtualDisplay>) -> Self {
        Self {
            display,
            attachment: Mutex::new(None),
        }
    }

    fn attachment(&self) -> MutexGuard<'_, Option<ParentId>> {
        self.attachment.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn display(&self) -> &Arc<VirtualDisplay> {
        &self.display
    }

    pub fn attached_to(&self) -> Option<ParentId> {
        self.attachment().clone()
    }

    fn free_with(&self, attachment: &Option<ParentId>) -> bool {
        self.display.phase() == Phase::Active
            && !self.display.painter().is_connected()
            && attachment.is_none()
    }

    pub fn is_free(&self) -> bool {
        let attachment = self.attachment();
        self.free_with(&attachment)
    }

    pub fn attach(&self, parent: ParentId) -> Result<()> {
        let mut attachment = self.attachment();
        if !self.free_with(&attachment) {
            tracing::error!(
                card = self.display.index(),
                %parent,
                "device is already attached, refusing to attach again"
            );
            return Err(Error::AlreadyAttached);
        }
        tracing::info!(card = self.display.index(), %parent, "attached to parent device");
        *attachment = Some(parent);
        Ok(())
    }

    /// No-op unless currently attached to `parent`
    pub fn detach_if_attached_to(&self, parent: &ParentId) -> bool {
        let mut attachment = self.attachment();
        if attachment.as_ref() != Some(parent) {
            return false;
        }
        *attachment = None;
        tracing::info!(card = self.display.index(), %parent, "detached from parent device");
        true
    }
}

/// Set of adapters exposed for attachment
pub struct PlatformBus {
    manager: DeviceManager,
    devices: Mutex<Vec<Arc<PlatformDevice>>>,
}

impl PlatformBus {
    pub fn new(manager: DeviceManager) -> Self {
        Self {
            manager,
            devices: Mutex::new(Vec::new()),
        }
    }

    fn devices_guard(&self) -> MutexGuard<'_, Vec<Arc<PlatformDevice>>> {
        self.devices.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn manager(&self) -> &DeviceManager {
        &self.manager
    }

    pub fn devices(&self) -> Vec<Arc<PlatformDevice>> {
        self.devices_guard().clone()
    }

    pub fn get(&self, index: u32) -> Option<Arc<PlatformDevice>> {
        self.devices_guard()
            .iter()
            .find(|d| d.display.index() == index)
            .cloned()
    }

    pub fn add(&self) -> Result<Arc<PlatformDevice>> {
        let parent = format!("{}.{}", self.manager.config().name, self.devices_guard().len());
        let display = self.manager.create(&parent)?;
        let device = Arc::new(PlatformDevice::new(display));
        self.devices_guard().push(Arc::clone(&device));
        Ok(device)
    }

    pub fn remove(&self, index: u32) -> Result<()> {
        self.devices_guard().retain(|d| d.display.index() != index);
        self.manager.remove(index)
    }

    pub fn find_free(&self) -> Option<Arc<PlatformDevice>> {
        self.devices_guard().iter().find(|d| d.is_free()).cloned()
    }

    /// Reuse a free adapter or add a new one, then attach it to `parent`
    pub fn attach_to_parent(&self, parent: ParentId) -> Result<Arc<PlatformDevice>> {
        let device = match self.find_free() {
            Some(device) => device,
            None => self.add()?,
        };
        device.attach(parent)?;
        Ok(device)
    }

    /// Detach every adapter held by `parent`; returns how many were released
    pub fn detach_parent(&self, parent: &ParentId) -> usize {
        self.devices_guard()
            .iter()
            .filter(|d| d.detach_if_attached_to(parent))
            .count()
    }
}
