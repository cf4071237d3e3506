//! Boundary to the host display stack
//!
//! Mode-setting objects, the legacy framebuffer layer, vblank and device
//! registration are owned by the host. The adapter only drives them in
//! order and unwinds them on failure.

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostError(pub String);

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for HostError {}

pub trait HostDisplayStack: Send + Sync {
    /// Register the mode-setting surface (crtc, encoder, connector)
    fn modeset_init(&self, index: u32) -> Result<(), HostError>;
    fn modeset_cleanup(&self, index: u32);

    fn fbdev_init(&self, index: u32) -> Result<(), HostError>;
    fn fbdev_unplug(&self, index: u32);
    fn fbdev_cleanup(&self, index: u32);

    fn vblank_init(&self, index: u32) -> Result<(), HostError>;

    /// Make the device visible to the host; new calls may arrive after this
    fn register(&self, index: u32) -> Result<(), HostError>;
    /// Stop routing new calls to the device
    fn unplug(&self, index: u32);
    /// Drop the underlying registration after internal teardown
    fn release(&self, index: u32);
}

/// Host that only logs. Used when the adapter runs without a real
/// display stack behind it.
#[derive(Debug, Default)]
pub struct Headless;

impl HostDisplayStack for Headless {
    fn modeset_init(&self, index: u32) -> Result<(), HostError> {
        tracing::debug!(card = index, "modeset init");
        Ok(())
    }

    fn modeset_cleanup(&self, index: u32) {
        tracing::debug!(card = index, "modeset cleanup");
    }

    fn fbdev_init(&self, index: u32) -> Result<(), HostError> {
        tracing::debug!(card = index, "fbdev init");
        Ok(())
    }

    fn fbdev_unplug(&self, index: u32) {
        tracing::debug!(card = index, "fbdev unplug");
    }

    fn fbdev_cleanup(&self, index: u32) {
        tracing::debug!(card = index, "fbdev cleanup");
    }

    fn vblank_init(&self, index: u32) -> Result<(), HostError> {
        tracing::debug!(card = index, "vblank init");
        Ok(())
    }

    fn register(&self, index: u32) -> Result<(), HostError> {
        tracing::debug!(card = index, "registered");
        Ok(())
    }

    fn unplug(&self, index: u32) {
        tracing::debug!(card = index, "unplugged");
    }

    fn release(&self, index: u32) {
        tracing::debug!(card = index, "released");
    }
}
