//! Driver descriptor
//!
//! Built once when the adapter type is registered and handed to the
//! [`DeviceManager`](crate::device::DeviceManager) by `Arc`. Nothing in the
//! crate keeps process-wide mutable driver state.

use crate::control::OpcodeTable;
use crate::painter::PainterConfig;
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub name: &'static str,
    pub desc: &'static str,
    pub date: &'static str,
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub opcodes: OpcodeTable,
    /// Register the legacy framebuffer-compat layer for every adapter
    pub legacy_fbdev: bool,
    pub max_devices: usize,
    pub painter: PainterConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            name: "vdisplay",
            desc: "Virtual display adapter",
            date: "20261017",
            major: 1,
            minor: 0,
            patch: 0,
            opcodes: OpcodeTable::standard(),
            legacy_fbdev: false,
            max_devices: 16,
            painter: PainterConfig::default(),
        }
    }
}

impl DriverConfig {
    pub fn with_legacy_fbdev(mut self, enabled: bool) -> Self {
        self.legacy_fbdev = enabled;
        self
    }

    pub fn with_max_devices(mut self, max: usize) -> Self {
        self.max_devices = max;
        self
    }

    pub fn with_dirty_rect_limit(mut self, limit: usize) -> Self {
        self.painter.dirty_rect_limit = limit.max(1);
        self
    }

    pub fn with_display_control_timeout(mut self, timeout: Duration) -> Self {
        self.painter.display_control_timeout = timeout;
        self
    }
}

impl fmt::Display for DriverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}.{}.{} ({}) - {}",
            self.name, self.major, self.minor, self.patch, self.date, self.desc
        )
    }
}
