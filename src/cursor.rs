//! Cursor state holder
//!
//! Producer side pushes position/shape/visibility; the painter reads a
//! snapshot when it needs to notify a subscribed consumer.

use crate::error::{Error, Result};
use crate::ledger::ResourceToken;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const MAX_CURSOR_SIZE: u32 = 256;

/// ARGB8888 cursor image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorShape {
    pub width: u32,
    pub height: u32,
    pub hot_x: u32,
    pub hot_y: u32,
    pub stride: u32,
    pub pixels: Arc<[u8]>,
}

impl CursorShape {
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidCursorShape("zero size"));
        }
        if self.width > MAX_CURSOR_SIZE || self.height > MAX_CURSOR_SIZE {
            return Err(Error::InvalidCursorShape("larger than 256x256"));
        }
        if self.hot_x >= self.width || self.hot_y >= self.height {
            return Err(Error::InvalidCursorShape("hotspot outside the image"));
        }
        if self.stride < self.width * 4 {
            return Err(Error::InvalidCursorShape("stride shorter than a row"));
        }
        if (self.pixels.len() as u64) < self.stride as u64 * self.height as u64 {
            return Err(Error::InvalidCursorShape("pixel data too short"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CursorSnapshot {
    pub x: i32,
    pub y: i32,
    pub visible: bool,
    pub shape: Option<CursorShape>,
}

/// What an accepted update changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CursorChange {
    pub moved: bool,
    pub shape_changed: bool,
}

impl CursorChange {
    pub fn is_empty(&self) -> bool {
        !self.moved && !self.shape_changed
    }
}

#[derive(Debug, Default)]
struct Inner {
    current: CursorSnapshot,
    events_enabled: bool,
}

#[derive(Debug)]
pub struct CursorState {
    inner: Mutex<Inner>,
    token: Mutex<Option<ResourceToken>>,
}

impl CursorState {
    pub fn new(token: ResourceToken) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            token: Mutex::new(Some(token)),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply a producer update. `shape: None` keeps the current image.
    /// A malformed shape rejects the whole update and leaves state untouched.
    pub fn update(
        &self,
        position: (i32, i32),
        shape: Option<CursorShape>,
        visible: bool,
    ) -> Result<CursorChange> {
        if let Some(shape) = &shape {
            if let Err(e) = shape.validate() {
                tracing::warn!(error = %e, "ignoring cursor update");
                return Err(e);
            }
        }

        let mut inner = self.inner();
        let cur = &mut inner.current;
        let mut change = CursorChange {
            moved: (cur.x, cur.y) != position,
            shape_changed: cur.visible != visible,
        };
        cur.x = position.0;
        cur.y = position.1;
        cur.visible = visible;
        if let Some(shape) = shape {
            if cur.shape.as_ref() != Some(&shape) {
                change.shape_changed = true;
                cur.shape = Some(shape);
            }
        }
        Ok(change)
    }

    pub fn snapshot(&self) -> CursorSnapshot {
        self.inner().current.clone()
    }

    /// Returns true if the flag actually changed
    pub fn set_events_enabled(&self, enabled: bool) -> bool {
        let mut inner = self.inner();
        let changed = inner.events_enabled != enabled;
        inner.events_enabled = enabled;
        changed
    }

    pub fn events_enabled(&self) -> bool {
        self.inner().events_enabled
    }

    /// Teardown: forget the image and give back the resource token
    pub fn release(&self) {
        {
            let mut inner = self.inner();
            inner.current = CursorSnapshot::default();
            inner.events_enabled = false;
        }
        self.token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}
