//! Frame buffer registry
//!
//! Owns the pixel buffers backing a virtual display. Handles are issued
//! monotonically and never reused. A handle that has been handed to a
//! consumer stays resolvable until the next mode change or teardown, even if
//! the producer releases it in the meantime.

use crate::damage::Rect;
use crate::error::{Error, Result, Step};
use crate::ledger::ResourceToken;
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

const MAX_DIMENSION: u32 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    Xrgb8888,
    Argb8888,
    Rgb565,
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::Xrgb8888 | PixelFormat::Argb8888 => 4,
            PixelFormat::Rgb565 => 2,
        }
    }

    /// DRM fourcc
    pub fn fourcc(self) -> u32 {
        let code = match self {
            PixelFormat::Xrgb8888 => b"XR24",
            PixelFormat::Argb8888 => b"AR24",
            PixelFormat::Rgb565 => b"RG16",
        };
        u32::from_le_bytes(*code)
    }

    pub fn from_fourcc(code: u32) -> Option<Self> {
        [
            PixelFormat::Xrgb8888,
            PixelFormat::Argb8888,
            PixelFormat::Rgb565,
        ]
        .into_iter()
        .find(|f| f.fourcc() == code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Mode {
    pub width: u32,
    pub height: u32,
    pub refresh: u32,
}

impl Mode {
    pub const fn new(width: u32, height: u32, refresh: u32) -> Self {
        Self {
            width,
            height,
            refresh,
        }
    }

    pub fn bounds(&self) -> Rect {
        Rect::from_size(self.width, self.height)
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::InvalidArgument("mode has zero size"));
        }
        if self.width > MAX_DIMENSION || self.height > MAX_DIMENSION {
            return Err(Error::InvalidArgument("mode exceeds maximum size"));
        }
        Ok(())
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}", self.width, self.height, self.refresh)
    }
}

/// `WIDTHxHEIGHT` with an optional `@REFRESH`, 60 Hz when omitted
impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (size, refresh) = match s.split_once('@') {
            Some((size, refresh)) => (size, Some(refresh)),
            None => (s, None),
        };
        let (w, h) = size
            .split_once(['x', 'X'])
            .ok_or(Error::InvalidArgument("mode must look like WIDTHxHEIGHT"))?;
        let num = |v: &str| {
            v.trim()
                .parse::<u32>()
                .map_err(|_| Error::InvalidArgument("mode must look like WIDTHxHEIGHT"))
        };
        let mode = Mode::new(num(w)?, num(h)?, refresh.map(num).transpose()?.unwrap_or(60));
        mode.validate()?;
        Ok(mode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FramebufferHandle(NonZeroU32);

impl FramebufferHandle {
    pub fn get(self) -> u32 {
        self.0.get()
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        NonZeroU32::new(raw).map(Self)
    }
}

impl fmt::Display for FramebufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fb{}", self.0)
    }
}

/// One pixel buffer. Storage is shared by `Arc`, so a grab in flight keeps
/// it alive independently of the registry.
#[derive(Debug)]
pub struct Framebuffer {
    handle: FramebufferHandle,
    mode: Mode,
    format: PixelFormat,
    stride: u32,
    pixels: RwLock<Vec<u8>>,
}

impl Framebuffer {
    fn new(handle: FramebufferHandle, mode: Mode, format: PixelFormat) -> Self {
        let stride = mode.width * format.bytes_per_pixel();
        let size = stride as usize * mode.height as usize;
        Self {
            handle,
            mode,
            format,
            stride,
            pixels: RwLock::new(vec![0; size]),
        }
    }

    pub fn handle(&self) -> FramebufferHandle {
        self.handle
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn bounds(&self) -> Rect {
        self.mode.bounds()
    }

    pub fn read<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let pixels = self.pixels.read().unwrap_or_else(PoisonError::into_inner);
        f(&pixels)
    }

    pub fn write<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut pixels = self.pixels.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut pixels)
    }

    /// Append the rows of `rect` (clipped to the buffer) to `out`, tightly packed
    pub fn copy_rect(&self, rect: &Rect, out: &mut Vec<u8>) -> Rect {
        let rect = rect.intersect(&self.bounds());
        if rect.is_empty() {
            return rect;
        }
        let bpp = self.format.bytes_per_pixel() as usize;
        let stride = self.stride as usize;
        let row_len = rect.width() as usize * bpp;
        self.read(|pixels| {
            for y in rect.y1..rect.y2 {
                let start = y as usize * stride + rect.x1 as usize * bpp;
                out.extend_from_slice(&pixels[start..start + row_len]);
            }
        });
        rect
    }

    /// Fill `rect` with a 32-bit pixel value (truncated for 16-bit formats)
    pub fn fill_rect(&self, rect: &Rect, pixel: u32) {
        let rect = rect.intersect(&self.bounds());
        if rect.is_empty() {
            return;
        }
        let bpp = self.format.bytes_per_pixel() as usize;
        let stride = self.stride as usize;
        let value = pixel.to_le_bytes();
        self.write(|pixels| {
            for y in rect.y1..rect.y2 {
                for x in rect.x1..rect.x2 {
                    let idx = y as usize * stride + x as usize * bpp;
                    pixels[idx..idx + bpp].copy_from_slice(&value[..bpp]);
                }
            }
        });
    }
}

#[derive(Debug)]
struct Entry {
    fb: Arc<Framebuffer>,
    exposed: bool,
    retiring: bool,
}

#[derive(Debug, Default)]
struct Inner {
    current: Option<(Mode, PixelFormat)>,
    entries: HashMap<FramebufferHandle, Entry>,
    scanout: Option<FramebufferHandle>,
    last_handle: u32,
}

impl Inner {
    fn allocate(&mut self, mode: Mode, format: PixelFormat) -> Result<FramebufferHandle> {
        let raw = self
            .last_handle
            .checked_add(1)
            .ok_or(Error::AllocationFailed { step: Step::Painter })?;
        let handle = FramebufferHandle::from_raw(raw).ok_or(Error::AllocationFailed {
            step: Step::Painter,
        })?;
        self.last_handle = raw;
        self.entries.insert(
            handle,
            Entry {
                fb: Arc::new(Framebuffer::new(handle, mode, format)),
                exposed: false,
                retiring: false,
            },
        );
        Ok(handle)
    }
}

#[derive(Debug)]
pub struct FramebufferRegistry {
    inner: Mutex<Inner>,
    token: Mutex<Option<ResourceToken>>,
}

impl FramebufferRegistry {
    pub fn new(token: ResourceToken) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            token: Mutex::new(Some(token)),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mode(&self) -> Option<(Mode, PixelFormat)> {
        self.inner().current
    }

    /// Retire every handle and allocate a fresh scanout buffer
    pub fn mode_set(&self, mode: Mode, format: PixelFormat) -> Result<FramebufferHandle> {
        mode.validate()?;
        let mut inner = self.inner();
        let retired = inner.entries.len();
        inner.entries.clear();
        inner.scanout = None;
        let handle = inner.allocate(mode, format)?;
        inner.current = Some((mode, format));
        inner.scanout = Some(handle);
        tracing::debug!(%mode, ?format, %handle, retired, "mode set");
        Ok(handle)
    }

    /// Additional buffer at the current mode
    pub fn allocate(&self) -> Result<FramebufferHandle> {
        let mut inner = self.inner();
        let (mode, format) = inner
            .current
            .ok_or(Error::InvalidArgument("no mode set"))?;
        inner.allocate(mode, format)
    }

    pub fn flip(&self, handle: FramebufferHandle) -> Result<()> {
        let mut inner = self.inner();
        match inner.entries.get(&handle) {
            Some(entry) if !entry.retiring => {
                inner.scanout = Some(handle);
                Ok(())
            }
            _ => Err(Error::StaleHandle),
        }
    }

    /// Free a producer buffer. Buffers already handed to the consumer are only
    /// marked and stay resolvable until the next mode change.
    pub fn release(&self, handle: FramebufferHandle) -> Result<()> {
        let mut inner = self.inner();
        if inner.scanout == Some(handle) {
            return Err(Error::InvalidArgument("cannot release the scanout buffer"));
        }
        let entry = inner.entries.get_mut(&handle).ok_or(Error::StaleHandle)?;
        if entry.retiring {
            return Err(Error::StaleHandle);
        }
        if entry.exposed {
            entry.retiring = true;
        } else {
            inner.entries.remove(&handle);
        }
        Ok(())
    }

    pub fn get(&self, handle: FramebufferHandle) -> Result<Arc<Framebuffer>> {
        self.inner()
            .entries
            .get(&handle)
            .map(|e| Arc::clone(&e.fb))
            .ok_or(Error::StaleHandle)
    }

    pub fn scanout(&self) -> Option<Arc<Framebuffer>> {
        let inner = self.inner();
        inner
            .scanout
            .and_then(|h| inner.entries.get(&h))
            .map(|e| Arc::clone(&e.fb))
    }

    /// Hand the scanout buffer to a consumer, pinning its handle
    pub fn handoff(&self) -> Option<(FramebufferHandle, Arc<Framebuffer>)> {
        let mut inner = self.inner();
        let handle = inner.scanout?;
        let entry = inner.entries.get_mut(&handle)?;
        entry.exposed = true;
        Some((handle, Arc::clone(&entry.fb)))
    }

    pub fn len(&self) -> usize {
        self.inner().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Teardown: drop every buffer and the registry's resource token
    pub fn clear(&self) {
        {
            let mut inner = self.inner();
            inner.entries.clear();
            inner.scanout = None;
            inner.current = None;
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
    use crate::ledger::{Resource, ResourceLedger};

    fn registry() -> (Arc<ResourceLedger>, FramebufferRegistry) {
        let ledger = ResourceLedger::new();
        let reg = FramebufferRegistry::new(ledger.acquire(Resource::Registry));
        (ledger, reg)
    }

    #[test]
    fn test_fourcc_roundtrip() {
        for f in [
            PixelFormat::Xrgb8888,
            PixelFormat::Argb8888,
            PixelFormat::Rgb565,
        ] {
            assert_eq!(PixelFormat::from_fourcc(f.fourcc()), Some(f));
        }
        assert_eq!(PixelFormat::from_fourcc(0), None);
    }

    #[test]
    fn test_mode_validation() {
        assert!(Mode::new(0, 10, 60).validate().is_err());
        assert!(Mode::new(9000, 10, 60).validate().is_err());
        assert!(Mode::new(1920, 1080, 60).validate().is_ok());
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("1280x720".parse::<Mode>().unwrap(), Mode::new(1280, 720, 60));
        assert_eq!("640X480@75".parse::<Mode>().unwrap(), Mode::new(640, 480, 75));
        assert!("1280".parse::<Mode>().is_err());
        assert!("0x720".parse::<Mode>().is_err());
        assert!("axb".parse::<Mode>().is_err());
    }

    #[test]
    fn test_handles_never_reused() {
        let (_ledger, reg) = registry();
        let a = reg.mode_set(Mode::new(4, 4, 60), PixelFormat::Xrgb8888).unwrap();
        let b = reg.allocate().unwrap();
        reg.release(b).unwrap();
        let c = reg.mode_set(Mode::new(8, 8, 60), PixelFormat::Xrgb8888).unwrap();
        let d = reg.allocate().unwrap();
        let all = [a, b, c, d];
        for (i, x) in all.iter().enumerate() {
            for y in &all[i + 1..] {
                assert_ne!(x, y);
            }
        }
    }

    #[test]
    fn test_mode_change_retires_handles() {
        let (_ledger, reg) = registry();
        let old = reg.mode_set(Mode::new(4, 4, 60), PixelFormat::Xrgb8888).unwrap();
        let (handed, fb) = reg.handoff().unwrap();
        assert_eq!(handed, old);

        reg.mode_set(Mode::new(8, 8, 60), PixelFormat::Xrgb8888).unwrap();
        assert_eq!(reg.get(old).unwrap_err(), Error::StaleHandle);
        // storage held by the in-flight grab is still readable
        assert_eq!(fb.read(|p| p.len()), 4 * 4 * 4);
    }

    #[test]
    fn test_release_of_exposed_buffer_is_deferred() {
        let (_ledger, reg) = registry();
        reg.mode_set(Mode::new(4, 4, 60), PixelFormat::Xrgb8888).unwrap();
        let back = reg.allocate().unwrap();
        reg.flip(back).unwrap();
        let (handed, _) = reg.handoff().unwrap();
        assert_eq!(handed, back);

        let front = reg.allocate().unwrap();
        reg.flip(front).unwrap();
        reg.release(back).unwrap();

        // still resolvable for the consumer, but can no longer be flipped to
        assert!(reg.get(back).is_ok());
        assert_eq!(reg.flip(back).unwrap_err(), Error::StaleHandle);
        assert_eq!(reg.release(back).unwrap_err(), Error::StaleHandle);
    }

    #[test]
    fn test_release_scanout_refused() {
        let (_ledger, reg) = registry();
        let h = reg.mode_set(Mode::new(4, 4, 60), PixelFormat::Xrgb8888).unwrap();
        assert!(matches!(reg.release(h), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn test_allocate_requires_mode() {
        let (_ledger, reg) = registry();
        assert!(matches!(reg.allocate(), Err(Error::InvalidArgument(_))));
        assert!(reg.handoff().is_none());
    }

    #[test]
    fn test_copy_and_fill_rect() {
        let (_ledger, reg) = registry();
        reg.mode_set(Mode::new(4, 3, 60), PixelFormat::Xrgb8888).unwrap();
        let fb = reg.scanout().unwrap();
        fb.fill_rect(&Rect::new(1, 1, 3, 2), 0x00ff_0000);

        let mut out = Vec::new();
        let clipped = fb.copy_rect(&Rect::new(1, 1, 10, 2), &mut out);
        assert_eq!(clipped, Rect::new(1, 1, 4, 2));
        assert_eq!(out.len(), 3 * 4);
        assert_eq!(&out[0..4], &0x00ff_0000u32.to_le_bytes());
        assert_eq!(&out[8..12], &[0, 0, 0, 0]);
    }

    #[test]
    fn test_clear_releases_token() {
        let (ledger, reg) = registry();
        reg.mode_set(Mode::new(4, 4, 60), PixelFormat::Rgb565).unwrap();
        assert_eq!(ledger.live(Resource::Registry), 1);
        reg.clear();
        assert!(reg.is_empty());
        assert!(reg.mode().is_none());
        assert_eq!(ledger.live(Resource::Registry), 0);
    }
}
