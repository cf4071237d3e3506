//! Producers feeding a served adapter
//!
//! A producer draws into the current scanout buffer, marks what it touched
//! and reports the pointer as the cursor. The adapter's painter takes it from
//! there.

use crate::cursor::CursorShape;
use crate::damage::Rect;
use crate::device::VirtualDisplay;
use crate::error::Error;
use crate::registry::{Framebuffer, FramebufferHandle, PixelFormat};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use x11rb::connection::Connection;
use x11rb::protocol::xproto::{ConnectionExt, ImageFormat, Window};
use x11rb::rust_connection::RustConnection;

pub trait FrameSource: Send {
    fn name(&self) -> &'static str;

    /// Draw one frame into `display`
    fn render(&mut self, display: &VirtualDisplay) -> Result<()>;
}

/// Drive `source` until the display is unplugged
pub async fn run_source(
    display: Arc<VirtualDisplay>,
    mut source: Box<dyn FrameSource>,
    interval: Duration,
) -> Result<()> {
    let card = display.index();
    tracing::info!(card, source = source.name(), "producer started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut failures = 0u32;

    loop {
        ticker.tick().await;
        match source.render(&display) {
            Ok(()) => failures = 0,
            Err(e) if e.downcast_ref::<Error>() == Some(&Error::Unplugged) => break,
            Err(e) => {
                failures += 1;
                if failures == 1 || failures.is_multiple_of(100) {
                    tracing::warn!(source = source.name(), failures, error = %e, "render failed");
                }
            }
        }
    }
    tracing::info!(card, "producer stopped, display unplugged");
    Ok(())
}

/// Returns the scanout buffer and whether it differs from `last`
fn current_scanout(
    display: &VirtualDisplay,
    last: &mut Option<FramebufferHandle>,
) -> Result<(Arc<Framebuffer>, bool)> {
    let fb = display.scanout()?;
    let changed = *last != Some(fb.handle());
    *last = Some(fb.handle());
    Ok((fb, changed))
}

const BAR_WIDTH: i32 = 32;
const BACKGROUND: u32 = 0x0020_2020;
const BAR: u32 = 0x00e0_7020;

/// Synthetic producer: a bar sweeping across the screen and a bouncing cursor
pub struct TestPattern {
    frame: u64,
    scanout: Option<FramebufferHandle>,
    bar: Option<Rect>,
    cursor: (i32, i32),
    velocity: (i32, i32),
    shape_sent: bool,
}

impl Default for TestPattern {
    fn default() -> Self {
        Self {
            frame: 0,
            scanout: None,
            bar: None,
            cursor: (0, 0),
            velocity: (3, 2),
            shape_sent: false,
        }
    }
}

impl TestPattern {
    pub fn new() -> Self {
        Self::default()
    }

    fn cursor_shape() -> CursorShape {
        // 8x8 white square with a black border
        let mut pixels = Vec::with_capacity(8 * 8 * 4);
        for y in 0..8 {
            for x in 0..8 {
                let edge = x == 0 || y == 0 || x == 7 || y == 7;
                let rgb = if edge { 0x00 } else { 0xff };
                pixels.extend_from_slice(&[rgb, rgb, rgb, 0xff]);
            }
        }
        CursorShape {
            width: 8,
            height: 8,
            hot_x: 0,
            hot_y: 0,
            stride: 32,
            pixels: pixels.into(),
        }
    }
}

impl FrameSource for TestPattern {
    fn name(&self) -> &'static str {
        "pattern"
    }

    fn render(&mut self, display: &VirtualDisplay) -> Result<()> {
        let (fb, changed) = current_scanout(display, &mut self.scanout)?;
        let bounds = fb.bounds();
        if changed {
            fb.fill_rect(&bounds, BACKGROUND);
            display.mark_dirty(bounds)?;
            self.bar = None;
        }

        let span = bounds.width() as i32 + BAR_WIDTH;
        let x = (self.frame as i32 * 4) % span.max(1) - BAR_WIDTH;
        let bar = Rect::new(x, 0, x + BAR_WIDTH, bounds.height() as i32).intersect(&bounds);
        let mut damage = Vec::with_capacity(2);
        if let Some(old) = self.bar.take() {
            fb.fill_rect(&old, BACKGROUND);
            damage.push(old);
        }
        if !bar.is_empty() {
            fb.fill_rect(&bar, BAR);
            damage.push(bar);
            self.bar = Some(bar);
        }
        display.flush(&damage)?;

        let (w, h) = (bounds.width() as i32, bounds.height() as i32);
        let (mut cx, mut cy) = (self.cursor.0 + self.velocity.0, self.cursor.1 + self.velocity.1);
        if cx < 0 || cx >= w {
            self.velocity.0 = -self.velocity.0;
            cx = cx.clamp(0, (w - 1).max(0));
        }
        if cy < 0 || cy >= h {
            self.velocity.1 = -self.velocity.1;
            cy = cy.clamp(0, (h - 1).max(0));
        }
        self.cursor = (cx, cy);
        let shape = (!self.shape_sent).then(Self::cursor_shape);
        display.update_cursor(self.cursor, shape, true)?;
        self.shape_sent = true;

        self.frame += 1;
        Ok(())
    }
}

const TILE: u32 = 64;

/// Copies an X display into the adapter, marking only the tiles that changed
pub struct X11Capture {
    conn: RustConnection,
    root: Window,
    screen: (u32, u32),
    last: Vec<u8>,
    scanout: Option<FramebufferHandle>,
    pointer: Option<(i32, i32)>,
}

impl X11Capture {
    pub fn connect(name: &str) -> Result<Self> {
        let (conn, screen_num) =
            x11rb::connect(Some(name)).context("failed to connect to X display")?;
        let screen = &conn.setup().roots[screen_num];
        let root = screen.root;
        let size = (
            screen.width_in_pixels as u32,
            screen.height_in_pixels as u32,
        );
        tracing::info!(x_display = name, width = size.0, height = size.1, "X screen");
        Ok(Self {
            conn,
            root,
            screen: size,
            last: Vec::new(),
            scanout: None,
            pointer: None,
        })
    }

    pub fn screen_size(&self) -> (u32, u32) {
        self.screen
    }

    fn capture(&self, width: u32, height: u32) -> Result<Vec<u8>> {
        let image = self
            .conn
            .get_image(
                ImageFormat::Z_PIXMAP,
                self.root,
                0,
                0,
                width as u16,
                height as u16,
                !0,
            )?
            .reply()?;
        if image.data.len() < (width * height * 4) as usize {
            anyhow::bail!("unsupported X image depth {}", image.depth);
        }
        Ok(image.data)
    }

    fn update_pointer(&mut self, display: &VirtualDisplay) -> Result<()> {
        let reply = self.conn.query_pointer(self.root)?.reply()?;
        let pos = (reply.root_x as i32, reply.root_y as i32);
        if self.pointer != Some(pos) {
            display.update_cursor(pos, None, true)?;
            self.pointer = Some(pos);
        }
        Ok(())
    }
}

/// Write one 32-bit BGRX row into `dst` in `format`
fn convert_row(format: PixelFormat, src: &[u8], dst: &mut [u8]) {
    match format {
        PixelFormat::Xrgb8888 => dst.copy_from_slice(src),
        PixelFormat::Argb8888 => {
            for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
                d.copy_from_slice(&[s[0], s[1], s[2], 0xff]);
            }
        }
        PixelFormat::Rgb565 => {
            for (d, s) in dst.chunks_exact_mut(2).zip(src.chunks_exact(4)) {
                let v = (((s[2] as u16) >> 3) << 11) | (((s[1] as u16) >> 2) << 5) | ((s[0] as u16) >> 3);
                d.copy_from_slice(&v.to_le_bytes());
            }
        }
    }
}

/// Tiles of a `width`x`height` area whose bytes differ between `old` and `new`
fn changed_tiles(old: &[u8], new: &[u8], width: u32, height: u32) -> Vec<Rect> {
    let row = width as usize * 4;
    let mut tiles = Vec::new();
    for ty in (0..height).step_by(TILE as usize) {
        for tx in (0..width).step_by(TILE as usize) {
            let tile = Rect::new(
                tx as i32,
                ty as i32,
                (tx + TILE).min(width) as i32,
                (ty + TILE).min(height) as i32,
            );
            let (x0, x1) = (tile.x1 as usize * 4, tile.x2 as usize * 4);
            let differs = (tile.y1..tile.y2).any(|y| {
                let base = y as usize * row;
                old.get(base + x0..base + x1) != new.get(base + x0..base + x1)
            });
            if differs {
                tiles.push(tile);
            }
        }
    }
    tiles
}

impl FrameSource for X11Capture {
    fn name(&self) -> &'static str {
        "x11"
    }

    fn render(&mut self, display: &VirtualDisplay) -> Result<()> {
        let (fb, changed) = current_scanout(display, &mut self.scanout)?;
        let width = self.screen.0.min(fb.mode().width);
        let height = self.screen.1.min(fb.mode().height);
        let data = self.capture(width, height)?;

        let tiles = if changed || self.last.len() != data.len() {
            vec![Rect::from_size(width, height)]
        } else {
            changed_tiles(&self.last, &data, width, height)
        };

        if !tiles.is_empty() {
            let format = fb.format();
            let bpp = format.bytes_per_pixel() as usize;
            let stride = fb.stride() as usize;
            let src_row = width as usize * 4;
            fb.write(|pixels| {
                for tile in &tiles {
                    let (x0, x1) = (tile.x1 as usize, tile.x2 as usize);
                    for y in tile.y1 as usize..tile.y2 as usize {
                        let src = &data[y * src_row + x0 * 4..y * src_row + x1 * 4];
                        let dst = &mut pixels[y * stride + x0 * bpp..y * stride + x1 * bpp];
                        convert_row(format, src, dst);
                    }
                }
            });
            display.flush(&tiles)?;
        }
        self.last = data;

        self.update_pointer(display)
    }
}
