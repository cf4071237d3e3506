//! Window consumer
//!
//! Binds to a served adapter, keeps a local copy of the frame, applies every
//! grabbed rect to it and draws the cursor on top.

use crate::client::Consumer;
use crate::cursor::CursorSnapshot;
use crate::painter::{Capabilities, ConsumerEvent, GrabHint, UpdateStatus};
use crate::registry::{Mode, PixelFormat};
use crate::wire::PixelUpdate;
use anyhow::{Context, Result};
use minifb::{Key, Window, WindowOptions};
use std::path::Path;
use std::time::Duration;

const POLL: Duration = Duration::from_millis(16);

/// 0RGB value of one pixel as stored in a buffer of `format`
fn to_0rgb(format: PixelFormat, px: &[u8]) -> u32 {
    match format {
        PixelFormat::Xrgb8888 | PixelFormat::Argb8888 => {
            u32::from_le_bytes([px[0], px[1], px[2], 0])
        }
        PixelFormat::Rgb565 => {
            let v = u16::from_le_bytes([px[0], px[1]]) as u32;
            let r = (v >> 11) & 0x1f;
            let g = (v >> 5) & 0x3f;
            let b = v & 0x1f;
            ((r << 3 | r >> 2) << 16) | ((g << 2 | g >> 4) << 8) | (b << 3 | b >> 2)
        }
    }
}

/// Local mirror of the adapter's scanout buffer
#[derive(Debug, Clone)]
pub struct Canvas {
    mode: Mode,
    format: PixelFormat,
    stride: u32,
    frame: Vec<u8>,
    cursor: Option<CursorSnapshot>,
}

impl Canvas {
    pub fn new(mode: Mode, format: PixelFormat) -> Self {
        let stride = mode.width * format.bytes_per_pixel();
        Self {
            mode,
            format,
            stride,
            frame: vec![0; (stride * mode.height) as usize],
            cursor: None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn apply(&mut self, update: &PixelUpdate) {
        if update.mode != self.mode || update.format != self.format || update.stride != self.stride
        {
            tracing::debug!(mode = %update.mode, "canvas resized");
            self.mode = update.mode;
            self.format = update.format;
            self.stride = update.stride;
            self.frame = vec![0; (update.stride * update.mode.height) as usize];
        }
        update.apply(&mut self.frame);
    }

    pub fn on_event(&mut self, event: &ConsumerEvent) {
        match event {
            ConsumerEvent::CursorSet(snap) => self.cursor = Some(snap.clone()),
            ConsumerEvent::CursorMove { x, y } => {
                if let Some(cursor) = &mut self.cursor {
                    cursor.x = *x;
                    cursor.y = *y;
                }
            }
            _ => {}
        }
    }

    /// Compose frame and cursor into a 0RGB window buffer
    pub fn render(&self, out: &mut Vec<u32>) {
        let (w, h) = (self.mode.width as usize, self.mode.height as usize);
        let bpp = self.format.bytes_per_pixel() as usize;
        let stride = self.stride as usize;
        out.clear();
        out.reserve(w * h);
        for y in 0..h {
            let row = &self.frame[y * stride..y * stride + w * bpp];
            out.extend(row.chunks_exact(bpp).map(|px| to_0rgb(self.format, px)));
        }

        let Some(cursor) = &self.cursor else {
            return;
        };
        let Some(shape) = cursor.shape.as_ref().filter(|_| cursor.visible) else {
            return;
        };
        let stride = shape.stride as usize;
        for sy in 0..shape.height as i32 {
            let dy = cursor.y - shape.hot_y as i32 + sy;
            if dy < 0 || dy >= h as i32 {
                continue;
            }
            for sx in 0..shape.width as i32 {
                let dx = cursor.x - shape.hot_x as i32 + sx;
                if dx < 0 || dx >= w as i32 {
                    continue;
                }
                let idx = sy as usize * stride + sx as usize * 4;
                let Some(px) = shape.pixels.get(idx..idx + 4) else {
                    continue;
                };
                // cursor images are ARGB; skip transparent pixels
                if px[3] != 0 {
                    out[dy as usize * w + dx as usize] = to_0rgb(PixelFormat::Argb8888, px);
                }
            }
        }
    }
}

pub async fn run_viewer(socket: &Path, mode: Mode) -> Result<()> {
    let consumer = Consumer::connect(socket).await?;
    consumer
        .bind(mode, PixelFormat::Xrgb8888, Capabilities::CURSOR_EVENTS)
        .await
        .context("failed to bind to the display")?;
    consumer.enable_cursor_events(true).await?;
    tracing::info!(%mode, socket = %socket.display(), "viewer bound");

    let mut window = Window::new(
        &format!("vdisplay - {}x{}", mode.width, mode.height),
        mode.width as usize,
        mode.height as usize,
        WindowOptions {
            resize: true,
            scale: minifb::Scale::X1,
            ..Default::default()
        },
    )
    .context("failed to create window")?;
    window.set_target_fps(60);

    let mut canvas = Canvas::new(mode, PixelFormat::Xrgb8888);
    let mut buffer = Vec::new();
    let mut frames = 0u64;

    while window.is_open() && !window.is_key_down(Key::Escape) {
        // bound without DISPLAY_CONTROL, so only cursor and mode events arrive
        while let Some(event) = consumer.try_next_event() {
            canvas.on_event(&event);
        }

        match consumer.request_update(POLL).await? {
            UpdateStatus::Updated => {
                let update = consumer.grab(GrabHint::default()).await?;
                canvas.apply(&update);
                frames += 1;
                if frames.is_multiple_of(300) {
                    tracing::debug!(frames, rects = update.rects.len(), "frames received");
                }
            }
            UpdateStatus::NoChange => {}
            UpdateStatus::Disconnected => {
                tracing::info!("binding ended by the display");
                break;
            }
        }

        canvas.render(&mut buffer);
        let m = canvas.mode();
        window.update_with_buffer(&buffer, m.width as usize, m.height as usize)?;
    }

    tracing::info!(frames, "viewer closed");
    Ok(())
}
