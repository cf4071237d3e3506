//! Control socket framing
//!
//! Every message is `[kind: u8][len: u32 LE][payload]`. Request kinds are the
//! opcode values. Requests and replies start their payload with a `u32`
//! sequence number so a blocking request does not hold up the others.
//! Events carry no sequence number.

use crate::control::{Opcode, Request};
use crate::cursor::{CursorShape, CursorSnapshot};
use crate::damage::Rect;
use crate::error::{Error, Result};
use crate::painter::{
    Capabilities, ConnectRequest, ConsumerEvent, Grab, GrabHint, UpdateStatus,
};
use crate::registry::{FramebufferHandle, Mode, PixelFormat};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const REPLY_OK: u8 = 0x80;
pub const REPLY_ERR: u8 = 0x81;
pub const EVENT: u8 = 0x90;

/// Upper bound on a single payload; a full 8192x8192 frame fits
pub const MAX_FRAME_LEN: usize = 256 << 20;

const ZSTD_LEVEL: i32 = 1;

// reply tags
const TAG_CONNECTED: u8 = 0;
const TAG_UPDATE: u8 = 1;
const TAG_PIXELS: u8 = 2;
const TAG_ACK: u8 = 3;

// event tags
const EV_MODE: u8 = 0;
const EV_CURSOR_SET: u8 = 1;
const EV_CURSOR_MOVE: u8 = 2;
const EV_DISPLAY_CONTROL: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u8,
    pub payload: Vec<u8>,
}

/// `None` on a clean end of stream between frames
pub async fn read_frame<R>(r: &mut R) -> io::Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    match r.read_exact(&mut header[..1]).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    r.read_exact(&mut header[1..]).await?;
    let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds limit"),
        ));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(Some(Frame {
        kind: header[0],
        payload,
    }))
}

pub async fn write_frame<W>(w: &mut W, frame: &Frame) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut header = [0u8; 5];
    header[0] = frame.kind;
    header[1..].copy_from_slice(&(frame.payload.len() as u32).to_le_bytes());
    w.write_all(&header).await?;
    w.write_all(&frame.payload).await?;
    w.flush().await
}

/// Little-endian payload builder
#[derive(Debug, Default)]
struct Writer(Vec<u8>);

impl Writer {
    fn u8(&mut self, v: u8) -> &mut Self {
        self.0.push(v);
        self
    }

    fn u32(&mut self, v: u32) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn i32(&mut self, v: i32) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.0.extend_from_slice(v);
        self
    }

    fn mode(&mut self, mode: Mode) -> &mut Self {
        self.u32(mode.width).u32(mode.height).u32(mode.refresh)
    }

    fn rect(&mut self, r: &Rect) -> &mut Self {
        self.i32(r.x1).i32(r.y1).i32(r.x2).i32(r.y2)
    }

    fn finish(&mut self, kind: u8) -> Frame {
        Frame {
            kind,
            payload: std::mem::take(&mut self.0),
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Error::Protocol("truncated payload".into()));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> Result<i32> {
        self.u32().map(|v| v as i32)
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    fn mode(&mut self) -> Result<Mode> {
        Ok(Mode::new(self.u32()?, self.u32()?, self.u32()?))
    }

    fn format(&mut self) -> Result<PixelFormat> {
        let code = self.u32()?;
        PixelFormat::from_fourcc(code)
            .ok_or_else(|| Error::Protocol(format!("unknown pixel format {code:#010x}")))
    }

    fn rect(&mut self) -> Result<Rect> {
        Ok(Rect::new(self.i32()?, self.i32()?, self.i32()?, self.i32()?))
    }

    fn handle(&mut self) -> Result<FramebufferHandle> {
        FramebufferHandle::from_raw(self.u32()?)
            .ok_or_else(|| Error::Protocol("zero framebuffer handle".into()))
    }
}

pub fn encode_request(seq: u32, request: &Request) -> Frame {
    let mut w = Writer::default();
    w.u32(seq);
    match request {
        Request::Connect(req) => {
            w.mode(req.mode)
                .u32(req.format.fourcc())
                .u32(req.capabilities.bits());
        }
        Request::RequestUpdate { timeout } => {
            w.u32(timeout.as_millis().min(u32::MAX as u128) as u32);
        }
        Request::GrabPixels(hint) => {
            w.u32(hint.format.map_or(0, PixelFormat::fourcc))
                .u32(hint.max_rects.map_or(0, |n| n as u32));
        }
        Request::DisplayControlReply(payload) => {
            w.bytes(payload);
        }
        Request::EnableCursorEvents(enabled) => {
            w.u8(*enabled as u8);
        }
    }
    w.finish(request.opcode() as u8)
}

/// The outer error means the sequence number itself could not be read and
/// the stream is no longer trustworthy. The inner one is answered.
pub fn decode_request(frame: &Frame) -> Result<(u32, Result<Request>)> {
    let mut r = Reader::new(&frame.payload);
    let seq = r.u32()?;
    Ok((seq, decode_request_body(frame.kind, &mut r)))
}

fn decode_request_body(kind: u8, r: &mut Reader<'_>) -> Result<Request> {
    let opcode =
        Opcode::from_u8(kind).ok_or_else(|| Error::Protocol(format!("unknown opcode {kind:#04x}")))?;
    Ok(match opcode {
        Opcode::Connect => Request::Connect(ConnectRequest {
            mode: r.mode()?,
            format: r.format()?,
            capabilities: Capabilities::from_bits_truncate(r.u32()?),
        }),
        Opcode::RequestUpdate => Request::RequestUpdate {
            timeout: Duration::from_millis(r.u32()? as u64),
        },
        Opcode::GrabPixels => {
            let format = match r.u32()? {
                0 => None,
                code => Some(
                    PixelFormat::from_fourcc(code)
                        .ok_or_else(|| Error::Protocol(format!("unknown pixel format {code:#010x}")))?,
                ),
            };
            let max_rects = match r.u32()? {
                0 => None,
                n => Some(n as usize),
            };
            Request::GrabPixels(GrabHint { format, max_rects })
        }
        Opcode::DisplayControlReply => Request::DisplayControlReply(r.rest().to_vec()),
        Opcode::EnableCursorEvents => Request::EnableCursorEvents(r.u8()? != 0),
    })
}

/// Pixels of one grab as they travel over the socket: the rects and their
/// rows, tightly packed in rect order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelUpdate {
    pub handle: FramebufferHandle,
    pub mode: Mode,
    pub format: PixelFormat,
    pub stride: u32,
    pub rects: Vec<Rect>,
    pub pixels: Vec<u8>,
}

impl PixelUpdate {
    pub fn from_grab(grab: &Grab) -> Self {
        let fb = grab.framebuffer();
        Self {
            handle: grab.handle(),
            mode: fb.mode(),
            format: fb.format(),
            stride: fb.stride(),
            rects: grab.rects().to_vec(),
            pixels: grab.pixels(),
        }
    }

    fn expected_len(&self) -> usize {
        let bpp = self.format.bytes_per_pixel() as usize;
        self.rects
            .iter()
            .map(|r| r.width() as usize * r.height() as usize * bpp)
            .sum()
    }

    /// Copy every rect into a full frame laid out with `self.stride`
    pub fn apply(&self, frame: &mut [u8]) {
        let bpp = self.format.bytes_per_pixel() as usize;
        let stride = self.stride as usize;
        let mut src = 0;
        for rect in &self.rects {
            let row_len = rect.width() as usize * bpp;
            for y in rect.y1..rect.y2 {
                let dst = y as usize * stride + rect.x1 as usize * bpp;
                if let (Some(to), Some(from)) = (
                    frame.get_mut(dst..dst + row_len),
                    self.pixels.get(src..src + row_len),
                ) {
                    to.copy_from_slice(from);
                }
                src += row_len;
            }
        }
    }
}

/// Reply as seen by the consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Connected,
    Update(UpdateStatus),
    Pixels(PixelUpdate),
    Ack,
}

fn encode_error(seq: u32, err: &Error) -> Frame {
    Writer::default()
        .u32(seq)
        .u8(err.code())
        .bytes(err.to_string().as_bytes())
        .finish(REPLY_ERR)
}

/// Consumes the reply so a grab's busy guard is released once encoded
pub fn encode_response(seq: u32, result: Result<crate::control::Reply>) -> Frame {
    use crate::control::Reply;

    let reply = match result {
        Ok(reply) => reply,
        Err(e) => return encode_error(seq, &e),
    };
    let mut w = Writer::default();
    w.u32(seq);
    match reply {
        Reply::Connected => {
            w.u8(TAG_CONNECTED);
        }
        Reply::Update(status) => {
            let status = match status {
                UpdateStatus::Updated => 0,
                UpdateStatus::NoChange => 1,
                UpdateStatus::Disconnected => 2,
            };
            w.u8(TAG_UPDATE).u8(status);
        }
        Reply::Pixels(grab) => {
            let update = PixelUpdate::from_grab(&grab);
            drop(grab);
            let compressed = match zstd::encode_all(&update.pixels[..], ZSTD_LEVEL) {
                Ok(c) => c,
                Err(e) => return encode_error(seq, &Error::Protocol(e.to_string())),
            };
            w.u8(TAG_PIXELS)
                .u32(update.handle.get())
                .mode(update.mode)
                .u32(update.format.fourcc())
                .u32(update.stride)
                .u32(update.rects.len() as u32);
            for rect in &update.rects {
                w.rect(rect);
            }
            w.bytes(&compressed);
        }
        Reply::Ack => {
            w.u8(TAG_ACK);
        }
    }
    w.finish(REPLY_OK)
}

pub fn encode_event(event: &ConsumerEvent) -> Frame {
    let mut w = Writer::default();
    match event {
        ConsumerEvent::ModeChanged {
            mode,
            format,
            handle,
        } => {
            w.u8(EV_MODE)
                .mode(*mode)
                .u32(format.fourcc())
                .u32(handle.get());
        }
        ConsumerEvent::CursorSet(snap) => {
            w.u8(EV_CURSOR_SET)
                .i32(snap.x)
                .i32(snap.y)
                .u8(snap.visible as u8);
            match &snap.shape {
                Some(shape) => {
                    w.u8(1)
                        .u32(shape.width)
                        .u32(shape.height)
                        .u32(shape.hot_x)
                        .u32(shape.hot_y)
                        .u32(shape.stride)
                        .bytes(&shape.pixels);
                }
                None => {
                    w.u8(0);
                }
            }
        }
        ConsumerEvent::CursorMove { x, y } => {
            w.u8(EV_CURSOR_MOVE).i32(*x).i32(*y);
        }
        ConsumerEvent::DisplayControlRequest(payload) => {
            w.u8(EV_DISPLAY_CONTROL).bytes(payload);
        }
    }
    w.finish(EVENT)
}

/// Anything the server sends to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Response { seq: u32, result: Result<Response> },
    Event(ConsumerEvent),
}

pub fn decode_server_message(frame: &Frame) -> Result<ServerMessage> {
    let mut r = Reader::new(&frame.payload);
    match frame.kind {
        REPLY_OK => {
            let seq = r.u32()?;
            Ok(ServerMessage::Response {
                seq,
                result: Ok(decode_response(&mut r)?),
            })
        }
        REPLY_ERR => {
            let seq = r.u32()?;
            let code = r.u8()?;
            let message = String::from_utf8_lossy(r.rest()).into_owned();
            Ok(ServerMessage::Response {
                seq,
                result: Err(Error::from_code(code, message)),
            })
        }
        EVENT => decode_event(&mut r).map(ServerMessage::Event),
        kind => Err(Error::Protocol(format!("unexpected frame kind {kind:#04x}"))),
    }
}

fn decode_response(r: &mut Reader<'_>) -> Result<Response> {
    Ok(match r.u8()? {
        TAG_CONNECTED => Response::Connected,
        TAG_UPDATE => Response::Update(match r.u8()? {
            0 => UpdateStatus::Updated,
            1 => UpdateStatus::NoChange,
            2 => UpdateStatus::Disconnected,
            s => return Err(Error::Protocol(format!("unknown update status {s}"))),
        }),
        TAG_PIXELS => {
            let handle = r.handle()?;
            let mode = r.mode()?;
            mode.validate()
                .map_err(|e| Error::Protocol(format!("bad mode {mode}: {e}")))?;
            let format = r.format()?;
            let stride = r.u32()?;
            if stride < mode.width * format.bytes_per_pixel() {
                return Err(Error::Protocol(format!("stride {stride} too small for {mode}")));
            }
            let count = r.u32()? as usize;
            let bounds = mode.bounds();
            let mut rects = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                let rect = r.rect()?;
                if rect.is_empty() || !bounds.contains(&rect) {
                    return Err(Error::Protocol(format!("rect {rect:?} outside {mode}")));
                }
                rects.push(rect);
            }
            let pixels = zstd::decode_all(r.rest()).map_err(|e| Error::Protocol(e.to_string()))?;
            let update = PixelUpdate {
                handle,
                mode,
                format,
                stride,
                rects,
                pixels,
            };
            if update.pixels.len() != update.expected_len() {
                return Err(Error::Protocol(format!(
                    "pixel payload is {} bytes, rects need {}",
                    update.pixels.len(),
                    update.expected_len()
                )));
            }
            Response::Pixels(update)
        }
        TAG_ACK => Response::Ack,
        tag => return Err(Error::Protocol(format!("unknown reply tag {tag}"))),
    })
}

fn decode_event(r: &mut Reader<'_>) -> Result<ConsumerEvent> {
    Ok(match r.u8()? {
        EV_MODE => ConsumerEvent::ModeChanged {
            mode: r.mode()?,
            format: r.format()?,
            handle: r.handle()?,
        },
        EV_CURSOR_SET => {
            let x = r.i32()?;
            let y = r.i32()?;
            let visible = r.u8()? != 0;
            let shape = match r.u8()? {
                0 => None,
                _ => Some(CursorShape {
                    width: r.u32()?,
                    height: r.u32()?,
                    hot_x: r.u32()?,
                    hot_y: r.u32()?,
                    stride: r.u32()?,
                    pixels: r.rest().into(),
                }),
            };
            ConsumerEvent::CursorSet(CursorSnapshot {
                x,
                y,
                visible,
                shape,
            })
        }
        EV_CURSOR_MOVE => ConsumerEvent::CursorMove {
            x: r.i32()?,
            y: r.i32()?,
        },
        EV_DISPLAY_CONTROL => ConsumerEvent::DisplayControlRequest(r.rest().to_vec()),
        tag => return Err(Error::Protocol(format!("unknown event tag {tag}"))),
    })
}
