//! vdisplay - virtual display adapter with a single user-space consumer
//!
//! Each adapter looks like a monitor output to the host. Its frames, dirty
//! regions and cursor are handed to one bound consumer over a control
//! channel instead of reaching a physical screen.
//!
//! ```text
//! producer ──mark_dirty──▶ Painter ◀──REQUEST_UPDATE / GRAB_PIXELS── consumer
//!                            │
//!                   FramebufferRegistry, CursorState
//! ```

pub mod client;
pub mod config;
pub mod control;
pub mod cursor;
pub mod damage;
pub mod device;
pub mod error;
pub mod host;
pub mod ledger;
pub mod painter;
pub mod platform;
pub mod registry;
pub mod server;
pub mod source;
pub mod viewer;
pub mod wire;

pub use config::DriverConfig;
pub use control::{Access, ControlChannel, Opcode, OpcodeTable, Reply, Request};
pub use damage::Rect;
pub use device::{DeviceManager, Phase, VirtualDisplay};
pub use error::{Error, Result};
pub use painter::{Capabilities, ConnectRequest, ConsumerEvent, ConsumerId, GrabHint, UpdateStatus};
pub use registry::{FramebufferHandle, Mode, PixelFormat};
