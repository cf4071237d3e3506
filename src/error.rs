//! Error taxonomy shared by the adapter, the control channel and the wire codec

use std::fmt;

/// Construction step of a virtual display, reported when `create` fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Step {
    Device,
    Cursor,
    Modeset,
    LegacyCompat,
    Vblank,
    Painter,
    Notify,
    Register,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::Device => "device",
            Step::Cursor => "cursor",
            Step::Modeset => "modeset",
            Step::LegacyCompat => "legacy-compat",
            Step::Vblank => "vblank",
            Step::Painter => "painter",
            Step::Notify => "notify",
            Step::Register => "register",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("allocation failed at {step} step")]
    AllocationFailed { step: Step },
    #[error("registration failed at {step} step: {reason}")]
    RegistrationFailed { step: Step, reason: String },
    #[error("a consumer is already connected")]
    AlreadyConnected,
    #[error("no consumer connected for this channel")]
    NotConnected,
    #[error("no outstanding display-control request")]
    StaleReply,
    #[error("another request is in flight on this binding")]
    Busy,
    #[error("invalid cursor shape: {0}")]
    InvalidCursorShape(&'static str),
    #[error("device is already attached")]
    AlreadyAttached,
    #[error("caller lacks render access")]
    PermissionDenied,
    #[error("device has been unplugged")]
    Unplugged,
    #[error("framebuffer handle is no longer valid")]
    StaleHandle,
    #[error("requested pixel format does not match the scanout buffer")]
    FormatMismatch,
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("display-control request timed out")]
    TimedOut,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("the bound consumer did not negotiate this capability")]
    Unsupported,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Stable code used on the control socket
    pub fn code(&self) -> u8 {
        match self {
            Error::AllocationFailed { .. } => 1,
            Error::RegistrationFailed { .. } => 2,
            Error::AlreadyConnected => 3,
            Error::NotConnected => 4,
            Error::StaleReply => 5,
            Error::Busy => 6,
            Error::InvalidCursorShape(_) => 7,
            Error::AlreadyAttached => 8,
            Error::PermissionDenied => 9,
            Error::Unplugged => 10,
            Error::StaleHandle => 11,
            Error::FormatMismatch => 12,
            Error::InvalidArgument(_) => 13,
            Error::TimedOut => 14,
            Error::Protocol(_) => 15,
            Error::Unsupported => 16,
        }
    }

    /// Rebuild an error received from the peer. Variants with a static reason
    /// lose it on the wire; the message travels separately.
    pub fn from_code(code: u8, message: String) -> Self {
        match code {
            1 => Error::AllocationFailed { step: Step::Device },
            2 => Error::RegistrationFailed {
                step: Step::Register,
                reason: message,
            },
            3 => Error::AlreadyConnected,
            4 => Error::NotConnected,
            5 => Error::StaleReply,
            6 => Error::Busy,
            7 => Error::InvalidCursorShape("rejected by peer"),
            8 => Error::AlreadyAttached,
            9 => Error::PermissionDenied,
            10 => Error::Unplugged,
            11 => Error::StaleHandle,
            12 => Error::FormatMismatch,
            13 => Error::InvalidArgument("rejected by peer"),
            14 => Error::TimedOut,
            16 => Error::Unsupported,
            _ => Error::Protocol(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_roundtrip_for_unit_variants() {
        for err in [
            Error::AlreadyConnected,
            Error::NotConnected,
            Error::StaleReply,
            Error::Busy,
            Error::AlreadyAttached,
            Error::PermissionDenied,
            Error::Unplugged,
            Error::StaleHandle,
            Error::FormatMismatch,
            Error::TimedOut,
            Error::Unsupported,
        ] {
            assert_eq!(Error::from_code(err.code(), String::new()), err);
        }
    }

    #[test]
    fn test_unknown_code_is_protocol_error() {
        let err = Error::from_code(200, "garbage".into());
        assert_eq!(err, Error::Protocol("garbage".into()));
    }

    #[test]
    fn test_step_display() {
        let err = Error::RegistrationFailed {
            step: Step::Modeset,
            reason: "no crtc".into(),
        };
        assert_eq!(err.to_string(), "registration failed at modeset step: no crtc");
    }
}
