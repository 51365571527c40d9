//! fbtap core library - framebuffer capture and change detection
//!
//! Captures the console screen through DRM/KMS or the legacy fbdev interface and tracks
//! which rows changed between polls, keeping a canonical 32-bit snapshot that a remote
//! display server can forward from.

pub mod capture;
pub mod diff;
pub mod session;

pub use capture::selector::{select_backend, BackendSelector};
pub use capture::{
    BackendKind, BackendPreference, CaptureBackend, CaptureConfig, CaptureError, ErrorClass,
    FormatDescriptor, FrameHandle, ScreenGeometry,
};
pub use diff::{ChangeDetector, ChangeResult, DirtyRect};
pub use session::CaptureSession;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
