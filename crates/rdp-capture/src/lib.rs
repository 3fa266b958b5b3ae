// Screen capture abstraction.
//
// - capture.rs:     CaptureSource trait + StaticCaptureSource test double
// - x11_capture.rs: live X11 capture via XGetImage
// - frame.rs:       Frame / EncodedFrame carriers
// - queue.rs:       FrameQueue producer/consumer ring
// - error.rs:       CaptureError

pub mod capture;
pub mod error;
pub mod frame;
pub mod queue;
pub mod x11_capture;

pub use capture::{CaptureSource, StaticCaptureSource};
pub use error::CaptureError;
pub use frame::{EncodedFrame, Frame, FrameCodec, SharedFrame};
pub use queue::FrameQueue;
pub use x11_capture::X11CaptureSource;
