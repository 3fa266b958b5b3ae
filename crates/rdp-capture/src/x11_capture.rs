//! Live X11 capture via `XGetImage` (through `x11rb`'s `get_image` request).
//!
//! XTest injection and capture both call into X11 directly; that's the part
//! out of scope per this repo's charter. What's in scope is driving the
//! request on a timer and handing back a [`Frame`] in the BGRA layout the
//! encoders expect.

use x11rb::connection::Connection;
use x11rb::protocol::xproto::{ConnectionExt as _, ImageFormat};
use x11rb::rust_connection::RustConnection;

use crate::capture::{now_us, CaptureSource};
use crate::error::CaptureError;
use crate::frame::Frame;

/// Captures the full root window of an X11 screen.
pub struct X11CaptureSource {
    conn: RustConnection,
    root: u32,
    width: u16,
    height: u16,
}

impl X11CaptureSource {
    /// Connects to the display named by `display_name` (`None` uses `$DISPLAY`)
    /// and captures the root window of its default screen.
    pub fn connect(display_name: Option<&str>) -> Result<Self, CaptureError> {
        let (conn, screen_num) = x11rb::connect(display_name)
            .map_err(|e| CaptureError::Unavailable(e.to_string()))?;
        let screen = conn
            .setup()
            .roots
            .get(screen_num)
            .ok_or_else(|| CaptureError::Unavailable("no such X11 screen".into()))?
            .clone();
        Ok(Self {
            conn,
            root: screen.root,
            width: screen.width_in_pixels,
            height: screen.height_in_pixels,
        })
    }
}

impl CaptureSource for X11CaptureSource {
    fn capture(&mut self) -> Result<Frame, CaptureError> {
        if self.width == 0 || self.height == 0 {
            return Err(CaptureError::InvalidArgument(
                "screen has zero extent".into(),
            ));
        }

        let reply = self
            .conn
            .get_image(
                ImageFormat::Z_PIXMAP,
                self.root,
                0,
                0,
                self.width,
                self.height,
                !0,
            )
            .map_err(|e| CaptureError::Failed(e.to_string()))?
            .reply()
            .map_err(|e| CaptureError::Failed(e.to_string()))?;

        let width = u32::from(self.width);
        let height = u32::from(self.height);
        let stride = width * 4;
        let expected = (stride * height) as usize;
        if reply.data.len() < expected {
            return Err(CaptureError::Failed(format!(
                "short image reply: got {} bytes, wanted {}",
                reply.data.len(),
                expected
            )));
        }

        let mut frame = Frame::new();
        frame.fill_payload(expected, |buf| {
            buf.copy_from_slice(&reply.data[..expected]);
            true
        });
        frame.set_metadata(width, height, stride, now_us());
        Ok(frame)
    }

    fn geometry(&self) -> Option<(u32, u32)> {
        Some((u32::from(self.width), u32::from(self.height)))
    }
}
