//! Thin lifecycle wrapper around `X11Injector`, mirroring
//! `drd_input_dispatcher.c`'s delegation to the X11 backend.

use crate::error::InputError;
use crate::injector::X11Injector;
use crate::x11_connection::X11Connection;

pub struct InputDispatcher<C: X11Connection> {
    injector: Option<X11Injector<C>>,
}

impl<C: X11Connection> InputDispatcher<C> {
    pub fn new() -> Self {
        Self { injector: None }
    }

    pub fn start(&mut self, conn: C) {
        self.injector = Some(X11Injector::new(conn));
    }

    pub fn stop(&mut self) {
        self.injector = None;
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.injector.is_some()
    }

    pub fn update_desktop_size(
        &mut self,
        stream_width: u32,
        stream_height: u32,
        desktop_width: u32,
        desktop_height: u32,
    ) -> Result<(), InputError> {
        let injector = self.injector.as_mut().ok_or(InputError::NotRunning)?;
        injector.update_desktop_size(stream_width, stream_height, desktop_width, desktop_height);
        Ok(())
    }

    pub fn handle_keyboard(&mut self, scancode: u8, extended: bool, down: bool) -> Result<(), InputError> {
        self.injector.as_mut().ok_or(InputError::NotRunning)?.handle_keyboard(scancode, extended, down)
    }

    pub fn handle_unicode(&mut self, codepoint: u32, down: bool) -> Result<(), InputError> {
        self.injector.as_mut().ok_or(InputError::NotRunning)?.handle_unicode(codepoint, down)
    }

    pub fn handle_pointer(&mut self, flags: u16, x: u16, y: u16) -> Result<(), InputError> {
        self.injector.as_mut().ok_or(InputError::NotRunning)?.handle_pointer(flags, x, y)
    }

    pub fn handle_pointer_wheel(&mut self, flags: u16) -> Result<(), InputError> {
        self.injector.as_mut().ok_or(InputError::NotRunning)?.handle_pointer_wheel(flags)
    }

    pub fn flush(&self) -> Result<(), InputError> {
        self.injector.as_ref().ok_or(InputError::NotRunning)?.flush()
    }
}

impl<C: X11Connection> Default for InputDispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::injector::PTR_FLAGS_BUTTON1;
    use crate::x11_connection::tests::FakeConnection;

    #[test]
    fn calls_before_start_report_not_running() {
        let mut dispatcher: InputDispatcher<FakeConnection> = InputDispatcher::new();
        assert!(matches!(
            dispatcher.handle_pointer(PTR_FLAGS_BUTTON1, 0, 0),
            Err(InputError::NotRunning)
        ));
    }

    #[test]
    fn start_then_stop_toggles_running_state() {
        let mut dispatcher: InputDispatcher<FakeConnection> = InputDispatcher::new();
        dispatcher.start(FakeConnection::default());
        assert!(dispatcher.is_running());
        dispatcher.update_desktop_size(1920, 1080, 1920, 1080).unwrap();
        dispatcher.stop();
        assert!(!dispatcher.is_running());
    }
}
