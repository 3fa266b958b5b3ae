// X11/XTest input injection for the RDP server.
//
// - keymap.rs:         XT scancode / Unicode codepoint -> X11 keysym tables
// - x11_connection.rs: X11Connection trait + x11rb-backed XTest implementation
// - injector.rs:        X11Injector (keycode cache, pointer scaling, button remap)
// - dispatcher.rs:      InputDispatcher lifecycle wrapper
// - error.rs:           InputError

pub mod dispatcher;
pub mod error;
pub mod injector;
pub mod keymap;
pub mod x11_connection;

pub use dispatcher::InputDispatcher;
pub use error::InputError;
pub use injector::X11Injector;
pub use x11_connection::{X11Connection, X11rbConnection};
