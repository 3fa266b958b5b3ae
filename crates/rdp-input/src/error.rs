use thiserror::Error;

#[derive(Debug, Error)]
pub enum InputError {
    #[error("not running")]
    NotRunning,
    #[error("X11 connection failed: {0}")]
    ConnectionFailed(String),
    #[error("X11 XTest extension not available")]
    XTestUnavailable,
}
