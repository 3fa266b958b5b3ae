use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("capture backend unavailable: {0}")]
    Unavailable(String),
    #[error("capture failed: {0}")]
    Failed(String),
}
