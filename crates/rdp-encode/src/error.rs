use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("encoder not configured")]
    NotConfigured,
    #[error("encode failed: {0}")]
    Failed(String),
}
