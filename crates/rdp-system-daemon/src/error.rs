/// §7 error taxonomy, as seen by the system daemon.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("cancelled: {0}")]
    Cancelled(String),
    #[error("{0}")]
    Failed(String),
}

impl From<DaemonError> for zbus::fdo::Error {
    fn from(err: DaemonError) -> Self {
        match err {
            DaemonError::InvalidArgument(msg) => zbus::fdo::Error::InvalidArgs(msg),
            DaemonError::NotSupported(msg) => zbus::fdo::Error::NotSupported(msg),
            DaemonError::PermissionDenied(msg) => zbus::fdo::Error::AccessDenied(msg),
            DaemonError::Cancelled(msg) => zbus::fdo::Error::Failed(format!("cancelled: {msg}")),
            DaemonError::Failed(msg) => zbus::fdo::Error::Failed(msg),
        }
    }
}
