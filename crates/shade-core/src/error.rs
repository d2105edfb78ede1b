/// Error taxonomy returned at every internal boundary of the daemon.
///
/// Device-native return codes are not part of this taxonomy; they travel
/// inside the API context and are forwarded verbatim to the client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ShadeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotExist(String),

    #[error("already exists: {0}")]
    AlreadyExist(String),

    #[error("mock address range drained: requested {requested} bytes, {remaining} left")]
    Drain { requested: u64, remaining: u64 },

    #[error("not ready: {0}")]
    NotReady(String),

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("{0}")]
    Failed(String),
}

impl From<std::io::Error> for ShadeError {
    fn from(e: std::io::Error) -> Self {
        ShadeError::Failed(format!("io error: {e}"))
    }
}

pub type ShadeResult<T> = Result<T, ShadeError>;
