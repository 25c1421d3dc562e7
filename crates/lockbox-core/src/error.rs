use thiserror::Error;

pub type LockboxResult<T> = Result<T, LockboxError>;

#[derive(Debug, Error)]
pub enum LockboxError {
    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("resource already exists: {0}")]
    ResourceAlreadyExists(String),

    /// Keystore could not be opened with the supplied password.
    ///
    /// Carries no username: the message must not reveal whether an account exists.
    #[error("bad password")]
    BadPassword,

    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    #[error("index error: {0}")]
    Index(String),

    #[error("invalid name: {0:?}")]
    InvalidName(String),

    #[error("segment too large: cannot grow past {0} bytes")]
    SegmentTooLarge(usize),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LockboxError {
    pub fn crypto(msg: impl Into<String>) -> Self {
        Self::CryptoFailure(msg.into())
    }

    pub fn index(err: impl std::fmt::Display) -> Self {
        Self::Index(err.to_string())
    }

    /// Only storage errors are worth retrying; everything else is deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }

    /// Recover a `LockboxError` that was carried through an `io::Error`
    /// (async readers and `std::io` traits can only report `io::Error`).
    pub fn from_io(err: std::io::Error) -> Self {
        let carries_lockbox = err
            .get_ref()
            .is_some_and(|inner| inner.is::<LockboxError>());
        if !carries_lockbox {
            return Self::Io(err);
        }
        match err.into_inner().map(|inner| inner.downcast::<LockboxError>()) {
            Some(Ok(inner)) => *inner,
            _ => Self::Io(std::io::Error::other("wrapped error lost")),
        }
    }
}

impl From<LockboxError> for std::io::Error {
    fn from(err: LockboxError) -> Self {
        match err {
            LockboxError::Io(e) => e,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}
