use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClipError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("format error: {0}")]
    Format(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("decompress error: {0}")]
    Decompress(String),

    #[error("auth error: {0}")]
    Auth(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

pub type Result<T> = std::result::Result<T, ClipError>;

impl ClipError {
    /// Maps the error onto the errno the FUSE layer reports for it.
    pub fn errno(&self) -> i32 {
        match self {
            ClipError::NotFound(_) => libc::ENOENT,
            ClipError::Unsupported(_) => libc::EROFS,
            _ => libc::EIO,
        }
    }
}
