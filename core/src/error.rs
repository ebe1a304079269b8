use thiserror::Error;

#[derive(Debug, Error)]
pub enum I30Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Name too long: {0} units (maximum {1})")]
    NameTooLong(usize, usize),

    #[error("Not found")]
    NotFound,

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Index corrupt: {0}")]
    Corrupt(String),

    #[error("Not a directory")]
    NotADirectory,

    #[error("Is a directory")]
    IsADirectory,

    #[error("Directory not empty")]
    NotEmpty,

    #[error("Out of space: {0}")]
    OutOfSpace(String),

    #[error("Not supported: {0}")]
    NotSupported(String),

    #[error("Metadata inconsistent, manual repair required: {0}")]
    Inconsistent(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
