use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    #[error("storage device I/O failed")]
    Io,
    #[error("address outside of the storage device")]
    OutOfBounds,
    #[error("geometry does not fit the storage device")]
    InvalidGeometry,
    #[error("filesystem is in lockdown")]
    Lockdown,
    #[error("timed out waiting for the filesystem")]
    Timeout,
    #[error("file already exists")]
    AlreadyExists,
    #[error("no free directory slot")]
    DirectoryFull,
    #[error("not enough contiguous free pages")]
    OutOfSpace,
    #[error("a file must span at least one page")]
    EmptyFile,
    #[error("access denied for this privilege tier")]
    PermissionDenied,
    #[error("handle is not open")]
    InvalidHandle,
}

pub type Result<T> = core::result::Result<T, FsError>;
