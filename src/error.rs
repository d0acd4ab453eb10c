use std::io;
use std::sync::PoisonError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    InvalidHeader,
    ReadError(&'static str, io::Error),
    WriteError(&'static str, io::Error),
    CorruptRecord(String),
    RecordTooLarge { size: usize, limit: usize },
    MutexPoisoned,
    LockError(io::Error),
    Closed,
    InvalidState(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IoError(err)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Error::MutexPoisoned
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::IoError(err) => write!(f, "I/O error: {}", err),
            Error::InvalidHeader => write!(f, "Invalid region header"),
            Error::ReadError(context, err) => write!(f, "Failed to read {}: {}", context, err),
            Error::WriteError(context, err) => write!(f, "Failed to write {}: {}", context, err),
            Error::CorruptRecord(msg) => write!(f, "Corrupt record: {}", msg),
            Error::RecordTooLarge { size, limit } => {
                write!(f, "Record of {} bytes exceeds limit of {} bytes", size, limit)
            }
            Error::MutexPoisoned => write!(f, "Mutex was poisoned"),
            Error::LockError(err) => write!(f, "Lock error: {}", err),
            Error::Closed => write!(f, "Region file is closed"),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::IoError(err)
            | Error::ReadError(_, err)
            | Error::WriteError(_, err)
            | Error::LockError(err) => Some(err),
            _ => None,
        }
    }
}
