use std::{fmt, io, sync::Arc};

/// Result returning Error
pub type Result<T> = std::result::Result<T, Error>;

/// `Error` is the status type shared by every layer of the engine.
///
/// `NonFatal` is a sentinel used by the garbage collector to abort a run
/// without latching the background-error state; everything else latched from
/// a background task suppresses further GC scheduling.
#[derive(Clone, Debug)]
pub enum Error {
    NotFound,
    Corruption(String),
    Io(Arc<io::Error>),
    InvalidArgument(String),
    NotSupported(String),
    NonFatal(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    pub fn is_non_fatal(&self) -> bool {
        matches!(self, Error::NonFatal(_))
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }

    pub(crate) fn io(msg: impl Into<String>) -> Error {
        Error::Io(Arc::new(io::Error::other(msg.into())))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "Key not found"),
            Error::Corruption(err) => write!(f, "Data corruption detected: {err}"),
            Error::Io(err) => write!(f, "IO error: {err}"),
            Error::InvalidArgument(err) => write!(f, "Invalid argument: {err}"),
            Error::NotSupported(err) => write!(f, "Not supported: {err}"),
            Error::NonFatal(err) => write!(f, "Non-fatal: {err}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(Arc::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert!(Error::NotFound.is_not_found());
        assert!(!Error::NotFound.is_non_fatal());
        assert!(Error::NonFatal("skip".into()).is_non_fatal());
        assert!(Error::Corruption("bad crc".into()).is_corruption());

        let e: Error = io::Error::other("boom").into();
        assert!(matches!(e, Error::Io(_)));
    }
}
