use std::io;

use thiserror::Error;

use super::superblock::Compressor;

/// Errors produced while reading or writing SquashFS meta-data and file content.
///
/// Reaching the end of a directory is not an error; [`readdir`] reports it as `Ok(None)`.
///
/// [`readdir`]: super::MetaReader::readdir
#[derive(Debug, Error)]
pub enum Error {
    /// A seek or read targeted a location outside the reader's window, or past the end of a
    /// decoded block.
    #[error("position {position} is outside of [{start}, {limit})")]
    OutOfBounds { position: u64, start: u64, limit: u64 },

    /// On-disk data that cannot be valid: oversized headers, unknown tags, record overruns.
    #[error("corrupt image: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(io::Error),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("compressor {0:?} is not supported by this build")]
    Unsupported(Compressor),

    #[error("failed to allocate block buffer")]
    Allocation,

    #[error("inode is not a directory")]
    NotDirectory,

    #[error("inode is not a regular file")]
    NotFile,

    #[error("meta writer does not keep blocks in memory")]
    NotInMemory,

    /// The output could not be pre-sized or a hole could not be skipped over.
    #[error("cannot create sparse output: {0}")]
    SparseOutput(io::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn corrupt<S: Into<String>>(msg: S) -> Self {
        Error::Corrupt(msg.into())
    }
}

// Record decoders read through `io::Read`, so crate errors raised inside a meta-data reader come
// back wrapped in an io::Error. Unwrap them to keep the original variant.
impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if !e.get_ref().is_some_and(|inner| inner.is::<Error>()) {
            return Error::Io(e);
        }
        match e.into_inner().map(|inner| inner.downcast::<Error>()) {
            Some(Ok(inner)) => *inner,
            Some(Err(inner)) => Error::Io(io::Error::new(io::ErrorKind::Other, inner)),
            None => Error::Io(io::Error::from(io::ErrorKind::Other)),
        }
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Io(e) => e,
            Error::OutOfBounds { .. } => io::Error::new(io::ErrorKind::UnexpectedEof, e),
            Error::Corrupt(_) | Error::Compression(_) => io::Error::new(io::ErrorKind::InvalidData, e),
            Error::Unsupported(_) => io::Error::new(io::ErrorKind::Unsupported, e),
            Error::Allocation => io::Error::new(io::ErrorKind::OutOfMemory, e),
            Error::NotDirectory | Error::NotFile | Error::NotInMemory => io::Error::new(io::ErrorKind::InvalidInput, e),
            Error::SparseOutput(inner) => inner,
            Error::NotFound(_) => io::Error::new(io::ErrorKind::NotFound, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_conversion() {
        let e: io::Error = Error::corrupt("bad header").into();
        assert_eq!(e.kind(), io::ErrorKind::InvalidData);

        let e: io::Error = Error::OutOfBounds { position: 10, start: 0, limit: 4 }.into();
        assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof);

        let e: io::Error = Error::Io(io::Error::from(io::ErrorKind::BrokenPipe)).into();
        assert_eq!(e.kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn test_nested_error_survives() {
        let wrapped: io::Error = Error::OutOfBounds { position: 8, start: 0, limit: 4 }.into();
        assert!(matches!(Error::from(wrapped), Error::OutOfBounds { position: 8, .. }));

        let plain = io::Error::from(io::ErrorKind::UnexpectedEof);
        assert!(matches!(Error::from(plain), Error::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof));
    }
}
