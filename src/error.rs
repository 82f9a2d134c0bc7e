use std::{error, fmt, io};

/// Error returned by processor submission operations, or an `io::Error` that
/// occurred while driving a channel.
#[derive(Debug)]
pub enum Error {
    /// The processor has already been shut down
    Shutdown,
    /// I/O level error
    Io(io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Error::Shutdown => write!(fmt, "processor already shut down"),
            Error::Io(ref e) => fmt::Display::fmt(e, fmt),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::Shutdown => None,
            Error::Io(ref e) => Some(e),
        }
    }
}

impl From<io::Error> for Error {
    fn from(src: io::Error) -> Error {
        Error::Io(src)
    }
}
