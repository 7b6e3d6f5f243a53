use std::fmt::Display;

/// emberdb errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Invalid stored data: bad checksum, bad varint, bad footer magic,
    /// missing table files.
    Corruption(String),
    /// Invalid caller input, typically option or key validation.
    InvalidArgument(String),
    /// An IO error.
    Io(String),
    /// The database directory has no CURRENT file and `create_if_missing`
    /// is unset.
    DbMissing,
    /// The database exists and `error_if_exists` is set.
    DbExists,
    /// The database has been closed; no further operations are served.
    DbClosed,
    /// A write batch failed structural validation during log replay.
    BatchCorruption,
    /// A log record was cut short by a crash. Recovery truncates at this
    /// point; the variant never escapes the public API.
    IncompleteRecord,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
            Error::DbMissing => write!(f, "database missing"),
            Error::DbExists => write!(f, "database already exists"),
            Error::DbClosed => write!(f, "database closed"),
            Error::BatchCorruption => write!(f, "corrupt write batch"),
            Error::IncompleteRecord => write!(f, "incomplete log record"),
        }
    }
}

/// Constructs an Error::Corruption from a format string.
#[macro_export]
macro_rules! corrupt {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)) };
}

/// An emberdb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::Io(err.to_string())
    }
}
