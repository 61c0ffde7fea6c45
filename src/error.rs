use thiserror::Error;

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        $crate::Error::Malformed {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        $crate::Error::Malformed {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic error type covering every failure this library can surface.
///
/// Variants fall into four groups: input parsing failures (`Malformed`,
/// `OutOfBounds`, `NotSupported`, `Empty`), lookup failures
/// (`InvalidPoolIndex`), consistency failures detected during decode or
/// serialization (`PoolSizeMismatch`, `RestrictionViolation`, `PoolFixed`,
/// `WrongArrayLength`), and wrapped environment errors (`FileError`,
/// `LockFailed`).
///
/// # Examples
///
/// ```rust,no_run
/// use skillrt::{Error, SkillState};
/// use std::path::Path;
///
/// match SkillState::open(Path::new("graph.sf")) {
///     Ok(state) => println!("{} pools", state.types().count()),
///     Err(Error::NotSupported) => eprintln!("not a SKilL file"),
///     Err(Error::Malformed { message, file, line }) => {
///         eprintln!("corrupt file: {} ({}:{})", message, file, line);
///     }
///     Err(e) => eprintln!("error: {}", e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The file is damaged and could not be parsed.
    ///
    /// The error carries the source location where the malformation was
    /// detected for debugging purposes.
    #[error("Malformed - {file}:{line}: {message}")]
    Malformed {
        /// Description of what was malformed
        message: String,
        /// Source file in which this error was raised
        file: &'static str,
        /// Source line in which this error was raised
        line: u32,
    },

    /// An out of bound access was attempted while reading a mapped region.
    #[error("Out of bound read would have occurred!")]
    OutOfBounds,

    /// The input is not a SKilL file of a supported version.
    #[error("This file type is not supported")]
    NotSupported,

    /// Provided input was empty.
    #[error("Provided input was empty")]
    Empty,

    /// An ID or string index was outside the valid range of its pool.
    #[error("Invalid index {index} into pool '{pool}' of size {size}")]
    InvalidPoolIndex {
        /// The index that was requested
        index: i64,
        /// The number of valid entries in the pool
        size: usize,
        /// The name of the pool that was accessed
        pool: String,
    },

    /// A field chunk's declared byte range did not match what its decoder
    /// consumed, either because the data ran short or bytes were left over.
    #[error("Chunk {chunk} of field '{field}' did not match its declared size (position {position} in [{begin}, {end}))")]
    PoolSizeMismatch {
        /// Index of the chunk within the field's chunk list
        chunk: usize,
        /// Reader position when the mismatch was detected
        position: u64,
        /// Absolute begin of the chunk's file range
        begin: u64,
        /// Absolute end of the chunk's file range
        end: u64,
        /// Name of the affected field
        field: String,
    },

    /// A field restriction rejected a value.
    #[error("Restriction check failed on field '{field}': {reason}")]
    RestrictionViolation {
        /// Name of the field whose restriction failed
        field: String,
        /// What the restriction rejected
        reason: String,
    },

    /// A structural mutation was attempted while the pool was fixed.
    #[error("Pool '{0}' can not be modified while it is fixed")]
    PoolFixed(String),

    /// A constant-length array value had the wrong number of elements.
    #[error("Constant length array expects {expected} elements, got {actual}")]
    WrongArrayLength {
        /// The length baked into the field type
        expected: u64,
        /// The length of the rejected value
        actual: u64,
    },

    /// The state has no backing file to append to.
    #[error("Can not append: the state has no backing file")]
    NoBackingFile,

    /// File I/O error from the stream layer, wrapped.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Failed to lock an internal synchronization target.
    #[error("Failed to lock target")]
    LockFailed,

    /// Generic error for miscellaneous internal failures.
    #[error("{0}")]
    Internal(String),
}
