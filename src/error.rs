//! Error types used by multiple modules.
//!
//! There are two error types that are used widely within the certward
//! library.
//!
//! The most important is [`Failed`]. This error indicates that an
//! operation had to be canceled for some reason and callers can assume
//! that all diagnostic information has been logged and they need not do
//! anything further.
//!
//! Secondly, [`ExitError`] is used when the program should be terminated. It
//! provides enough information to determine the exit code of the program.

use std::{fmt, io};


//------------ Failed --------------------------------------------------------

/// An operation has failed to complete.
///
/// This error type is used to indicate that an operation has failed,
/// diagnostic information has been printed or logged, and the caller can’t
/// really do anything to recover.
#[derive(Clone, Copy, Debug)]
pub struct Failed;

impl fmt::Display for Failed {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("operation failed")
    }
}

impl std::error::Error for Failed { }

impl From<io::Error> for Failed {
    fn from(_: io::Error) -> Failed {
        Failed
    }
}


//------------ ExitError -----------------------------------------------------

/// An error happened that should lead to terminating the program.
#[derive(Clone, Copy, Debug)]
pub enum ExitError {
    /// Something has happened.
    ///
    /// This should be exit status 1.
    Generic,

    /// A chain given to the `check` command did not validate.
    ///
    /// This should be exit status 2.
    Invalid,
}

impl From<Failed> for ExitError {
    fn from(_: Failed) -> ExitError {
        ExitError::Generic
    }
}
