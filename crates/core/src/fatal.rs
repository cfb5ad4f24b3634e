//! Process termination for unrecoverable failures.
//!
//! Library crates return `Result`s; the application decides which failures
//! end the process. Anything routed through [`OrFatal`] is logged with the
//! failing operation and the caller's source location, then the process
//! exits with status 1. There is no way to intercept it.

use std::fmt::Display;
use std::panic::Location;

/// Exit code used for every fatal termination.
pub const FATAL_EXIT_CODE: i32 = 1;

/// Log a fatal diagnostic and terminate the process.
#[track_caller]
pub fn fatal(operation: &str, cause: &dyn Display) -> ! {
    let location = Location::caller();
    tracing::error!(
        "fatal: {} failed at {}:{}: {}",
        operation,
        location.file(),
        location.line(),
        cause
    );
    std::process::exit(FATAL_EXIT_CODE)
}

/// Unwrap-or-terminate for results at the application boundary.
pub trait OrFatal<T> {
    /// Return the success value, or terminate via [`fatal`] naming `operation`.
    fn or_fatal(self, operation: &str) -> T;
}

impl<T, E: Display> OrFatal<T> for std::result::Result<T, E> {
    #[track_caller]
    fn or_fatal(self, operation: &str) -> T {
        match self {
            Ok(value) => value,
            Err(e) => fatal(operation, &e),
        }
    }
}
