//! Fatal-path reporting.
//!
//! Per the error-handling design, this crate has no recoverable error
//! channel: every operation's only runtime-surfaced status is a
//! success/not-found flag. Configuration mistakes (bad `item_type`,
//! mismatched set item tags), SMR registry exhaustion, and allocator
//! exhaustion are all programmer/environment errors and are fatal.

/// Log `msg` and abort the process.
///
/// Aborting (rather than panicking) matches the "no exceptions" contract:
/// a caller holding a bucket CAS in flight on another thread must not be
/// allowed to observe a half-unwound stack.
#[cold]
#[track_caller]
pub fn fatal(msg: &str) -> ! {
    tracing::error!(location = %std::panic::Location::caller(), "{msg}");
    std::process::abort()
}

/// Like [`fatal`], but formats its arguments first.
macro_rules! fatal {
    ($($arg:tt)*) => {
        $crate::error::fatal(&format!($($arg)*))
    };
}

pub(crate) use fatal;
