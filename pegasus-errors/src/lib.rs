//! Shared error taxonomy for the Pegasus control plane (spec §7).
//!
//! Each crate in the workspace owns the `thiserror` enum for the errors it can
//! produce (`CodecError`, `SwitchError`, `ConfigError`, ...). This crate holds
//! only the cross-cutting pieces: the `InvariantViolation` panic macros, used
//! wherever the spec calls for "panics; unrecoverable, indicates a
//! programming bug" rather than a `Result` the caller is expected to handle.

/// Panics with a formatted message if `cond` is false.
///
/// Used for conditions the spec classifies as [`InvariantViolation`]: bugs in
/// this program, not recoverable error conditions from the outside world.
#[macro_export]
macro_rules! invariant {
    ($cond:expr) => {
        if !$cond {
            panic!("invariant violation: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            panic!("invariant violation: {}", format!($($arg)+));
        }
    };
}

/// Like [`invariant!`] but compares two values for equality, including both
/// in the panic message.
#[macro_export]
macro_rules! invariant_eq {
    ($left:expr, $right:expr) => {
        match (&$left, &$right) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    panic!(
                        "invariant violation: {} != {} ({:?} != {:?})",
                        stringify!($left),
                        stringify!($right),
                        left_val,
                        right_val
                    );
                }
            }
        }
    };
    ($left:expr, $right:expr, $($arg:tt)+) => {
        match (&$left, &$right) {
            (left_val, right_val) => {
                if !(*left_val == *right_val) {
                    panic!("invariant violation: {}", format!($($arg)+));
                }
            }
        }
    };
}

/// Unconditionally panics — marks a code path that should be unreachable
/// absent a programming bug.
#[macro_export]
macro_rules! internal {
    () => {
        panic!("internal invariant violation")
    };
    ($($arg:tt)+) => {
        panic!("internal invariant violation: {}", format!($($arg)+))
    };
}
