//! Event loop errors

use thiserror::Error;

/// Errors raised synchronously by [`EventLoop`](crate::EventLoop) calls.
///
/// Failures inside user callbacks are not represented here: deferred values
/// carry their own error type, and panicking timer callbacks are contained
/// by the dispatch loop.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LoopError {
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: &'static str, reason: String },

    #[error("event loop is already running")]
    AlreadyRunning,

    #[error("manual time stepping requires an offline clock")]
    NotOffline,

    #[error("dispatch exceeded {limit} passes without reaching the target time")]
    DispatchLimit { limit: usize },
}

impl LoopError {
    /// Create an invalid argument error.
    pub fn invalid_argument(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            name,
            reason: reason.into(),
        }
    }
}

/// Check a delay or period in seconds.
///
/// `allow_zero` distinguishes timeouts (`>= 0`) from intervals (`> 0`).
pub(crate) fn check_duration(
    name: &'static str,
    value: f64,
    allow_zero: bool,
) -> Result<f64, LoopError> {
    if !value.is_finite() {
        return Err(LoopError::invalid_argument(name, format!("{value} is not finite")));
    }
    if value < 0.0 || (!allow_zero && value == 0.0) {
        let bound = if allow_zero { ">= 0" } else { "> 0" };
        return Err(LoopError::invalid_argument(
            name,
            format!("{value} must be {bound}"),
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_duration_bounds() {
        assert_eq!(check_duration("delay", 0.0, true), Ok(0.0));
        assert_eq!(check_duration("delay", 0.25, true), Ok(0.25));
        assert!(check_duration("delay", -1.0, true).is_err());
        assert!(check_duration("period", 0.0, false).is_err());
        assert!(check_duration("period", f64::NAN, false).is_err());
        assert!(check_duration("period", f64::INFINITY, false).is_err());
    }

    #[test]
    fn test_error_message() {
        let err = check_duration("period", 0.0, false).unwrap_err();
        assert_eq!(err.to_string(), "invalid argument `period`: 0 must be > 0");
    }
}
