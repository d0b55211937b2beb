//! Logging helpers for fire-and-forget paths.
//!
//! Background tasks (acquisition loops, job workers, listener callbacks)
//! have nobody to return an error to. These extensions log the failure
//! with the caller's source location and hand the value back unchanged.

use std::fmt::Display;

/// Log-and-continue extension for `Result`.
pub trait ResultExt<T, E> {
    /// Log the error at `error` level if this is an `Err`.
    fn log<S: ToString>(self, context: S) -> Result<T, E>;

    /// Log the error at `warn` level if this is an `Err`.
    ///
    /// Used for expected failures such as lost job locks.
    fn log_warn<S: ToString>(self, context: S) -> Result<T, E>;
}

impl<T, E: Display> ResultExt<T, E> for Result<T, E> {
    #[track_caller]
    fn log<S: ToString>(self, context: S) -> Result<T, E> {
        if let Err(ref e) = self {
            let location = std::panic::Location::caller();
            tracing::error!(
                target: "process_engine",
                error = %e,
                file = %format!("{}:{}", location.file(), location.line()),
                context = %context.to_string(),
                "Background operation failed"
            );
        }
        self
    }

    #[track_caller]
    fn log_warn<S: ToString>(self, context: S) -> Result<T, E> {
        if let Err(ref e) = self {
            let location = std::panic::Location::caller();
            tracing::warn!(
                target: "process_engine",
                error = %e,
                file = %format!("{}:{}", location.file(), location.line()),
                context = %context.to_string(),
                "Background operation gave up"
            );
        }
        self
    }
}

/// Log-on-missing extension for `Option`.
pub trait OptionResultExt<T> {
    /// Log at `warn` level if this is `None`.
    fn log_none<S: ToString>(self, context: S) -> Option<T>;
}

impl<T> OptionResultExt<T> for Option<T> {
    #[track_caller]
    fn log_none<S: ToString>(self, context: S) -> Option<T> {
        if self.is_none() {
            let location = std::panic::Location::caller();
            tracing::warn!(
                target: "process_engine",
                file = %format!("{}:{}", location.file(), location.line()),
                context = %context.to_string(),
                "Expected value was missing"
            );
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_passes_value_through() {
        let result: Result<u32, String> = Ok(7);
        assert_eq!(result.log("job worker").unwrap(), 7);

        let failed: Result<u32, String> = Err("lock lost".into());
        assert_eq!(failed.log_warn("job worker").unwrap_err(), "lock lost");
    }

    #[test]
    fn test_log_none() {
        assert_eq!(Some(3).log_none("lookup"), Some(3));
        assert!(None::<u32>.log_none("lookup").is_none());
    }
}
