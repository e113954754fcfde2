//! Utility macros for error construction and early return.

/// Creates a [`crate::error::SluiceError`] from a kind and description, with
/// an optional dynamic detail.
///
/// # Examples
/// ```rust,no_run
/// use sluice::error::ErrorKind;
/// use sluice::sluice_error;
///
/// let error = sluice_error!(ErrorKind::ValidationError, "Invalid mirror name");
/// let error = sluice_error!(
///     ErrorKind::ConfigError,
///     "Peer not found",
///     format!("no peer named '{}'", "ch_main")
/// );
/// ```
#[macro_export]
macro_rules! sluice_error {
    ($kind:expr, $desc:expr) => {
        $crate::error::SluiceError::from(($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        $crate::error::SluiceError::from(($kind, $desc, $detail.to_string()))
    };
}

/// Creates and returns a [`crate::error::SluiceError`] from the current
/// function.
#[macro_export]
macro_rules! bail {
    ($kind:expr, $desc:expr) => {
        return Err($crate::sluice_error!($kind, $desc))
    };
    ($kind:expr, $desc:expr, $detail:expr) => {
        return Err($crate::sluice_error!($kind, $desc, $detail))
    };
}
