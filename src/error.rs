//! Error taxonomy shared by every operation of the forward model.

use thiserror::Error;

/// Errors raised by the propagation engine.
///
/// Every core operation fails fast with one of these tags instead of
/// returning degenerate output. Nothing retries internally.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SsnpError {
    /// Malformed shape, resolution, angle set or step size. Caller error.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A NaN or infinity escaped a guard. Indicates an implementation defect.
    #[error("numerical degeneracy: {0}")]
    NumericalDegeneracy(String),

    /// The accelerated path could not allocate a buffer or build a kernel.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

pub type Result<T> = std::result::Result<T, SsnpError>;

/// Shorthand for building an [`SsnpError::InvalidArgument`].
pub(crate) fn invalid<T>(msg: impl Into<String>) -> Result<T> {
    Err(SsnpError::InvalidArgument(msg.into()))
}

fn all_finite<'a>(values: impl IntoIterator<Item = &'a num_complex::Complex64>) -> bool {
    values.into_iter().all(|v| v.re.is_finite() && v.im.is_finite())
}

/// Fails with [`SsnpError::NumericalDegeneracy`] if a computed value is NaN or infinite.
pub(crate) fn ensure_finite<'a>(
    values: impl IntoIterator<Item = &'a num_complex::Complex64>,
    what: &str,
) -> Result<()> {
    if all_finite(values) {
        Ok(())
    } else {
        Err(SsnpError::NumericalDegeneracy(format!(
            "{what} contains non-finite values"
        )))
    }
}

/// Fails with [`SsnpError::InvalidArgument`] if a caller-supplied value is NaN or infinite.
pub(crate) fn ensure_finite_input<'a>(
    values: impl IntoIterator<Item = &'a num_complex::Complex64>,
    what: &str,
) -> Result<()> {
    if all_finite(values) {
        Ok(())
    } else {
        invalid(format!("{what} contains non-finite values"))
    }
}
