//! Typed error kinds for the filter core.
//!
//! Statistical rejections (chi-square gate failures, bad triangulation conditioning)
//! are *not* represented here — those are routine and signalled with `bool`/`Option`
//! return values, matching the source estimator's own control flow. This enum is
//! reserved for the three kinds of error that are worth a caller's attention.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FilterError {
    /// A programmer error: a precondition on call order or argument shape was violated.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// Expected, recoverable absence of usable data (short IMU buffer, no features to update).
    #[error("transient data failure: {0}")]
    TransientData(String),

    /// The covariance failed its positive-semi-definiteness invariant after an update.
    /// This is unrecoverable without a filter reset.
    #[error("filter inconsistency: diagonal entry {diag_index} became {value} after update")]
    Inconsistent { diag_index: usize, value: f64 },
}

pub type FilterResult<T> = Result<T, FilterError>;
