use thiserror::Error;

/// Errors detected synchronously when work is submitted to the solver.
///
/// Algorithmic failures (no control points, empty crop, no accepted pairs,
/// too few inliers) are not errors: they travel in-band as the
/// [`crate::FitResult`] failure sentinel.
#[derive(Debug, Error)]
pub enum SolverError {
    /// A previous alignment request for this solver is still running.
    /// Concurrent requests are rejected outright, never queued.
    #[error("solver is already processing an alignment request")]
    AlreadyRunning,

    /// `start` was called with an empty template list.
    #[error("no template layers to align")]
    NoTemplates,

    /// The per-layer parameter list does not match the template list.
    #[error("expected {expected} parameter sets, got {got}")]
    ParameterCountMismatch { expected: usize, got: usize },

    /// A parameter set failed validation.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// The shared worker pool could not be created.
    #[error("failed to build worker pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}
