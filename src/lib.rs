//! Non-rigid image registration core.
//!
//! Implements the control-point registration algorithm of Conover et al.
//! [2015]: wavelet-modulus control-point detection, phase-only correlation
//! matching, and robust bilinear warp fitting, together with a stochastic
//! per-layer parameter solver running on a shared worker pool.
//!
//! The crate consumes plain `ndarray` image buffers (f32 intensities, 1/3/4
//! channels), an optional exclusion mask, and numeric parameters; it produces
//! affine transforms, control-point correspondences, bilinear deformation
//! coefficients, and warped images. Image decode/encode and any UI belong to
//! the caller.
//!
//! ## Pipeline
//!
//! 1. [`filters::compute_modulus`] + [`control_points::identify`] pick
//!    scale-selective control points on the template.
//! 2. [`coarse::approximate_transform`] bootstraps an affine alignment from
//!    keypoint matches.
//! 3. [`phase_match::find_control_point_pairs`] refines each control point to
//!    a sub-pixel correspondence via phase-only normalized cross-correlation.
//! 4. [`bilinear::fit`] fits a 4-parameter bilinear warp per axis with
//!    progressive residual trimming.
//! 5. [`pipeline::register`] orchestrates one trial; [`solver::Solver`]
//!    searches the hyperparameter space per template layer.
//! 6. [`deform::deform_image`] applies accepted coefficients to the
//!    full-resolution pixels, once, off the hot path.

pub mod bilinear;
pub mod coarse;
pub mod control_points;
pub mod deform;
pub mod error;
pub mod filters;
pub mod phase_match;
pub mod pipeline;
pub mod solver;
pub mod transforms;

pub use bilinear::{BilinearCoeffs, BilinearFit};
pub use coarse::AffineTransform;
pub use control_points::ControlPoint;
pub use deform::deform_image;
pub use error::SolverError;
pub use phase_match::KeypointPairs;
pub use pipeline::FitResult;
pub use solver::{
    mutate_parameters, LayerInput, LayerResult, MutationScope, ParameterSet, Solver, SolverConfig,
};
