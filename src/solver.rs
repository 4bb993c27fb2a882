//! Two-phase stochastic parameter search over a shared worker pool.
//!
//! Each template layer gets one opaque pool job. The job first hill-climbs
//! the feature parameters (filter order, detector window) on control-point
//! yield, then hill-climbs the geometry parameters (search and matching
//! region sizes) on registration fitness, reusing the control points and the
//! coarse transform across trials. Every job writes its result into a slot
//! pre-allocated at the layer's submission index and then notifies the
//! caller, whether the layer converged or failed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, warn};
use ndarray::{Array2, Array3};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::bilinear::BilinearCoeffs;
use crate::coarse::approximate_transform;
use crate::control_points::{identify, ControlPoint};
use crate::deform::deform_image;
use crate::error::SolverError;
use crate::filters::compute_modulus;
use crate::pipeline::{self, flatten_channels, inverted_mask, FitResult};

/// One set of registration hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterSet {
    /// Wavelet filter order (tap count is twice this).
    pub order: usize,
    /// Side length of the local-maximum detector window.
    pub window_size: usize,
    /// Half-extent of the reference search window around a control point.
    pub search_region_size: usize,
    /// Half-extent of the template window matched inside the search window.
    pub control_point_region_size: usize,
    /// Upscale factor for subpixel matching; held at 1 by the mutator.
    pub scale_factor: f32,
}

impl Default for ParameterSet {
    fn default() -> Self {
        Self {
            order: 3,
            window_size: 10,
            search_region_size: 20,
            control_point_region_size: 10,
            scale_factor: 1.0,
        }
    }
}

impl ParameterSet {
    /// Check the hard parameter invariants the mutator maintains.
    pub fn validate(&self) -> Result<(), SolverError> {
        if self.order < 3 {
            return Err(SolverError::InvalidParameters(format!(
                "order must be at least 3, got {}",
                self.order
            )));
        }
        if self.window_size < 5 {
            return Err(SolverError::InvalidParameters(format!(
                "window size must be at least 5, got {}",
                self.window_size
            )));
        }
        if self.control_point_region_size < self.window_size
            || self.control_point_region_size >= self.search_region_size
        {
            return Err(SolverError::InvalidParameters(format!(
                "region sizes must satisfy window <= control point region < search \
                 (window {}, control point region {}, search {})",
                self.window_size, self.control_point_region_size, self.search_region_size
            )));
        }
        if self.scale_factor <= 0.0 {
            return Err(SolverError::InvalidParameters(format!(
                "scale factor must be positive, got {}",
                self.scale_factor
            )));
        }
        Ok(())
    }
}

/// Which half of the parameter set a mutation step perturbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationScope {
    /// Filter order and detector window, searched in the first phase.
    Features,
    /// Search and matching region sizes, searched in the second phase.
    Geometry,
}

fn jitter(rng: &mut StdRng, value: usize, spread: i64, floor: i64) -> usize {
    (value as i64 + rng.random_range(-spread..=spread)).max(floor) as usize
}

/// Randomly perturb one scope of the parameter set.
///
/// Regardless of scope the result satisfies `order >= 3`, `window_size >= 5`,
/// `window_size <= control_point_region_size < search_region_size` and
/// `scale_factor == 1`. The search region floor is `window_size + 1` so the
/// chain constraint is always satisfiable.
pub fn mutate_parameters(
    params: &ParameterSet,
    rng: &mut StdRng,
    scope: MutationScope,
) -> ParameterSet {
    let mut out = *params;

    match scope {
        MutationScope::Features => {
            out.order = jitter(rng, out.order, 2, 3);
            out.window_size = jitter(rng, out.window_size, 4, 5);
        }
        MutationScope::Geometry => {
            out.search_region_size =
                jitter(rng, out.search_region_size, 4, out.window_size as i64 + 1);
            out.control_point_region_size = jitter(rng, out.control_point_region_size, 4, 0)
                .clamp(out.window_size, out.search_region_size - 1);
        }
    }

    // Restore the chain constraint after either scope's jitter.
    out.search_region_size = out.search_region_size.max(out.window_size + 1);
    out.control_point_region_size = out
        .control_point_region_size
        .clamp(out.window_size, out.search_region_size - 1);
    out.scale_factor = 1.0;
    out
}

/// One template layer queued for alignment.
#[derive(Debug, Clone)]
pub struct LayerInput {
    /// Template image, (H, W, C).
    pub image: Array3<f32>,
    /// Optional exclusion mask in [0, 1], nonzero marking excluded pixels.
    pub mask: Option<Array2<f32>>,
}

/// Outcome of one layer's parameter search.
#[derive(Debug, Clone)]
pub struct LayerResult {
    /// The parameter set that produced `fit`.
    pub parameters: ParameterSet,
    pub fit: FitResult,
}

/// Solver tuning knobs. The defaults match the search depth the algorithm
/// was calibrated with.
#[derive(Debug, Clone)]
pub struct SolverConfig {
    /// Feature-phase trial budget per layer.
    pub phase_a_trials: usize,
    /// Geometry-phase trial budget per layer.
    pub phase_b_trials: usize,
    /// Fitness at or below which the geometry phase stops early.
    pub target_fitness: f32,
    /// Base seed; each layer derives its own stream from it.
    pub seed: u64,
    /// Worker pool size, 0 for the rayon default.
    pub threads: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            phase_a_trials: 15,
            phase_b_trials: 15,
            target_fitness: 1.0 / 6.0,
            seed: 0,
            threads: 0,
        }
    }
}

struct SolverState {
    results: Mutex<Vec<Option<LayerResult>>>,
    pending: AtomicUsize,
}

/// Asynchronous per-layer parameter solver.
///
/// `start` submits one job per template layer to a bounded pool and returns
/// immediately; completed layers are announced through the caller's callback
/// and retrieved by their stable submission index. A solver runs one request
/// at a time and keeps its results until the next request starts.
pub struct Solver {
    pool: rayon::ThreadPool,
    config: SolverConfig,
    state: Arc<SolverState>,
}

impl Solver {
    pub fn new(config: SolverConfig) -> Result<Self, SolverError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.threads)
            .build()?;
        Ok(Self {
            pool,
            config,
            state: Arc::new(SolverState {
                results: Mutex::new(Vec::new()),
                pending: AtomicUsize::new(0),
            }),
        })
    }

    pub fn is_running(&self) -> bool {
        self.state.pending.load(Ordering::Acquire) != 0
    }

    /// Fetch a completed layer result by its submission index. Returns `None`
    /// for out-of-range indices and for layers still in flight.
    pub fn result(&self, index: usize) -> Option<LayerResult> {
        self.state.results.lock().get(index).cloned().flatten()
    }

    /// Validate inputs and submit one search job per layer.
    ///
    /// `parameters` supplies per-layer starting points; `None` starts every
    /// layer from [`ParameterSet::default`]. `on_layer_finished` runs on a
    /// pool thread after the layer's result slot is filled, for successes and
    /// failures alike.
    pub fn start<F>(
        &self,
        reference: Array3<f32>,
        layers: Vec<LayerInput>,
        parameters: Option<Vec<ParameterSet>>,
        on_layer_finished: F,
    ) -> Result<(), SolverError>
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        if self.is_running() {
            return Err(SolverError::AlreadyRunning);
        }
        if layers.is_empty() {
            return Err(SolverError::NoTemplates);
        }
        let parameters = match parameters {
            Some(p) if p.len() != layers.len() => {
                return Err(SolverError::ParameterCountMismatch {
                    expected: layers.len(),
                    got: p.len(),
                });
            }
            Some(p) => p,
            None => vec![ParameterSet::default(); layers.len()],
        };
        for p in &parameters {
            p.validate()?;
        }

        *self.state.results.lock() = vec![None; layers.len()];
        self.state.pending.store(layers.len(), Ordering::Release);

        let reference = Arc::new(reference);
        let callback = Arc::new(on_layer_finished);
        for (index, (layer, initial)) in layers.into_iter().zip(parameters).enumerate() {
            let reference = Arc::clone(&reference);
            let state = Arc::clone(&self.state);
            let callback = Arc::clone(&callback);
            let config = self.config.clone();
            self.pool.spawn(move || {
                let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(index as u64));
                let result = optimize(&reference, &layer, initial, &config, &mut rng);
                state.results.lock()[index] = Some(result);
                callback(index);
                state.pending.fetch_sub(1, Ordering::AcqRel);
            });
        }
        Ok(())
    }

    /// Run the deformation resampler as its own pool job and hand the result
    /// to `on_done` on a pool thread.
    pub fn schedule_deformation<F>(
        &self,
        image: Array3<f32>,
        x_coeffs: BilinearCoeffs,
        y_coeffs: BilinearCoeffs,
        on_done: F,
    ) where
        F: FnOnce(Array3<f32>) + Send + 'static,
    {
        self.pool.spawn(move || {
            on_done(deform_image(image.view(), &x_coeffs, &y_coeffs));
        });
    }
}

fn apply_mask(image: &Array3<f32>, mask: &Array2<f32>) -> Array3<f32> {
    let mut out = image.clone();
    for ((r, c, _), v) in out.indexed_iter_mut() {
        if mask[[r, c]] > 0.0 {
            *v = 0.0;
        }
    }
    out
}

/// One layer's full search: feature phase, coarse bootstrap, geometry phase.
fn optimize(
    reference: &Array3<f32>,
    layer: &LayerInput,
    initial: ParameterSet,
    config: &SolverConfig,
    rng: &mut StdRng,
) -> LayerResult {
    let masked = match &layer.mask {
        Some(mask) => apply_mask(&layer.image, mask),
        None => layer.image.clone(),
    };
    let masked_flat = flatten_channels(masked.view());

    // Phase one: maximize control-point yield over order and window size,
    // mutating from the best trial so far.
    let mut best_features: Option<(Vec<ControlPoint>, ParameterSet)> = None;
    for trial in 0..config.phase_a_trials {
        let base = best_features
            .as_ref()
            .map(|(_, p)| *p)
            .unwrap_or(initial);
        let params = mutate_parameters(&base, rng, MutationScope::Features);
        let modulus = compute_modulus(masked_flat.view(), params.order);
        let points = identify(modulus.view(), params.window_size);
        debug!(
            "feature trial {}/{}: order {} window {} -> {} points",
            trial + 1,
            config.phase_a_trials,
            params.order,
            params.window_size,
            points.len()
        );
        if points.is_empty() {
            continue;
        }
        let better = best_features
            .as_ref()
            .map(|(best, _)| points.len() > best.len())
            .unwrap_or(true);
        if better {
            best_features = Some((points, params));
        }
    }

    let Some((control_points, mut best_params)) = best_features else {
        warn!("no feature trial produced control points, layer fails");
        return LayerResult {
            parameters: initial,
            fit: FitResult::failure(),
        };
    };

    // Coarse bootstrap, shared by every geometry trial.
    let exclusion = layer.mask.as_ref().map(|m| inverted_mask(m.view()));
    let transform = approximate_transform(
        flatten_channels(reference.view()).view(),
        flatten_channels(layer.image.view()).view(),
        exclusion.as_ref().map(|m| m.view()),
        rng,
    );

    // Geometry starting point scales with the template extent.
    let (rows, cols, _) = layer.image.dim();
    let min_side = rows.min(cols);
    best_params.control_point_region_size = ((min_side as f32 * 0.15) as usize).clamp(6, 10);
    best_params.search_region_size = best_params.control_point_region_size * 2;

    let mut best_fit = FitResult::failure();
    for trial in 0..config.phase_b_trials {
        if !best_fit.is_failure() && best_fit.fitness <= config.target_fitness {
            break;
        }
        let params = mutate_parameters(&best_params, rng, MutationScope::Geometry);
        let fit = pipeline::register(
            reference.view(),
            masked.view(),
            layer.mask.as_ref().map(|m| m.view()),
            &params,
            Some(&control_points),
            Some(transform),
            rng,
        );
        debug!(
            "geometry trial {}/{}: search {} region {} -> fitness {} ({} points)",
            trial + 1,
            config.phase_b_trials,
            params.search_region_size,
            params.control_point_region_size,
            fit.fitness,
            fit.point_count
        );

        let accept = best_fit.is_failure()
            || (!fit.is_failure()
                && (fit.fitness < best_fit.fitness
                    || (fit.fitness == best_fit.fitness
                        && fit.point_count > best_fit.point_count)));
        if accept {
            best_fit = fit;
            best_params = params;
        }
    }

    LayerResult {
        parameters: best_params,
        fit: best_fit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn textured_board(rows: usize, cols: usize, cell: usize, seed: u64) -> Array3<f32> {
        let cells_per_row = cols / cell + 2;
        let mut levels = vec![0.0f32; cells_per_row * (rows / cell + 2)];
        for (i, level) in levels.iter_mut().enumerate() {
            let state = (i as u64 + seed)
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1);
            *level = 0.4 + 0.6 * ((state >> 40) as f32 / (1u64 << 24) as f32);
        }
        Array3::from_shape_fn((rows, cols, 3), |(r, c, _)| {
            let (cr, cc) = (r / cell, c / cell);
            let base = levels[cr * cells_per_row + cc];
            if (cr + cc) % 2 == 0 {
                base
            } else {
                base * 0.1
            }
        })
    }

    fn translated_scene() -> (Array3<f32>, Array3<f32>) {
        let template = textured_board(200, 200, 10, 17);
        let mut reference = Array3::<f32>::zeros((200, 200, 3));
        for r in 0..195 {
            for c in 0..190 {
                for ch in 0..3 {
                    reference[[r + 5, c + 10, ch]] = template[[r, c, ch]];
                }
            }
        }
        (reference, template)
    }

    fn index_channel() -> (
        impl Fn(usize) + Send + Sync + 'static,
        mpsc::Receiver<usize>,
    ) {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        (move |index| tx.lock().send(index).unwrap(), rx)
    }

    #[test]
    fn default_parameters_are_valid() {
        assert!(ParameterSet::default().validate().is_ok());
    }

    #[test]
    fn validation_rejects_each_broken_bound() {
        let base = ParameterSet::default();
        for broken in [
            ParameterSet { order: 2, ..base },
            ParameterSet {
                window_size: 4,
                ..base
            },
            ParameterSet {
                control_point_region_size: 9,
                ..base
            },
            ParameterSet {
                search_region_size: 10,
                ..base
            },
            ParameterSet {
                scale_factor: 0.0,
                ..base
            },
        ] {
            assert!(
                matches!(
                    broken.validate(),
                    Err(SolverError::InvalidParameters(_))
                ),
                "accepted {:?}",
                broken
            );
        }
    }

    #[test]
    fn mutation_maintains_invariants_in_both_scopes() {
        let mut rng = StdRng::seed_from_u64(99);
        let mut params = ParameterSet::default();
        for i in 0..400 {
            let scope = if i % 2 == 0 {
                MutationScope::Features
            } else {
                MutationScope::Geometry
            };
            params = mutate_parameters(&params, &mut rng, scope);
            assert!(params.order >= 3);
            assert!(params.window_size >= 5);
            assert!(params.control_point_region_size >= params.window_size);
            assert!(params.control_point_region_size < params.search_region_size);
            assert_eq!(params.scale_factor, 1.0);
            assert!(params.validate().is_ok(), "invalid after step {}: {:?}", i, params);
        }
    }

    #[test]
    fn feature_mutation_leaves_geometry_at_most_reclamped() {
        let mut rng = StdRng::seed_from_u64(5);
        let base = ParameterSet {
            search_region_size: 40,
            control_point_region_size: 30,
            ..ParameterSet::default()
        };
        for _ in 0..100 {
            let mutated = mutate_parameters(&base, &mut rng, MutationScope::Features);
            // Geometry only moves to restore the chain constraint.
            assert_eq!(mutated.search_region_size, 40);
            assert_eq!(
                mutated.control_point_region_size,
                30usize.max(mutated.window_size)
            );
            assert!((mutated.order as i64 - base.order as i64).abs() <= 2);
            assert!((mutated.window_size as i64 - base.window_size as i64).abs() <= 4);
        }
    }

    #[test]
    fn geometry_mutation_leaves_features_untouched() {
        let mut rng = StdRng::seed_from_u64(6);
        let base = ParameterSet::default();
        for _ in 0..100 {
            let mutated = mutate_parameters(&base, &mut rng, MutationScope::Geometry);
            assert_eq!(mutated.order, base.order);
            assert_eq!(mutated.window_size, base.window_size);
            assert!(
                (mutated.search_region_size as i64 - base.search_region_size as i64).abs() <= 4
            );
        }
    }

    #[test]
    fn start_rejects_empty_and_mismatched_input() {
        let solver = Solver::new(SolverConfig::default()).unwrap();
        let reference = textured_board(60, 60, 6, 1);

        let err = solver
            .start(reference.clone(), Vec::new(), None, |_| {})
            .unwrap_err();
        assert!(matches!(err, SolverError::NoTemplates));

        let layer = LayerInput {
            image: textured_board(60, 60, 6, 2),
            mask: None,
        };
        let err = solver
            .start(
                reference.clone(),
                vec![layer.clone()],
                Some(vec![ParameterSet::default(); 3]),
                |_| {},
            )
            .unwrap_err();
        assert!(matches!(
            err,
            SolverError::ParameterCountMismatch {
                expected: 1,
                got: 3
            }
        ));

        let err = solver
            .start(
                reference,
                vec![layer],
                Some(vec![ParameterSet {
                    order: 1,
                    ..ParameterSet::default()
                }]),
                |_| {},
            )
            .unwrap_err();
        assert!(matches!(err, SolverError::InvalidParameters(_)));
    }

    #[test]
    fn concurrent_start_is_rejected() {
        let solver = Solver::new(SolverConfig {
            threads: 1,
            ..SolverConfig::default()
        })
        .unwrap();
        let (reference, template) = translated_scene();
        let layers = vec![
            LayerInput {
                image: template.clone(),
                mask: None,
            },
            LayerInput {
                image: template,
                mask: None,
            },
        ];
        let (callback, rx) = index_channel();

        solver
            .start(reference.clone(), layers.clone(), None, callback)
            .unwrap();
        let err = solver
            .start(reference, layers, None, |_| {})
            .unwrap_err();
        assert!(matches!(err, SolverError::AlreadyRunning));

        for _ in 0..2 {
            rx.recv_timeout(Duration::from_secs(300)).unwrap();
        }
    }

    #[test]
    fn solves_translated_layer_and_stores_failures_at_stable_indices() {
        let solver = Solver::new(SolverConfig {
            threads: 2,
            seed: 11,
            ..SolverConfig::default()
        })
        .unwrap();
        let (reference, template) = translated_scene();
        let layers = vec![
            LayerInput {
                image: template,
                mask: None,
            },
            // A blank layer cannot produce control points; its failure must
            // still be stored and announced.
            LayerInput {
                image: Array3::<f32>::zeros((80, 80, 3)),
                mask: None,
            },
        ];
        let (callback, rx) = index_channel();

        assert!(solver.result(0).is_none());
        solver.start(reference, layers, None, callback).unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(rx.recv_timeout(Duration::from_secs(300)).unwrap());
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1]);

        let good = solver.result(0).expect("layer 0 result missing");
        assert!(!good.fit.is_failure(), "aligned layer failed");
        assert!(
            good.fit.fitness <= 1.0 / 6.0,
            "fitness too high: {}",
            good.fit.fitness
        );
        let (tx, ty) = good.fit.transform.translation();
        assert!((tx - 10.0).abs() <= 2.0, "tx: {}", tx);
        assert!((ty - 5.0).abs() <= 2.0, "ty: {}", ty);
        assert!(good.parameters.validate().is_ok());

        let blank = solver.result(1).expect("failed layer result missing");
        assert!(blank.fit.is_failure());

        assert!(solver.result(2).is_none());
    }

    #[test]
    fn masked_region_is_excluded_from_detection() {
        // Mask out everything: detection sees a blank template and the layer
        // fails even though the image itself has texture.
        let solver = Solver::new(SolverConfig::default()).unwrap();
        let (reference, template) = translated_scene();
        let (rows, cols, _) = template.dim();
        let layers = vec![LayerInput {
            image: template,
            mask: Some(Array2::from_elem((rows, cols), 1.0)),
        }];
        let (callback, rx) = index_channel();

        solver.start(reference, layers, None, callback).unwrap();
        let index = rx.recv_timeout(Duration::from_secs(300)).unwrap();
        assert_eq!(index, 0);
        assert!(solver.result(0).unwrap().fit.is_failure());
    }

    #[test]
    fn scheduled_deformation_delivers_output() {
        let solver = Solver::new(SolverConfig::default()).unwrap();
        let image = textured_board(20, 30, 5, 9);
        let identity_x = BilinearCoeffs {
            a: 15.0,
            b: 30.0,
            c: 0.0,
            d: 0.0,
        };
        let identity_y = BilinearCoeffs {
            a: 10.0,
            b: 0.0,
            c: 20.0,
            d: 0.0,
        };
        let (tx, rx) = mpsc::channel();
        solver.schedule_deformation(image.clone(), identity_x, identity_y, move |out| {
            tx.send(out).unwrap();
        });
        let out = rx.recv_timeout(Duration::from_secs(60)).unwrap();
        assert_eq!(out.dim(), (20, 30, 4));
        for r in 0..20 {
            for c in 0..30 {
                assert!((out[[r, c, 0]] - image[[r, c, 0]]).abs() < 1e-3);
            }
        }
    }
}
