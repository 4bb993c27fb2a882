//! Single-trial registration orchestration.
//!
//! One call runs the full chain for a concrete parameter set: control-point
//! detection (unless points are supplied), coarse affine bootstrap (unless a
//! transform is supplied), affine warp and overlap crop, phase-correlation
//! matching, and the bilinear fit. Every algorithmic failure is reported as
//! the in-band sentinel result, never as a panic or error.

use log::debug;
use ndarray::{s, Array2, Array3, ArrayView2, ArrayView3, Axis};
use rand::rngs::StdRng;

use crate::bilinear::{self, BilinearCoeffs};
use crate::coarse::{approximate_transform, AffineTransform};
use crate::control_points::{identify, ControlPoint};
use crate::filters::compute_modulus;
use crate::phase_match::{find_control_point_pairs, KeypointPairs};
use crate::solver::ParameterSet;

/// Final residual threshold handed to the bilinear fitter. Tight enough that
/// a converged fit can satisfy the solver's acceptance target.
const FIT_THRESHOLD: f32 = 1.0 / 8.0;
const FIT_ITERATIONS: usize = 20;

/// Outcome of one registration trial.
///
/// `fitness` is the last inlier-distance threshold the bilinear fit
/// sustained; lower is better and `-1.0` is the uniform failure sentinel.
/// Failure results carry no coefficients.
#[derive(Debug, Clone)]
pub struct FitResult {
    pub fitness: f32,
    pub point_count: usize,
    pub transform: AffineTransform,
    pub x_coeffs: Option<BilinearCoeffs>,
    pub y_coeffs: Option<BilinearCoeffs>,
    pub keypoints: KeypointPairs,
    pub aligned_template: Option<Array3<f32>>,
}

impl FitResult {
    pub fn failure() -> Self {
        Self {
            fitness: -1.0,
            point_count: 0,
            transform: AffineTransform::identity(),
            x_coeffs: None,
            y_coeffs: None,
            keypoints: KeypointPairs::default(),
            aligned_template: None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.fitness < 0.0
    }
}

/// Per-pixel channel sum, the single-channel view used for matching.
pub(crate) fn flatten_channels(image: ArrayView3<'_, f32>) -> Array2<f32> {
    image.sum_axis(Axis(2))
}

/// Inverse-mapped affine warp with bilinear sampling and zero border.
fn warp_affine(
    template: ArrayView3<'_, f32>,
    transform: &AffineTransform,
    out_rows: usize,
    out_cols: usize,
) -> Array3<f32> {
    let (rows, cols, channels) = template.dim();
    let mut out = Array3::<f32>::zeros((out_rows, out_cols, channels));
    let Some(inverse) = transform.invert() else {
        return out;
    };

    for r in 0..out_rows {
        for c in 0..out_cols {
            let (sx, sy) = inverse.apply(c as f32, r as f32);
            if sx < 0.0 || sy < 0.0 || sx > cols as f32 - 1.0 || sy > rows as f32 - 1.0 {
                continue;
            }
            let x0 = sx.floor() as usize;
            let y0 = sy.floor() as usize;
            let x1 = (x0 + 1).min(cols - 1);
            let y1 = (y0 + 1).min(rows - 1);
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;
            for ch in 0..channels {
                out[[r, c, ch]] = template[[y0, x0, ch]] * (1.0 - fy) * (1.0 - fx)
                    + template[[y0, x1, ch]] * (1.0 - fy) * fx
                    + template[[y1, x0, ch]] * fy * (1.0 - fx)
                    + template[[y1, x1, ch]] * fy * fx;
            }
        }
    }
    out
}

struct Overlap {
    reference: Array3<f32>,
    template: Array3<f32>,
}

/// Warp the template and crop both images to the overlapping region: crop
/// origin is the (clamped) transform translation, crop extent the minimum of
/// the reference size and the transform-scaled template size.
fn transform_template_affine(
    reference: ArrayView3<'_, f32>,
    template: ArrayView3<'_, f32>,
    transform: &AffineTransform,
) -> Option<Overlap> {
    let (ref_rows, ref_cols, _) = reference.dim();
    let (tpl_rows, tpl_cols, _) = template.dim();
    let m = &transform.0;

    let (tw, th) = (tpl_cols as f32, tpl_rows as f32);
    let out_cols = (m[0][0] * tw + m[0][1] * th + m[0][2]) as isize;
    let out_rows = (m[1][0] * tw + m[1][1] * th + m[1][2]) as isize;
    if out_cols <= 0 || out_rows <= 0 {
        return None;
    }

    let warped = warp_affine(template, transform, out_rows as usize, out_cols as usize);

    let (offset_x, offset_y) = transform.translation();
    let scaled_w = tw * m[0][0];
    let scaled_h = th * m[1][1];

    let min_x = offset_x.max(0.0) as usize;
    let min_y = offset_y.max(0.0) as usize;
    let max_x = ((offset_x + scaled_w).min(ref_cols as f32) as isize)
        .clamp(0, warped.dim().1 as isize) as usize;
    let max_y = ((offset_y + scaled_h).min(ref_rows as f32) as isize)
        .clamp(0, warped.dim().0 as isize) as usize;
    if max_x <= min_x || max_y <= min_y {
        return None;
    }

    let template_crop = warped.slice(s![min_y..max_y, min_x..max_x, ..]).to_owned();

    let ref_max_y = (min_y + template_crop.dim().0).min(ref_rows);
    let ref_max_x = (min_x + template_crop.dim().1).min(ref_cols);
    if ref_max_x <= min_x || ref_max_y <= min_y {
        return None;
    }
    let reference_crop = reference
        .slice(s![min_y..ref_max_y, min_x..ref_max_x, ..])
        .to_owned();

    Some(Overlap {
        reference: reference_crop,
        template: template_crop,
    })
}

pub(crate) fn inverted_mask(mask: ArrayView2<'_, f32>) -> Array2<f32> {
    mask.mapv(|v| 1.0 - v.clamp(0.0, 1.0))
}

/// Run one full registration trial.
///
/// `control_points` and `transform` short-circuit the detection and coarse
/// alignment stages when the caller already has them (the solver reuses both
/// across trials). `mask` marks template regions to exclude from coarse
/// keypoint detection. See the module docs for the stage order; any
/// algorithmic dead end yields [`FitResult::failure`].
pub fn register(
    reference: ArrayView3<'_, f32>,
    template: ArrayView3<'_, f32>,
    mask: Option<ArrayView2<'_, f32>>,
    params: &ParameterSet,
    control_points: Option<&[ControlPoint]>,
    transform: Option<AffineTransform>,
    rng: &mut StdRng,
) -> FitResult {
    let mut result = FitResult::failure();

    let detected;
    let control_points = match control_points {
        Some(points) => points,
        None => {
            let modulus = compute_modulus(flatten_channels(template).view(), params.order);
            detected = identify(modulus.view(), params.window_size);
            &detected[..]
        }
    };
    if control_points.is_empty() {
        debug!("registration aborted: no control points");
        return result;
    }

    let mut transform = transform.unwrap_or_else(|| {
        let exclusion = mask.map(|m| inverted_mask(m));
        approximate_transform(
            flatten_channels(reference).view(),
            flatten_channels(template).view(),
            exclusion.as_ref().map(|m| m.view()),
            rng,
        )
    });
    result.transform = transform;

    let mut overlap = transform_template_affine(reference, template, &transform);
    if overlap.is_none() {
        // The transform pushed the template fully outside the reference;
        // retry once from the identity before giving up.
        debug!("empty overlap, retrying with identity transform");
        transform = AffineTransform::identity();
        result.transform = transform;
        overlap = transform_template_affine(reference, template, &transform);
    }
    let Some(overlap) = overlap else {
        debug!("registration aborted: empty overlap after identity retry");
        return result;
    };
    result.aligned_template = Some(overlap.template.clone());

    let mapped: Vec<ControlPoint> = control_points
        .iter()
        .map(|p| {
            let (x, y) = transform.apply_linear(p.x, p.y);
            ControlPoint { x, y }
        })
        .collect();

    let keypoints = find_control_point_pairs(
        flatten_channels(overlap.reference.view()).view(),
        flatten_channels(overlap.template.view()).view(),
        &mapped,
        params.search_region_size,
        params.control_point_region_size,
        params.scale_factor,
    );
    if keypoints.is_empty() {
        debug!("registration aborted: no accepted correspondences");
        return result;
    }
    result.keypoints = keypoints.clone();

    let crop_cols = overlap.template.dim().1 as f32;
    let crop_rows = overlap.template.dim().0 as f32;
    let xs: Vec<f32> = keypoints
        .template
        .iter()
        .map(|p| p[0] / crop_cols - 0.5)
        .collect();
    let ys: Vec<f32> = keypoints
        .template
        .iter()
        .map(|p| p[1] / crop_rows - 0.5)
        .collect();
    let target_x: Vec<f32> = keypoints.reference.iter().map(|p| p[0]).collect();
    let target_y: Vec<f32> = keypoints.reference.iter().map(|p| p[1]).collect();

    let fit = bilinear::fit(&xs, &ys, &target_x, &target_y, FIT_ITERATIONS, FIT_THRESHOLD);
    result.fitness = fit.fitness;
    result.point_count = fit.point_count;
    result.x_coeffs = fit.x_coeffs;
    result.y_coeffs = fit.y_coeffs;
    result
}
