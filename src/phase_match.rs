//! Sub-pixel control-point correspondence search over phase-only images.
//!
//! Both images are zero-padded to transform-efficient sizes and reduced to
//! their phase-only reconstructions, which suppresses contrast and
//! illumination differences between layers. Around every control point a
//! search window from the reference and a smaller template window are
//! extracted, bicubically upscaled, and compared with normalized
//! cross-correlation. A correlation peak is accepted only if it passes a
//! two-sided statistical test against the non-peak values; rejected points
//! are dropped, so the output may be shorter than the input.

use ndarray::{s, Array2, ArrayView2};

use crate::control_points::ControlPoint;
use crate::transforms::{optimal_dft_size, phase_only};

/// Parallel, index-aligned reference/template keypoint arrays.
#[derive(Debug, Clone, Default)]
pub struct KeypointPairs {
    pub reference: Vec<[f32; 2]>,
    pub template: Vec<[f32; 2]>,
}

impl KeypointPairs {
    pub fn len(&self) -> usize {
        debug_assert_eq!(self.reference.len(), self.template.len());
        self.reference.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reference.is_empty()
    }

    fn push(&mut self, reference: [f32; 2], template: [f32; 2]) {
        self.reference.push(reference);
        self.template.push(template);
    }
}

/// Margin added before rounding up to an optimal DFT size, so content near
/// the right/bottom edges is not wrapped by the transform.
const DFT_PAD_MARGIN: usize = 10;

fn pad_to_optimal(image: ArrayView2<'_, f32>) -> Array2<f32> {
    let (rows, cols) = image.dim();
    let target_rows = optimal_dft_size(rows + DFT_PAD_MARGIN);
    let target_cols = optimal_dft_size(cols + DFT_PAD_MARGIN);
    let mut padded = Array2::<f32>::zeros((target_rows, target_cols));
    padded.slice_mut(s![..rows, ..cols]).assign(&image);
    padded
}

/// Catmull-Rom style cubic kernel with a = -0.75.
#[inline]
fn cubic_weight(t: f32) -> f32 {
    const A: f32 = -0.75;
    let t = t.abs();
    if t < 1.0 {
        ((A + 2.0) * t - (A + 3.0)) * t * t + 1.0
    } else if t < 2.0 {
        (((t - 5.0) * t + 8.0) * t - 4.0) * A
    } else {
        0.0
    }
}

fn resize_bicubic(region: ArrayView2<'_, f32>, factor: f32) -> Array2<f32> {
    let (rows, cols) = region.dim();
    let new_rows = ((rows as f32 * factor).round() as usize).max(1);
    let new_cols = ((cols as f32 * factor).round() as usize).max(1);

    Array2::from_shape_fn((new_rows, new_cols), |(r, c)| {
        let sy = (r as f32 + 0.5) / factor - 0.5;
        let sx = (c as f32 + 0.5) / factor - 0.5;
        let y0 = sy.floor() as isize;
        let x0 = sx.floor() as isize;

        let mut acc = 0.0f32;
        let mut weight_sum = 0.0f32;
        for dy in -1isize..=2 {
            let wy = cubic_weight(sy - (y0 + dy) as f32);
            if wy == 0.0 {
                continue;
            }
            let yy = (y0 + dy).clamp(0, rows as isize - 1) as usize;
            for dx in -1isize..=2 {
                let wx = cubic_weight(sx - (x0 + dx) as f32);
                if wx == 0.0 {
                    continue;
                }
                let xx = (x0 + dx).clamp(0, cols as isize - 1) as usize;
                acc += wy * wx * region[[yy, xx]];
                weight_sum += wy * wx;
            }
        }
        if weight_sum.abs() > 1e-12 {
            acc / weight_sum
        } else {
            0.0
        }
    })
}

/// Extract the window of radius `half` around `center`, clamped to the image,
/// upscaled by `factor`. `None` when the clamped window is empty.
fn upscale_region(
    image: &Array2<f32>,
    center: (f32, f32),
    half: (usize, usize),
    factor: f32,
) -> Option<Array2<f32>> {
    let (rows, cols) = image.dim();
    let min_x = (center.0 - half.0 as f32).max(0.0) as usize;
    let min_y = (center.1 - half.1 as f32).max(0.0) as usize;
    let max_x = ((center.0 + half.0 as f32 + 1.0).min(cols as f32)) as usize;
    let max_y = ((center.1 + half.1 as f32 + 1.0).min(rows as f32)) as usize;

    if max_x <= min_x || max_y <= min_y {
        return None;
    }

    let window = image.slice(s![min_y..max_y, min_x..max_x]);
    if (factor - 1.0).abs() < 1e-6 {
        Some(window.to_owned())
    } else {
        Some(resize_bicubic(window, factor))
    }
}

/// Normalized cross-correlation of `template` slid over `search`
/// (`TM_CCORR_NORMED`): `sum(T*S) / sqrt(sum(T^2) * sum(S^2))` per window.
/// The search-window energies come from a squared-sum integral image.
fn normalized_cross_correlation(
    search: ArrayView2<'_, f32>,
    template: ArrayView2<'_, f32>,
) -> Array2<f32> {
    let (sh, sw) = search.dim();
    let (th, tw) = template.dim();
    debug_assert!(sh >= th && sw >= tw);

    let template_energy: f32 = template.iter().map(|v| v * v).sum();

    // Integral of squared search values, indexed [r+1, c+1].
    let mut sq_integral = Array2::<f32>::zeros((sh + 1, sw + 1));
    for r in 0..sh {
        let mut row_acc = 0.0f32;
        for c in 0..sw {
            let v = search[[r, c]];
            row_acc += v * v;
            sq_integral[[r + 1, c + 1]] = sq_integral[[r, c + 1]] + row_acc;
        }
    }

    let out_rows = sh - th + 1;
    let out_cols = sw - tw + 1;
    let mut out = Array2::<f32>::zeros((out_rows, out_cols));
    for r in 0..out_rows {
        for c in 0..out_cols {
            let mut cross = 0.0f32;
            for tr in 0..th {
                for tc in 0..tw {
                    cross += template[[tr, tc]] * search[[r + tr, c + tc]];
                }
            }
            let window_energy = sq_integral[[r + th, c + tw]] - sq_integral[[r, c + tw]]
                - sq_integral[[r + th, c]]
                + sq_integral[[r, c]];
            let denom = (template_energy * window_energy).sqrt();
            out[[r, c]] = if denom > 1e-12 { cross / denom } else { 0.0 };
        }
    }
    out
}

/// Find sub-pixel control-point correspondences between the reference and
/// template images.
///
/// For every control point a `search_region_size`-radius reference window and
/// a `control_point_region_size`-radius template window are extracted at the
/// same coordinate, upscaled by `scale_factor`, and correlated. The peak must
/// pass both acceptance tests:
///
/// - T1: peak >= 4 * std-dev of the non-peak values;
/// - T2: the non-peak pool is non-empty and peak > max(non-peak) + std-dev.
///
/// Accepted peaks are converted back to unscaled reference coordinates,
/// compensating for the size difference between the two windows. Points whose
/// windows are empty, whose search window is smaller than the template
/// window, or whose peak fails either test are silently dropped.
pub fn find_control_point_pairs(
    reference: ArrayView2<'_, f32>,
    template: ArrayView2<'_, f32>,
    control_points: &[ControlPoint],
    search_region_size: usize,
    control_point_region_size: usize,
    scale_factor: f32,
) -> KeypointPairs {
    let reference = phase_only(pad_to_optimal(reference).view());
    let template = phase_only(pad_to_optimal(template).view());

    let mut pairs = KeypointPairs::default();
    let size_gap = search_region_size as f32 - control_point_region_size as f32;

    for point in control_points {
        let Some(search_region) = upscale_region(
            &reference,
            (point.x, point.y),
            (search_region_size, search_region_size),
            scale_factor,
        ) else {
            continue;
        };

        let Some(point_region) = upscale_region(
            &template,
            (point.x, point.y),
            (control_point_region_size, control_point_region_size),
            scale_factor,
        ) else {
            continue;
        };

        if search_region.nrows() < point_region.nrows()
            || search_region.ncols() < point_region.ncols()
        {
            continue;
        }

        let ccorr = normalized_cross_correlation(search_region.view(), point_region.view());

        let mut peak = f32::NEG_INFINITY;
        for &v in ccorr.iter() {
            if v > peak {
                peak = v;
            }
        }

        // Non-peak pool: every value not equal to the peak.
        let pool: Vec<f32> = ccorr.iter().copied().filter(|&v| v != peak).collect();
        if pool.is_empty() {
            continue;
        }
        let mean = pool.iter().sum::<f32>() / pool.len() as f32;
        let std = (pool.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>()
            / pool.len() as f32)
            .sqrt();
        let pool_max = pool.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        let t1 = peak >= 4.0 * std;
        let t2 = peak > pool_max + std;
        if !(t1 && t2) {
            continue;
        }

        // First peak position in row-major order.
        let (mut ty, mut tx) = (0usize, 0usize);
        'scan: for r in 0..ccorr.nrows() {
            for c in 0..ccorr.ncols() {
                if ccorr[[r, c]] == peak {
                    ty = r;
                    tx = c;
                    break 'scan;
                }
            }
        }

        pairs.push(
            [
                point.x + tx as f32 / scale_factor - size_gap,
                point.y + ty as f32 / scale_factor - size_gap,
            ],
            [point.x, point.y],
        );
    }

    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn impulse_field(rows: usize, cols: usize) -> (Array2<f32>, Vec<ControlPoint>) {
        let mut image = Array2::<f32>::zeros((rows, cols));
        let spots = [
            (20usize, 22usize),
            (30, 45),
            (44, 18),
            (25, 33),
            (40, 40),
            (15, 50),
            (50, 30),
            (35, 12),
        ];
        for &(r, c) in &spots {
            image[[r, c]] = 1.0;
            image[[r, c + 1]] = 0.6;
            image[[r + 1, c]] = 0.6;
        }
        let points = vec![
            ControlPoint { x: 22.0, y: 20.0 },
            ControlPoint { x: 45.0, y: 30.0 },
            ControlPoint { x: 18.0, y: 44.0 },
        ];
        (image, points)
    }

    #[test]
    fn upscale_region_clamps_to_border() {
        let image = Array2::from_shape_fn((20, 20), |(r, c)| (r * 20 + c) as f32);
        // Centered region, no clipping: 2*3+1 pixels per side.
        let full = upscale_region(&image, (10.0, 10.0), (3, 3), 1.0).unwrap();
        assert_eq!(full.dim(), (7, 7));
        // Near the corner the window clips.
        let clipped = upscale_region(&image, (1.0, 0.0), (3, 3), 1.0).unwrap();
        assert_eq!(clipped.dim(), (4, 5));
    }

    #[test]
    fn upscale_region_empty_window_is_none() {
        let image = Array2::<f32>::zeros((10, 10));
        assert!(upscale_region(&image, (-20.0, 5.0), (3, 3), 1.0).is_none());
    }

    #[test]
    fn upscale_region_scales_dimensions() {
        let image = Array2::from_elem((30, 30), 1.0f32);
        let region = upscale_region(&image, (15.0, 15.0), (4, 4), 2.0).unwrap();
        assert_eq!(region.dim(), (18, 18));
    }

    #[test]
    fn bicubic_preserves_constant_regions() {
        let image = Array2::from_elem((12, 12), 0.5f32);
        let out = resize_bicubic(image.view(), 3.0);
        for &v in out.iter() {
            assert!((v - 0.5).abs() < 1e-4);
        }
    }

    #[test]
    fn ncc_peak_at_embedded_offset() {
        let mut search = Array2::<f32>::zeros((20, 20));
        let template = Array2::from_shape_fn((5, 5), |(r, c)| ((r * 5 + c) as f32).sin() + 1.5);
        for r in 0..5 {
            for c in 0..5 {
                search[[7 + r, 11 + c]] = template[[r, c]];
            }
        }
        let ccorr = normalized_cross_correlation(search.view(), template.view());
        assert_eq!(ccorr.dim(), (16, 16));
        let mut best = (0usize, 0usize);
        let mut best_val = f32::NEG_INFINITY;
        for ((r, c), &v) in ccorr.indexed_iter() {
            if v > best_val {
                best_val = v;
                best = (r, c);
            }
        }
        assert_eq!(best, (7, 11));
        assert!((best_val - 1.0).abs() < 1e-4);
    }

    #[test]
    fn identical_images_match_at_same_coordinates() {
        let (image, points) = impulse_field(64, 64);
        let pairs =
            find_control_point_pairs(image.view(), image.view(), &points, 10, 5, 1.0);
        assert_eq!(pairs.len(), points.len());
        for (r, t) in pairs.reference.iter().zip(&pairs.template) {
            assert!(
                (r[0] - t[0]).abs() < 0.5 && (r[1] - t[1]).abs() < 0.5,
                "pair diverged: {:?} vs {:?}",
                r,
                t
            );
        }
    }

    #[test]
    fn translated_feature_is_recovered() {
        let (reference, _) = impulse_field(64, 64);
        // Template content shifted right/down by 2, so the reference match
        // for a template point sits 2 px up/left of it... shifted the other
        // way: reference = template shifted by (-2, -2).
        let mut template = Array2::<f32>::zeros((64, 64));
        for ((r, c), &v) in reference.indexed_iter() {
            if r + 2 < 64 && c + 2 < 64 {
                template[[r + 2, c + 2]] = v;
            }
        }
        let points = vec![ControlPoint { x: 24.0, y: 22.0 }];
        let pairs =
            find_control_point_pairs(reference.view(), template.view(), &points, 10, 5, 1.0);
        assert_eq!(pairs.len(), 1);
        let r = pairs.reference[0];
        assert!((r[0] - 22.0).abs() < 0.5, "x: {}", r[0]);
        assert!((r[1] - 20.0).abs() < 0.5, "y: {}", r[1]);
    }

    #[test]
    fn points_with_empty_windows_are_dropped() {
        let (image, mut points) = impulse_field(64, 64);
        let valid = points.len();
        // Control point mapped far outside the image: both windows clamp to
        // nothing and the point is skipped, shortening the output.
        points.push(ControlPoint { x: -30.0, y: -30.0 });
        let pairs =
            find_control_point_pairs(image.view(), image.view(), &points, 10, 5, 1.0);
        assert_eq!(pairs.len(), valid);
    }

    #[test]
    fn search_smaller_than_template_is_skipped() {
        let (image, points) = impulse_field(64, 64);
        // Radii inverted on purpose: every window pair fails the size check.
        let pairs =
            find_control_point_pairs(image.view(), image.view(), &points, 4, 8, 1.0);
        assert!(pairs.is_empty());
    }

    #[test]
    fn output_arrays_stay_parallel() {
        let (image, points) = impulse_field(64, 64);
        let pairs =
            find_control_point_pairs(image.view(), image.view(), &points, 10, 5, 1.0);
        assert_eq!(pairs.reference.len(), pairs.template.len());
    }
}
