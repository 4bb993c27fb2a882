//! Non-rigid resampling of a fitted bilinear warp.
//!
//! Forward-maps every source pixel through the per-axis bilinear models and
//! splats it into an RGBA accumulation buffer with bilinear weights, then
//! normalizes by the accumulated weight. Pixels no source sample reaches stay
//! zero, fully transparent.

use ndarray::{Array3, ArrayView3};

use crate::bilinear::BilinearCoeffs;

/// Deform an RGB or RGBA image with the fitted bilinear maps.
///
/// The models take normalized source coordinates in [-0.5, 0.5] and produce
/// destination pixel positions; the output buffer has the source extent and
/// always four channels. RGB input gains an opaque alpha channel before
/// splatting so coverage shows up in the output alpha.
pub fn deform_image(
    image: ArrayView3<'_, f32>,
    x_coeffs: &BilinearCoeffs,
    y_coeffs: &BilinearCoeffs,
) -> Array3<f32> {
    let (rows, cols, channels) = image.dim();
    let mut accum = Array3::<f32>::zeros((rows, cols, 4));
    let mut weight = ndarray::Array2::<f32>::zeros((rows, cols));
    if rows == 0 || cols == 0 {
        return accum;
    }

    for r in 0..rows {
        for c in 0..cols {
            let xn = c as f32 / cols as f32 - 0.5;
            let yn = r as f32 / rows as f32 - 0.5;
            let dx = x_coeffs.eval(xn, yn);
            let dy = y_coeffs.eval(xn, yn);
            if !dx.is_finite() || !dy.is_finite() {
                continue;
            }

            let x0 = dx.floor();
            let y0 = dy.floor();
            let fx = dx - x0;
            let fy = dy - y0;

            let mut pixel = [0.0f32; 4];
            for ch in 0..channels.min(4) {
                pixel[ch] = image[[r, c, ch]];
            }
            if channels == 3 {
                pixel[3] = 1.0;
            }

            for (dr, dc, w) in [
                (0i64, 0i64, (1.0 - fy) * (1.0 - fx)),
                (0, 1, (1.0 - fy) * fx),
                (1, 0, fy * (1.0 - fx)),
                (1, 1, fy * fx),
            ] {
                let tr = y0 as i64 + dr;
                let tc = x0 as i64 + dc;
                if w <= 0.0 || tr < 0 || tc < 0 || tr >= rows as i64 || tc >= cols as i64 {
                    continue;
                }
                let (tr, tc) = (tr as usize, tc as usize);
                for ch in 0..4 {
                    accum[[tr, tc, ch]] += pixel[ch] * w;
                }
                weight[[tr, tc]] += w;
            }
        }
    }

    for r in 0..rows {
        for c in 0..cols {
            let w = weight[[r, c]];
            if w > 1e-6 {
                for ch in 0..4 {
                    accum[[r, c, ch]] /= w;
                }
            }
        }
    }

    accum
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    /// Identity in pixel space: x = w*(xn + 0.5), y = h*(yn + 0.5).
    fn identity_coeffs(rows: usize, cols: usize) -> (BilinearCoeffs, BilinearCoeffs) {
        let x = BilinearCoeffs {
            a: 0.5 * cols as f32,
            b: cols as f32,
            c: 0.0,
            d: 0.0,
        };
        let y = BilinearCoeffs {
            a: 0.5 * rows as f32,
            b: 0.0,
            c: rows as f32,
            d: 0.0,
        };
        (x, y)
    }

    fn gradient_rgb(rows: usize, cols: usize) -> Array3<f32> {
        Array3::from_shape_fn((rows, cols, 3), |(r, c, ch)| {
            (r * cols + c) as f32 * 0.01 + ch as f32
        })
    }

    #[test]
    fn identity_map_preserves_image() {
        let image = gradient_rgb(20, 30);
        let (cx, cy) = identity_coeffs(20, 30);
        let out = deform_image(image.view(), &cx, &cy);
        assert_eq!(out.dim(), (20, 30, 4));
        for r in 0..20 {
            for c in 0..30 {
                for ch in 0..3 {
                    assert!(
                        (out[[r, c, ch]] - image[[r, c, ch]]).abs() < 1e-3,
                        "pixel ({}, {}, {}) changed",
                        r,
                        c,
                        ch
                    );
                }
                assert!((out[[r, c, 3]] - 1.0).abs() < 1e-3, "alpha not opaque");
            }
        }
    }

    #[test]
    fn translation_moves_and_leaves_transparent_border() {
        let image = gradient_rgb(20, 20);
        let (mut cx, cy) = identity_coeffs(20, 20);
        cx.a += 6.0;
        let out = deform_image(image.view(), &cx, &cy);
        // Shifted content.
        assert!((out[[10, 10 + 6, 0]] - image[[10, 10, 0]]).abs() < 1e-3);
        // Columns nothing maps into are fully transparent zeros.
        for r in 0..20 {
            for ch in 0..4 {
                assert_eq!(out[[r, 0, ch]], 0.0);
            }
        }
    }

    #[test]
    fn rgba_alpha_is_carried_through() {
        let mut image = Array3::<f32>::zeros((10, 10, 4));
        image[[4, 4, 0]] = 1.0;
        image[[4, 4, 3]] = 0.25;
        let (cx, cy) = identity_coeffs(10, 10);
        let out = deform_image(image.view(), &cx, &cy);
        assert!((out[[4, 4, 3]] - 0.25).abs() < 1e-3);
    }

    #[test]
    fn off_canvas_map_yields_empty_output() {
        let image = gradient_rgb(8, 8);
        let far = BilinearCoeffs {
            a: 1000.0,
            b: 0.0,
            c: 0.0,
            d: 0.0,
        };
        let out = deform_image(image.view(), &far, &far);
        assert!(out.iter().all(|&v| v == 0.0));
    }
}
