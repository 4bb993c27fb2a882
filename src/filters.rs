//! Separable box filter bank producing the wavelet-modulus feature map.
//!
//! The filters are normalized box kernels of length `2 * order`; the highpass
//! variant negates the first half of the taps. Combining low-then-high and
//! high-then-low responses across both axes in quadrature yields a
//! scale-selective feature density map: larger `order` responds to coarser
//! features.

use ndarray::{Array2, ArrayView2, Axis};

/// Reflect-101 border indexing (`dcb|abcd|cba`).
#[inline]
fn reflect(mut i: isize, n: isize) -> usize {
    if n == 1 {
        return 0;
    }
    loop {
        if i < 0 {
            i = -i;
        } else if i >= n {
            i = 2 * (n - 1) - i;
        } else {
            return i as usize;
        }
    }
}

/// Correlate `image` with a 1-D kernel along `axis`, anchor at `taps.len() / 2`.
fn correlate_1d(image: ArrayView2<'_, f32>, taps: &[f32], axis: Axis) -> Array2<f32> {
    let (rows, cols) = image.dim();
    let anchor = taps.len() as isize / 2;
    let mut out = Array2::<f32>::zeros((rows, cols));

    match axis {
        Axis(0) => {
            for c in 0..cols {
                for r in 0..rows {
                    let mut acc = 0.0f32;
                    for (k, &t) in taps.iter().enumerate() {
                        let src = reflect(r as isize + k as isize - anchor, rows as isize);
                        acc += t * image[[src, c]];
                    }
                    out[[r, c]] = acc;
                }
            }
        }
        _ => {
            for r in 0..rows {
                for c in 0..cols {
                    let mut acc = 0.0f32;
                    for (k, &t) in taps.iter().enumerate() {
                        let src = reflect(c as isize + k as isize - anchor, cols as isize);
                        acc += t * image[[r, src]];
                    }
                    out[[r, c]] = acc;
                }
            }
        }
    }

    out
}

fn box_taps(order: usize) -> Vec<f32> {
    let len = 2 * order.max(1);
    vec![1.0 / len as f32; len]
}

/// Lowpass box filter of the given order along `axis`.
pub fn lowpass(order: usize, image: ArrayView2<'_, f32>, axis: Axis) -> Array2<f32> {
    correlate_1d(image, &box_taps(order), axis)
}

/// Highpass box filter: the first half of the taps is negated, so the kernel
/// sums to zero and constant regions vanish.
pub fn highpass(order: usize, image: ArrayView2<'_, f32>, axis: Axis) -> Array2<f32> {
    let mut taps = box_taps(order);
    let half = taps.len() / 2;
    for t in &mut taps[..half] {
        *t = -*t;
    }
    correlate_1d(image, &taps, axis)
}

/// Modulus of the wavelet transform of `image` at the given filter order.
///
/// Combines the two mixed low/high responses in quadrature:
/// `sqrt(HxLy^2 + LxHy^2)`. Output shape matches the input; every value is
/// non-negative.
pub fn compute_modulus(image: ArrayView2<'_, f32>, order: usize) -> Array2<f32> {
    let hl = highpass(order, lowpass(order, image, Axis(1)).view(), Axis(0));
    let lh = lowpass(order, highpass(order, image, Axis(1)).view(), Axis(0));

    let mut out = hl;
    out.zip_mut_with(&lh, |a, &b| *a = a.hypot(b));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn approx_eq(a: f32, b: f32, eps: f32) -> bool {
        (a - b).abs() < eps
    }

    fn checkerboard(rows: usize, cols: usize, cell: usize) -> Array2<f32> {
        Array2::from_shape_fn((rows, cols), |(r, c)| {
            if (r / cell + c / cell) % 2 == 0 {
                1.0
            } else {
                0.0
            }
        })
    }

    #[test]
    fn lowpass_preserves_constant() {
        let image = Array2::from_elem((16, 16), 3.5f32);
        for axis in [Axis(0), Axis(1)] {
            let out = lowpass(3, image.view(), axis);
            assert_eq!(out.dim(), (16, 16));
            for &v in out.iter() {
                assert!(approx_eq(v, 3.5, 1e-5), "expected 3.5, got {}", v);
            }
        }
    }

    #[test]
    fn highpass_kills_constant() {
        let image = Array2::from_elem((16, 16), 3.5f32);
        for axis in [Axis(0), Axis(1)] {
            let out = highpass(3, image.view(), axis);
            for &v in out.iter() {
                assert!(v.abs() < 1e-5, "expected 0, got {}", v);
            }
        }
    }

    #[test]
    fn highpass_responds_to_edges() {
        let mut image = Array2::<f32>::zeros((16, 16));
        for r in 8..16 {
            for c in 0..16 {
                image[[r, c]] = 1.0;
            }
        }
        let out = highpass(3, image.view(), Axis(0));
        let max = out.iter().copied().fold(0.0f32, f32::max);
        assert!(max > 0.1, "edge response too weak: {}", max);
    }

    #[test]
    fn modulus_shape_matches_input() {
        let image = checkerboard(24, 30, 4);
        let out = compute_modulus(image.view(), 3);
        assert_eq!(out.dim(), image.dim());
    }

    #[test]
    fn modulus_non_negative_everywhere() {
        let image = checkerboard(32, 32, 5);
        for order in [3, 4, 6] {
            let out = compute_modulus(image.view(), order);
            for &v in out.iter() {
                assert!(v >= 0.0, "negative modulus value {}", v);
            }
        }
    }

    #[test]
    fn modulus_flat_input_is_zero() {
        let image = Array2::from_elem((20, 20), 0.7f32);
        let out = compute_modulus(image.view(), 3);
        for &v in out.iter() {
            assert!(v < 1e-5, "flat image should have zero modulus, got {}", v);
        }
    }

    #[test]
    fn modulus_peaks_on_texture() {
        let image = checkerboard(32, 32, 4);
        let out = compute_modulus(image.view(), 3);
        let max = out.iter().copied().fold(0.0f32, f32::max);
        assert!(max > 0.05, "texture should produce a response, max {}", max);
    }
}
