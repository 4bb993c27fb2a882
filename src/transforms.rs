//! 2D DFT helpers built on rustfft: planned row/column transforms, optimal
//! transform sizes, and the phase-only image reconstruction used by the
//! correlation matcher.

use ndarray::{Array2, ArrayView2};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use std::sync::Arc;

/// Forward and inverse plans for one (rows, cols) transform size.
pub struct DftPlans {
    fwd_row: Arc<dyn Fft<f32>>,
    fwd_col: Arc<dyn Fft<f32>>,
    inv_row: Arc<dyn Fft<f32>>,
    inv_col: Arc<dyn Fft<f32>>,
}

impl DftPlans {
    pub fn new(rows: usize, cols: usize) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        Self {
            fwd_row: planner.plan_fft_forward(cols),
            fwd_col: planner.plan_fft_forward(rows),
            inv_row: planner.plan_fft_inverse(cols),
            inv_col: planner.plan_fft_inverse(rows),
        }
    }
}

/// Smallest size >= `n` whose prime factors are all in {2, 3, 5}, so the DFT
/// decomposes into fast radix passes.
pub fn optimal_dft_size(n: usize) -> usize {
    let mut m = n.max(1);
    loop {
        let mut k = m;
        for f in [2usize, 3, 5] {
            while k % f == 0 {
                k /= f;
            }
        }
        if k == 1 {
            return m;
        }
        m += 1;
    }
}

/// Unnormalized 2D FFT of a real array: rows first, then columns.
pub fn fft2d(input: ArrayView2<'_, f32>, plans: &DftPlans) -> Array2<Complex<f32>> {
    let (rows, cols) = input.dim();

    let mut intermediate = Array2::<Complex<f32>>::zeros((rows, cols));
    let mut row_vec = vec![Complex::new(0.0f32, 0.0); cols];
    for r in 0..rows {
        for (c, &v) in input.row(r).iter().enumerate() {
            row_vec[c] = Complex::new(v, 0.0);
        }
        plans.fwd_row.process(&mut row_vec);
        for c in 0..cols {
            intermediate[[r, c]] = row_vec[c];
        }
    }

    let mut output = Array2::<Complex<f32>>::zeros((rows, cols));
    let mut col_vec = vec![Complex::new(0.0f32, 0.0); rows];
    for c in 0..cols {
        for r in 0..rows {
            col_vec[r] = intermediate[[r, c]];
        }
        plans.fwd_col.process(&mut col_vec);
        for r in 0..rows {
            output[[r, c]] = col_vec[r];
        }
    }

    output
}

/// 2D inverse FFT, normalized by `1 / (rows * cols)`. Returns the complex
/// result; the phase-only reconstruction needs its magnitude, not just the
/// real part.
pub fn ifft2d(input: &Array2<Complex<f32>>, plans: &DftPlans) -> Array2<Complex<f32>> {
    let (rows, cols) = input.dim();

    let mut intermediate = input.clone();
    let mut col_vec = vec![Complex::new(0.0f32, 0.0); rows];
    for c in 0..cols {
        for r in 0..rows {
            col_vec[r] = intermediate[[r, c]];
        }
        plans.inv_col.process(&mut col_vec);
        for r in 0..rows {
            intermediate[[r, c]] = col_vec[r];
        }
    }

    let norm = 1.0 / (rows * cols) as f32;
    let mut output = Array2::<Complex<f32>>::zeros((rows, cols));
    let mut row_vec = vec![Complex::new(0.0f32, 0.0); cols];
    for r in 0..rows {
        for c in 0..cols {
            row_vec[c] = intermediate[[r, c]];
        }
        plans.inv_row.process(&mut row_vec);
        for c in 0..cols {
            output[[r, c]] = row_vec[c] * norm;
        }
    }

    output
}

/// Phase-only reconstruction of an image: forward transform, unit-magnitude
/// normalization of every bin, inverse transform, per-pixel magnitude.
///
/// Discarding the spectrum magnitude suppresses contrast and illumination
/// differences and emphasizes structural edges. A zero bin keeps phase 0,
/// i.e. becomes the unit phasor 1+0i.
pub fn phase_only(image: ArrayView2<'_, f32>) -> Array2<f32> {
    let (rows, cols) = image.dim();
    let plans = DftPlans::new(rows, cols);

    let mut spectrum = fft2d(image, &plans);
    for bin in spectrum.iter_mut() {
        let angle = bin.im.atan2(bin.re);
        *bin = Complex::new(angle.cos(), angle.sin());
    }

    ifft2d(&spectrum, &plans).mapv(|c| c.norm())
}
