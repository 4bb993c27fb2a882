//! Robust bilinear warp fitting.
//!
//! Fits `out = a + b*x + c*y + d*x*y` independently per output axis over
//! normalized template coordinates, then tightens a geometric residual
//! threshold ladder, refitting on the surviving points at each step. The last
//! threshold that still kept more than four points per axis is the fitness:
//! lower means a tighter fit. Progressive trimming trades RANSAC-level
//! robustness for lower cost on small, moderately noisy correspondence sets.

/// Coefficients of the bilinear model for one output axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BilinearCoeffs {
    pub a: f32,
    pub b: f32,
    pub c: f32,
    pub d: f32,
}

impl BilinearCoeffs {
    /// Evaluate the model at normalized coordinates.
    #[inline]
    pub fn eval(&self, x: f32, y: f32) -> f32 {
        self.a + self.b * x + self.c * y + self.d * x * y
    }
}

/// Result of a progressive-trimming fit. `fitness == -1.0` signals failure,
/// in which case no coefficients are present.
#[derive(Debug, Clone)]
pub struct BilinearFit {
    pub fitness: f32,
    pub point_count: usize,
    pub x_coeffs: Option<BilinearCoeffs>,
    pub y_coeffs: Option<BilinearCoeffs>,
}

impl BilinearFit {
    pub fn failure() -> Self {
        Self {
            fitness: -1.0,
            point_count: 0,
            x_coeffs: None,
            y_coeffs: None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.fitness < 0.0
    }
}

/// Solve a 4x4 linear system by Gaussian elimination with partial pivoting.
fn solve4(mut m: [[f64; 4]; 4], mut b: [f64; 4]) -> Option<[f64; 4]> {
    for col in 0..4 {
        let mut pivot = col;
        for row in col + 1..4 {
            if m[row][col].abs() > m[pivot][col].abs() {
                pivot = row;
            }
        }
        if m[pivot][col].abs() < 1e-12 {
            return None;
        }
        m.swap(col, pivot);
        b.swap(col, pivot);

        for row in col + 1..4 {
            let f = m[row][col] / m[col][col];
            for k in col..4 {
                m[row][k] -= f * m[col][k];
            }
            b[row] -= f * b[col];
        }
    }

    let mut x = [0.0f64; 4];
    for row in (0..4).rev() {
        let mut acc = b[row];
        for k in row + 1..4 {
            acc -= m[row][k] * x[k];
        }
        x[row] = acc / m[row][row];
    }
    Some(x)
}

/// Unconstrained least squares of the bilinear basis over the given subset of
/// points, via the 4x4 normal equations.
fn fit_axis(x: &[f32], y: &[f32], target: &[f32], indices: &[usize]) -> Option<BilinearCoeffs> {
    let mut ata = [[0.0f64; 4]; 4];
    let mut atb = [0.0f64; 4];

    for &i in indices {
        let basis = [1.0f64, x[i] as f64, y[i] as f64, (x[i] * y[i]) as f64];
        let t = target[i] as f64;
        for r in 0..4 {
            for c in 0..4 {
                ata[r][c] += basis[r] * basis[c];
            }
            atb[r] += basis[r] * t;
        }
    }

    let sol = solve4(ata, atb)?;
    Some(BilinearCoeffs {
        a: sol[0] as f32,
        b: sol[1] as f32,
        c: sol[2] as f32,
        d: sol[3] as f32,
    })
}

fn disparities(x: &[f32], y: &[f32], target: &[f32], coeffs: &BilinearCoeffs) -> Vec<f32> {
    x.iter()
        .zip(y)
        .zip(target)
        .map(|((&px, &py), &t)| (coeffs.eval(px, py) - t).abs())
        .collect()
}

/// Geometric sequence from 20 down to `end` over `steps` values, endpoints
/// inclusive.
fn threshold_ladder(end: f32, steps: usize) -> Vec<f32> {
    const START: f32 = 20.0;
    if steps <= 1 {
        return vec![START];
    }
    let ratio = (end / START).powf(1.0 / (steps - 1) as f32);
    (0..steps).map(|i| START * ratio.powi(i as i32)).collect()
}

/// Fit the bilinear model to both axes with progressive residual trimming.
///
/// `x`/`y` are normalized template coordinates, `target_x`/`target_y` the
/// matched reference coordinates, all index-aligned. Fails (sentinel result)
/// when fewer than five points are given, when there is no target data, or
/// when even the widest threshold keeps four or fewer points on either axis.
pub fn fit(
    x: &[f32],
    y: &[f32],
    target_x: &[f32],
    target_y: &[f32],
    iterations: usize,
    threshold: f32,
) -> BilinearFit {
    if x.len() <= 4 || y.len() <= 4 || target_x.is_empty() || target_y.is_empty() {
        return BilinearFit::failure();
    }

    let all: Vec<usize> = (0..x.len()).collect();
    let (mut xc, mut yc) = match (
        fit_axis(x, y, target_x, &all),
        fit_axis(x, y, target_y, &all),
    ) {
        (Some(a), Some(b)) => (a, b),
        _ => return BilinearFit::failure(),
    };

    let mut xdisp = disparities(x, y, target_x, &xc);
    let mut ydisp = disparities(x, y, target_y, &yc);

    let mut fitness = -1.0f32;
    let mut point_count = 0usize;

    for t in threshold_ladder(threshold, iterations) {
        let xi: Vec<usize> = (0..x.len()).filter(|&i| xdisp[i] < t).collect();
        let yi: Vec<usize> = (0..y.len()).filter(|&i| ydisp[i] < t).collect();
        if xi.len() <= 4 || yi.len() <= 4 {
            break;
        }

        fitness = t;
        point_count = xi.len();

        let (nxc, nyc) = match (fit_axis(x, y, target_x, &xi), fit_axis(x, y, target_y, &yi)) {
            (Some(a), Some(b)) => (a, b),
            _ => break,
        };
        xc = nxc;
        yc = nyc;

        xdisp = disparities(x, y, target_x, &xc);
        ydisp = disparities(x, y, target_y, &yc);
    }

    if fitness < 0.0 {
        return BilinearFit::failure();
    }

    BilinearFit {
        fitness,
        point_count,
        x_coeffs: Some(xc),
        y_coeffs: Some(yc),
    }
}
