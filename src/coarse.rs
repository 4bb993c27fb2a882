//! Coarse affine bootstrap from keypoint matches.
//!
//! Detects corner keypoints over a small image pyramid, describes them with
//! oriented binary tests, matches template descriptors to reference
//! descriptors with a k-NN ratio ranking, and fits a robust 2D affine
//! transform on the best-ranked survivors. The result only needs to be good
//! enough to bootstrap the local phase-correlation search, while tolerating
//! scale and rotation drift between layers.

use ndarray::{Array2, ArrayView2};
use rand::rngs::StdRng;
use rand::Rng;
use std::cmp::Ordering;
use std::sync::OnceLock;

/// 2x3 affine matrix; `out = M * (x, y, 1)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineTransform(pub [[f32; 3]; 2]);

impl AffineTransform {
    pub fn identity() -> Self {
        Self([[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]])
    }

    /// Full transform including translation.
    #[inline]
    pub fn apply(&self, x: f32, y: f32) -> (f32, f32) {
        let m = &self.0;
        (
            m[0][0] * x + m[0][1] * y + m[0][2],
            m[1][0] * x + m[1][1] * y + m[1][2],
        )
    }

    /// Linear part only; used to carry control points into warped space.
    #[inline]
    pub fn apply_linear(&self, x: f32, y: f32) -> (f32, f32) {
        let m = &self.0;
        (m[0][0] * x + m[0][1] * y, m[1][0] * x + m[1][1] * y)
    }

    pub fn translation(&self) -> (f32, f32) {
        (self.0[0][2], self.0[1][2])
    }

    /// Inverse transform, if the linear part is non-singular.
    pub fn invert(&self) -> Option<AffineTransform> {
        let m = &self.0;
        let det = m[0][0] * m[1][1] - m[0][1] * m[1][0];
        if det.abs() < 1e-9 {
            return None;
        }
        let inv = [
            [m[1][1] / det, -m[0][1] / det],
            [-m[1][0] / det, m[0][0] / det],
        ];
        let tx = -(inv[0][0] * m[0][2] + inv[0][1] * m[1][2]);
        let ty = -(inv[1][0] * m[0][2] + inv[1][1] * m[1][2]);
        Some(AffineTransform([
            [inv[0][0], inv[0][1], tx],
            [inv[1][0], inv[1][1], ty],
        ]))
    }
}

#[derive(Debug, Clone, Copy)]
struct Keypoint {
    /// Full-resolution coordinates.
    x: f32,
    y: f32,
    /// Level coordinates and cumulative pyramid scale, for description.
    level_x: f32,
    level_y: f32,
    scale: f32,
    response: f32,
    angle: f32,
    level: usize,
}

type Descriptor = [u8; 32];

const FAST_RADIUS: isize = 3;
const FAST_THRESHOLD: f32 = 20.0;
const FAST_ARC: usize = 12;
const MAX_KEYPOINTS: usize = 500;
const PYRAMID_FACTOR: f32 = 1.5;
const PYRAMID_LEVELS: usize = 4;
const MIN_LEVEL_SIDE: usize = 40;
const RANSAC_ITERATIONS: usize = 500;
const RANSAC_THRESHOLD_PX: f32 = 3.0;

/// Bresenham circle of radius 3, 16 points, clockwise from north.
const FAST_CIRCLE: [(isize, isize); 16] = [
    (0, -3),
    (1, -3),
    (2, -2),
    (3, -1),
    (3, 0),
    (3, 1),
    (2, 2),
    (1, 3),
    (0, 3),
    (-1, 3),
    (-2, 2),
    (-3, 1),
    (-3, 0),
    (-3, -1),
    (-2, -2),
    (-1, -3),
];

/// Deterministic set of 256 binary intensity tests in a 31x31 patch.
fn test_pattern() -> &'static [(i8, i8, i8, i8)] {
    static PATTERN: OnceLock<Vec<(i8, i8, i8, i8)>> = OnceLock::new();
    PATTERN.get_or_init(|| {
        let mut state = 0x1234_5678_9abc_def0u64;
        let mut next = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
            ((state >> 40) as i32 % 27 - 13) as i8
        };
        (0..256).map(|_| (next(), next(), next(), next())).collect()
    })
}

/// Rescale to [0, 255]; constant images map to all-zero.
fn normalized_gray(image: ArrayView2<'_, f32>) -> Array2<f32> {
    let min = image.iter().copied().fold(f32::INFINITY, f32::min);
    let max = image.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    if !range.is_finite() || range <= 1e-12 {
        return Array2::zeros(image.raw_dim());
    }
    image.mapv(|v| (v - min) / range * 255.0)
}

fn resize_half_step(image: &Array2<f32>, factor: f32) -> Array2<f32> {
    let (rows, cols) = image.dim();
    let new_rows = (rows as f32 / factor) as usize;
    let new_cols = (cols as f32 / factor) as usize;
    Array2::from_shape_fn((new_rows, new_cols), |(r, c)| {
        let sy = (r as f32 + 0.5) * factor - 0.5;
        let sx = (c as f32 + 0.5) * factor - 0.5;
        let y0 = sy.floor().max(0.0) as usize;
        let x0 = sx.floor().max(0.0) as usize;
        let y1 = (y0 + 1).min(rows - 1);
        let x1 = (x0 + 1).min(cols - 1);
        let fy = (sy - y0 as f32).clamp(0.0, 1.0);
        let fx = (sx - x0 as f32).clamp(0.0, 1.0);
        image[[y0, x0]] * (1.0 - fy) * (1.0 - fx)
            + image[[y0, x1]] * (1.0 - fy) * fx
            + image[[y1, x0]] * fy * (1.0 - fx)
            + image[[y1, x1]] * fy * fx
    })
}

fn build_pyramid(gray: &Array2<f32>) -> Vec<(Array2<f32>, f32)> {
    let mut pyramid = vec![(gray.clone(), 1.0f32)];
    let mut scale = 1.0f32;
    for _ in 1..PYRAMID_LEVELS {
        let (rows, cols) = pyramid.last().unwrap().0.dim();
        if rows / 2 < MIN_LEVEL_SIDE || cols / 2 < MIN_LEVEL_SIDE {
            break;
        }
        let next = resize_half_step(&pyramid.last().unwrap().0, PYRAMID_FACTOR);
        if next.nrows() < MIN_LEVEL_SIDE || next.ncols() < MIN_LEVEL_SIDE {
            break;
        }
        scale *= PYRAMID_FACTOR;
        pyramid.push((next, scale));
    }
    pyramid
}

fn is_corner(image: &Array2<f32>, x: isize, y: isize) -> Option<f32> {
    let center = image[[y as usize, x as usize]];
    let bright = center + FAST_THRESHOLD;
    let dark = center - FAST_THRESHOLD;

    // Cardinal pre-check rejects most candidates cheaply.
    let cardinals = [
        image[[(y - 3) as usize, x as usize]],
        image[[y as usize, (x + 3) as usize]],
        image[[(y + 3) as usize, x as usize]],
        image[[y as usize, (x - 3) as usize]],
    ];
    let pre_bright = cardinals.iter().filter(|&&p| p > bright).count();
    let pre_dark = cardinals.iter().filter(|&&p| p < dark).count();
    if pre_bright < 3 && pre_dark < 3 {
        return None;
    }

    let mut brighter = 0usize;
    let mut darker = 0usize;
    let mut response = 0.0f32;
    for &(dx, dy) in &FAST_CIRCLE {
        let p = image[[(y + dy) as usize, (x + dx) as usize]];
        if p > bright {
            brighter += 1;
        } else if p < dark {
            darker += 1;
        }
        response += (p - center).abs();
    }
    if brighter >= FAST_ARC || darker >= FAST_ARC {
        Some(response)
    } else {
        None
    }
}

/// Orientation from the intensity centroid of a 7x7 patch.
fn orientation(image: &Array2<f32>, x: isize, y: isize) -> f32 {
    let (rows, cols) = image.dim();
    let mut m10 = 0.0f32;
    let mut m01 = 0.0f32;
    for dy in -3isize..=3 {
        for dx in -3isize..=3 {
            let yy = y + dy;
            let xx = x + dx;
            if yy < 0 || yy >= rows as isize || xx < 0 || xx >= cols as isize {
                continue;
            }
            let v = image[[yy as usize, xx as usize]];
            m10 += dx as f32 * v;
            m01 += dy as f32 * v;
        }
    }
    m01.atan2(m10)
}

fn detect_level(
    image: &Array2<f32>,
    scale: f32,
    level: usize,
    mask: Option<ArrayView2<'_, f32>>,
) -> Vec<Keypoint> {
    let (rows, cols) = image.dim();
    if rows <= 2 * FAST_RADIUS as usize || cols <= 2 * FAST_RADIUS as usize {
        return Vec::new();
    }

    let mut keypoints = Vec::new();
    for y in FAST_RADIUS..rows as isize - FAST_RADIUS {
        for x in FAST_RADIUS..cols as isize - FAST_RADIUS {
            let full_x = x as f32 * scale;
            let full_y = y as f32 * scale;
            if let Some(mask) = mask {
                let mr = (full_y as usize).min(mask.nrows().saturating_sub(1));
                let mc = (full_x as usize).min(mask.ncols().saturating_sub(1));
                if mask[[mr, mc]] <= 0.0 {
                    continue;
                }
            }
            if let Some(response) = is_corner(image, x, y) {
                keypoints.push(Keypoint {
                    x: full_x,
                    y: full_y,
                    level_x: x as f32,
                    level_y: y as f32,
                    scale,
                    response,
                    angle: orientation(image, x, y),
                    level,
                });
            }
        }
    }
    keypoints
}

/// Grid-based non-maximum suppression keeping the strongest corners.
fn suppress(mut keypoints: Vec<Keypoint>) -> Vec<Keypoint> {
    keypoints.sort_by(|a, b| {
        b.response
            .partial_cmp(&a.response)
            .unwrap_or(Ordering::Equal)
    });

    let cell = 5.0f32;
    let mut occupied = std::collections::HashSet::new();
    let mut selected = Vec::new();
    for kp in keypoints {
        let gx = (kp.x / cell) as i32;
        let gy = (kp.y / cell) as i32;
        let mut blocked = false;
        'grid: for dy in -1..=1 {
            for dx in -1..=1 {
                if occupied.contains(&(gx + dx, gy + dy)) {
                    blocked = true;
                    break 'grid;
                }
            }
        }
        if !blocked {
            occupied.insert((gx, gy));
            selected.push(kp);
            if selected.len() >= MAX_KEYPOINTS {
                break;
            }
        }
    }
    selected
}

fn describe(image: &Array2<f32>, kp: &Keypoint) -> Descriptor {
    let (rows, cols) = image.dim();
    let (sin, cos) = kp.angle.sin_cos();
    let sample = |dx: i8, dy: i8| -> f32 {
        let rx = (dx as f32 * cos - dy as f32 * sin).round() as isize;
        let ry = (dx as f32 * sin + dy as f32 * cos).round() as isize;
        let x = (kp.level_x as isize + rx).clamp(0, cols as isize - 1);
        let y = (kp.level_y as isize + ry).clamp(0, rows as isize - 1);
        image[[y as usize, x as usize]]
    };

    let mut descriptor = [0u8; 32];
    for (i, &(x1, y1, x2, y2)) in test_pattern().iter().enumerate() {
        if sample(x1, y1) < sample(x2, y2) {
            descriptor[i / 8] |= 1 << (i % 8);
        }
    }
    descriptor
}

fn detect_and_describe(
    gray: ArrayView2<'_, f32>,
    mask: Option<ArrayView2<'_, f32>>,
) -> (Vec<Keypoint>, Vec<Descriptor>) {
    let normalized = normalized_gray(gray);
    let pyramid = build_pyramid(&normalized);

    let mut all = Vec::new();
    for (level, (image, scale)) in pyramid.iter().enumerate() {
        all.extend(detect_level(image, *scale, level, mask));
    }
    let keypoints = suppress(all);

    let descriptors = keypoints
        .iter()
        .map(|kp| describe(&pyramid[kp.level].0, kp))
        .collect();
    (keypoints, descriptors)
}

#[inline]
fn hamming(a: &Descriptor, b: &Descriptor) -> u32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x ^ y).count_ones())
        .sum()
}

struct RatioMatch {
    query: usize,
    train: usize,
    ratio: f32,
}

/// k-NN (k = 3) match template descriptors against reference descriptors,
/// ranked ascending by the best/second-best distance ratio, keeping the top
/// `clamp(0.15 * n, 8, 48)`.
fn ratio_matches(template: &[Descriptor], reference: &[Descriptor]) -> Vec<RatioMatch> {
    if reference.len() < 3 {
        return Vec::new();
    }

    let mut matches: Vec<RatioMatch> = template
        .iter()
        .enumerate()
        .map(|(query, desc)| {
            // Three nearest neighbors by Hamming distance.
            let mut best = [(u32::MAX, usize::MAX); 3];
            for (train, other) in reference.iter().enumerate() {
                let d = hamming(desc, other);
                if d < best[2].0 {
                    best[2] = (d, train);
                    if best[2].0 < best[1].0 {
                        best.swap(1, 2);
                    }
                    if best[1].0 < best[0].0 {
                        best.swap(0, 1);
                    }
                }
            }
            let ratio = if best[1].0 > 0 {
                best[0].0 as f32 / best[1].0 as f32
            } else {
                1.0
            };
            RatioMatch {
                query,
                train: best[0].1,
                ratio,
            }
        })
        .collect();

    matches.sort_by(|a, b| a.ratio.partial_cmp(&b.ratio).unwrap_or(Ordering::Equal));
    let keep = ((matches.len() as f32 * 0.15) as usize).clamp(8, 48);
    matches.truncate(keep);
    matches
}

fn solve3(mut m: [[f64; 3]; 3], mut b: [f64; 3]) -> Option<[f64; 3]> {
    for col in 0..3 {
        let mut pivot = col;
        for row in col + 1..3 {
            if m[row][col].abs() > m[pivot][col].abs() {
                pivot = row;
            }
        }
        if m[pivot][col].abs() < 1e-12 {
            return None;
        }
        m.swap(col, pivot);
        b.swap(col, pivot);
        for row in col + 1..3 {
            let f = m[row][col] / m[col][col];
            for k in col..3 {
                m[row][k] -= f * m[col][k];
            }
            b[row] -= f * b[col];
        }
    }
    let mut x = [0.0f64; 3];
    for row in (0..3).rev() {
        let mut acc = b[row];
        for k in row + 1..3 {
            acc -= m[row][k] * x[k];
        }
        x[row] = acc / m[row][row];
    }
    Some(x)
}

/// Exact affine from three correspondences.
fn affine_from_three(
    from: &[(f32, f32)],
    to: &[(f32, f32)],
    idx: [usize; 3],
) -> Option<AffineTransform> {
    let mut m = [[0.0f64; 3]; 3];
    let mut bx = [0.0f64; 3];
    let mut by = [0.0f64; 3];
    for (row, &i) in idx.iter().enumerate() {
        m[row] = [from[i].0 as f64, from[i].1 as f64, 1.0];
        bx[row] = to[i].0 as f64;
        by[row] = to[i].1 as f64;
    }

    // Collinear samples have no unique affine.
    let area = (m[1][0] - m[0][0]) * (m[2][1] - m[0][1])
        - (m[2][0] - m[0][0]) * (m[1][1] - m[0][1]);
    if area.abs() < 1e-6 {
        return None;
    }

    let rx = solve3(m, bx)?;
    let ry = solve3(m, by)?;
    Some(AffineTransform([
        [rx[0] as f32, rx[1] as f32, rx[2] as f32],
        [ry[0] as f32, ry[1] as f32, ry[2] as f32],
    ]))
}

/// Least-squares affine over a set of correspondences.
fn affine_least_squares(
    from: &[(f32, f32)],
    to: &[(f32, f32)],
    indices: &[usize],
) -> Option<AffineTransform> {
    let mut ata = [[0.0f64; 3]; 3];
    let mut atbx = [0.0f64; 3];
    let mut atby = [0.0f64; 3];
    for &i in indices {
        let basis = [from[i].0 as f64, from[i].1 as f64, 1.0];
        for r in 0..3 {
            for c in 0..3 {
                ata[r][c] += basis[r] * basis[c];
            }
            atbx[r] += basis[r] * to[i].0 as f64;
            atby[r] += basis[r] * to[i].1 as f64;
        }
    }
    let rx = solve3(ata, atbx)?;
    let ry = solve3(ata, atby)?;
    Some(AffineTransform([
        [rx[0] as f32, rx[1] as f32, rx[2] as f32],
        [ry[0] as f32, ry[1] as f32, ry[2] as f32],
    ]))
}

/// Robust affine fit: RANSAC with a three-point minimal solver, then a
/// least-squares refit on the consensus set.
fn estimate_affine(
    from: &[(f32, f32)],
    to: &[(f32, f32)],
    rng: &mut StdRng,
) -> Option<AffineTransform> {
    let n = from.len();
    if n < 3 {
        return None;
    }

    let threshold_sq = RANSAC_THRESHOLD_PX * RANSAC_THRESHOLD_PX;
    let mut best_inliers: Vec<usize> = Vec::new();

    for _ in 0..RANSAC_ITERATIONS {
        let i = rng.random_range(0..n);
        let mut j = rng.random_range(0..n);
        while j == i {
            j = rng.random_range(0..n);
        }
        let mut k = rng.random_range(0..n);
        while k == i || k == j {
            k = rng.random_range(0..n);
        }

        let Some(model) = affine_from_three(from, to, [i, j, k]) else {
            continue;
        };

        let inliers: Vec<usize> = (0..n)
            .filter(|&p| {
                let (px, py) = model.apply(from[p].0, from[p].1);
                let dx = px - to[p].0;
                let dy = py - to[p].1;
                dx * dx + dy * dy < threshold_sq
            })
            .collect();

        if inliers.len() > best_inliers.len() {
            best_inliers = inliers;
        }
    }

    if best_inliers.len() < 3 {
        return None;
    }
    affine_least_squares(from, to, &best_inliers)
}

/// Approximate the template-to-reference transform from keypoint matches.
///
/// `template_mask` restricts template keypoint detection to pixels where the
/// mask is positive. Falls back to the identity transform when fewer than two
/// matches survive the ratio ranking or when estimation fails; never errors.
pub fn approximate_transform(
    reference: ArrayView2<'_, f32>,
    template: ArrayView2<'_, f32>,
    template_mask: Option<ArrayView2<'_, f32>>,
    rng: &mut StdRng,
) -> AffineTransform {
    let (ref_kp, ref_desc) = detect_and_describe(reference, None);
    let (tpl_kp, tpl_desc) = detect_and_describe(template, template_mask);

    let matches = ratio_matches(&tpl_desc, &ref_desc);
    if matches.len() < 2 {
        return AffineTransform::identity();
    }

    let from: Vec<(f32, f32)> = matches
        .iter()
        .map(|m| (tpl_kp[m.query].x, tpl_kp[m.query].y))
        .collect();
    let to: Vec<(f32, f32)> = matches
        .iter()
        .map(|m| (ref_kp[m.train].x, ref_kp[m.train].y))
        .collect();

    estimate_affine(&from, &to, rng).unwrap_or_else(AffineTransform::identity)
}
