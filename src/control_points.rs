//! Control-point extraction from a wavelet-modulus map.
//!
//! A control point is a pixel strictly greater than every other pixel in its
//! dilation window. Strict inequality means plateaus produce no duplicate
//! maxima, and a flat map produces no points at all.

use ndarray::ArrayView2;

/// A detected feature coordinate in template space, `x` = column, `y` = row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ControlPoint {
    pub x: f32,
    pub y: f32,
}

/// Identify all strict local maxima of `feature_map` in square neighborhoods
/// of `window_size` pixels (the center pixel itself is excluded from the
/// comparison).
///
/// The window anchor follows the even-size dilation convention: offsets run
/// from `-(w / 2)` to `w - 1 - w / 2` inclusive on both axes.
pub fn identify(feature_map: ArrayView2<'_, f32>, window_size: usize) -> Vec<ControlPoint> {
    let (rows, cols) = feature_map.dim();
    if rows == 0 || cols == 0 || window_size < 2 {
        return Vec::new();
    }

    let w = window_size as isize;
    let lo = -(w / 2);
    let hi = w - 1 - w / 2;

    let mut points = Vec::new();
    for r in 0..rows as isize {
        'pixel: for c in 0..cols as isize {
            let v = feature_map[[r as usize, c as usize]];
            for dr in lo..=hi {
                let rr = r + dr;
                if rr < 0 || rr >= rows as isize {
                    continue;
                }
                for dc in lo..=hi {
                    if dr == 0 && dc == 0 {
                        continue;
                    }
                    let cc = c + dc;
                    if cc < 0 || cc >= cols as isize {
                        continue;
                    }
                    if feature_map[[rr as usize, cc as usize]] >= v {
                        continue 'pixel;
                    }
                }
            }
            points.push(ControlPoint {
                x: c as f32,
                y: r as f32,
            });
        }
    }
    points
}
