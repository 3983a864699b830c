//! Multilateration solvers.
//!
//! Two solvers share the same inputs, a list of [`Anchor`]s in a planar
//! metric frame:
//!
//! - [`closed_form`] linearizes the range equations against a reference
//!   receiver and solves the weighted normal equations directly.
//! - [`least_squares`] minimizes the weighted sum of squared range residuals
//!   with a damped Gauss-Newton (Levenberg-Marquardt) iteration.
//!
//! Both detect near-singular 2x2 systems and report them as
//! [`Unresolvable::SingularSystem`] instead of returning an arbitrary point.

use crate::error::Unresolvable;
use crate::models::Point;
use tracing::debug;

/// Relative determinant below which a 2x2 system counts as singular.
const SINGULAR_EPS: f64 = 1e-12;

/// Distance under which a candidate sits on top of a receiver.
const COINCIDENT_EPS: f64 = 1e-12;

const LAMBDA_INIT: f64 = 1e-3;
const LAMBDA_MIN: f64 = 1e-12;
const LAMBDA_MAX: f64 = 1e12;

/// A receiver with the range implied by its reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Anchor {
    pub position: Point,
    pub range: f64,
    pub weight: f64,
}

/// Iteration limits for [`least_squares`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolverLimits {
    pub max_iterations: usize,
    /// Convergence threshold on the step length, relative to `1 + |p|`.
    pub tolerance: f64,
}

impl Default for SolverLimits {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            tolerance: 1e-9,
        }
    }
}

/// A solved position with its iteration count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fit {
    pub position: Point,
    pub iterations: usize,
}

/// Solve the symmetric system `[a11 a12; a12 a22] x = [b1; b2]`.
fn solve_symmetric(a11: f64, a12: f64, a22: f64, b1: f64, b2: f64) -> Result<Point, Unresolvable> {
    let det = a11 * a22 - a12 * a12;
    let scale = (a11 + a22) * (a11 + a22);

    if !det.is_finite() || scale <= 0.0 || det <= SINGULAR_EPS * scale {
        return Err(Unresolvable::SingularSystem);
    }

    Ok(Point::new(
        (a22 * b1 - a12 * b2) / det,
        (a11 * b2 - a12 * b1) / det,
    ))
}

/// Minor-to-major axis ratio of the receivers' spatial scatter.
///
/// 0 for collinear (or coincident) receivers, 1 for an isotropic layout.
pub fn aspect_ratio(points: &[Point]) -> f64 {
    if points.len() < 2 {
        return 0.0;
    }

    let n = points.len() as f64;
    let mx = points.iter().map(|p| p.x).sum::<f64>() / n;
    let my = points.iter().map(|p| p.y).sum::<f64>() / n;

    let (mut cxx, mut cyy, mut cxy) = (0.0, 0.0, 0.0);
    for p in points {
        let (dx, dy) = (p.x - mx, p.y - my);
        cxx += dx * dx;
        cyy += dy * dy;
        cxy += dx * dy;
    }

    let half_trace = (cxx + cyy) / 2.0;
    let det = cxx * cyy - cxy * cxy;
    let disc = (half_trace * half_trace - det).max(0.0).sqrt();
    let major = half_trace + disc;
    let minor = (half_trace - disc).max(0.0);

    if major <= 0.0 {
        0.0
    } else {
        (minor / major).sqrt()
    }
}

/// Inverse-range weighted centroid of the receivers.
pub fn weighted_centroid(anchors: &[Anchor]) -> Point {
    let (mut sx, mut sy, mut sw) = (0.0, 0.0, 0.0);
    for a in anchors {
        let w = 1.0 / a.range.max(1.0);
        sx += a.position.x * w;
        sy += a.position.y * w;
        sw += w;
    }
    Point::new(sx / sw, sy / sw)
}

/// Linearized multilateration.
///
/// Subtracting the reference receiver's circle equation from every other
/// one leaves a linear system `2 (p_i - p_ref) · p = |d_i|² - r_i² + r_ref²`
/// (coordinates relative to the reference), solved by weighted least squares.
/// The most trusted (highest weight) receiver is the reference.
pub fn closed_form(anchors: &[Anchor]) -> Result<Point, Unresolvable> {
    let reference = anchors
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.weight.total_cmp(&b.weight))
        .map(|(i, _)| i)
        .ok_or(Unresolvable::TooFewReceivers { need: 3, have: 0 })?;
    let origin = anchors[reference];

    let (mut a11, mut a12, mut a22, mut b1, mut b2) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for (i, anchor) in anchors.iter().enumerate() {
        if i == reference {
            continue;
        }
        let dx = anchor.position.x - origin.position.x;
        let dy = anchor.position.y - origin.position.y;
        let (ax, ay) = (2.0 * dx, 2.0 * dy);
        let rhs = dx * dx + dy * dy - anchor.range * anchor.range + origin.range * origin.range;
        // Both equations contribute noise to the difference.
        let w = 1.0 / (1.0 / anchor.weight + 1.0 / origin.weight);

        a11 += w * ax * ax;
        a12 += w * ax * ay;
        a22 += w * ay * ay;
        b1 += w * ax * rhs;
        b2 += w * ay * rhs;
    }

    let rel = solve_symmetric(a11, a12, a22, b1, b2)?;
    Ok(Point::new(
        rel.x + origin.position.x,
        rel.y + origin.position.y,
    ))
}

/// Weighted sum of squared range residuals at `p`.
pub fn cost(anchors: &[Anchor], p: Point) -> f64 {
    anchors
        .iter()
        .map(|a| {
            let r = p.distance_to(a.position) - a.range;
            a.weight * r * r
        })
        .sum()
}

/// Weighted RMS residual at `p`, in units of the range noise sigma.
pub fn normalized_residual(anchors: &[Anchor], p: Point) -> f64 {
    if anchors.is_empty() {
        return 0.0;
    }
    (cost(anchors, p) / anchors.len() as f64).sqrt()
}

/// Geometric dilution of precision at `p`.
///
/// `sqrt(trace((HᵀH)⁻¹))` with `H` the unit line-of-sight vectors. Adding
/// receivers can only lower it; `f64::INFINITY` when the lines of sight are
/// parallel.
pub fn gdop(anchors: &[Anchor], p: Point) -> f64 {
    let (mut h11, mut h12, mut h22) = (0.0, 0.0, 0.0);
    for a in anchors {
        let d = p.distance_to(a.position);
        if d < COINCIDENT_EPS {
            continue;
        }
        let ux = (p.x - a.position.x) / d;
        let uy = (p.y - a.position.y) / d;
        h11 += ux * ux;
        h12 += ux * uy;
        h22 += uy * uy;
    }

    let det = h11 * h22 - h12 * h12;
    if det <= SINGULAR_EPS * (h11 + h22) * (h11 + h22) {
        return f64::INFINITY;
    }
    ((h11 + h22) / det).sqrt()
}

/// Levenberg-Marquardt minimization of the weighted range residuals.
///
/// Fails with [`Unresolvable::NoConvergence`] once `limits.max_iterations`
/// steps have been taken without the step length dropping below tolerance.
pub fn least_squares(
    anchors: &[Anchor],
    initial: Point,
    limits: &SolverLimits,
) -> Result<Fit, Unresolvable> {
    let mut p = initial;
    let mut current = cost(anchors, p);
    let mut lambda = LAMBDA_INIT;

    for iteration in 1..=limits.max_iterations {
        let (mut h11, mut h12, mut h22, mut g1, mut g2) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for a in anchors {
            let d = p.distance_to(a.position);
            if d < COINCIDENT_EPS {
                continue;
            }
            let jx = (p.x - a.position.x) / d;
            let jy = (p.y - a.position.y) / d;
            let r = d - a.range;

            h11 += a.weight * jx * jx;
            h12 += a.weight * jx * jy;
            h22 += a.weight * jy * jy;
            g1 += a.weight * jx * r;
            g2 += a.weight * jy * r;
        }

        let step = solve_symmetric(
            h11 * (1.0 + lambda),
            h12,
            h22 * (1.0 + lambda),
            -g1,
            -g2,
        )?;
        let step_len = step.x.hypot(step.y);
        let candidate = Point::new(p.x + step.x, p.y + step.y);
        let candidate_cost = cost(anchors, candidate);

        if candidate_cost <= current {
            p = candidate;
            current = candidate_cost;
            lambda = (lambda / 10.0).max(LAMBDA_MIN);
        } else {
            lambda *= 10.0;
        }

        let scale = 1.0 + p.x.hypot(p.y);
        if step_len <= limits.tolerance * scale || lambda >= LAMBDA_MAX {
            return Ok(Fit {
                position: p,
                iterations: iteration,
            });
        }
    }

    Err(Unresolvable::NoConvergence {
        iterations: limits.max_iterations,
    })
}

/// [`least_squares`] started from `seed`, keeping the seed when the
/// iteration stalls or hits a singular step.
pub fn refine(anchors: &[Anchor], seed: Point, limits: &SolverLimits) -> Fit {
    match least_squares(anchors, seed, limits) {
        Ok(fit) => fit,
        Err(e) => {
            debug!("Refinement failed ({}), keeping seed", e);
            let iterations = match e {
                Unresolvable::NoConvergence { iterations } => iterations,
                _ => 0,
            };
            Fit {
                position: seed,
                iterations,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anchors_for(truth: Point, receivers: &[Point]) -> Vec<Anchor> {
        receivers
            .iter()
            .map(|&position| Anchor {
                position,
                range: truth.distance_to(position),
                weight: 1.0,
            })
            .collect()
    }

    fn triangle() -> Vec<Point> {
        vec![
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(5.0, 10.0),
        ]
    }

    #[test]
    fn test_aspect_ratio() {
        let collinear = [
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(20.0, 0.0),
        ];
        assert!(aspect_ratio(&collinear) < 1e-9);

        let square = [
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(10.0, 10.0),
            Point::new(0.0, 10.0),
        ];
        assert!((aspect_ratio(&square) - 1.0).abs() < 1e-9);

        assert!(aspect_ratio(&triangle()) > 0.5);
    }

    #[test]
    fn test_closed_form_exact() {
        let truth = Point::new(5.0, 3.33);
        let p = closed_form(&anchors_for(truth, &triangle())).unwrap();
        assert!(p.distance_to(truth) < 1e-9);
    }

    #[test]
    fn test_closed_form_collinear_is_singular() {
        let receivers = [
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(20.0, 0.0),
        ];
        let anchors = anchors_for(Point::new(5.0, 5.0), &receivers);
        assert_eq!(closed_form(&anchors), Err(Unresolvable::SingularSystem));
    }

    #[test]
    fn test_least_squares_from_far_start() {
        let truth = Point::new(37.0, -12.0);
        let receivers = [
            Point::new(0.0, 0.0),
            Point::new(100.0, 0.0),
            Point::new(50.0, 86.6),
            Point::new(20.0, -60.0),
        ];
        let anchors = anchors_for(truth, &receivers);
        let fit = least_squares(&anchors, Point::new(50.0, 30.0), &SolverLimits::default()).unwrap();

        assert!(fit.position.distance_to(truth) < 1e-6);
        assert!(fit.iterations <= SolverLimits::default().max_iterations);
    }

    #[test]
    fn test_least_squares_iteration_cap() {
        let truth = Point::new(37.0, -12.0);
        let anchors = anchors_for(truth, &triangle());
        let limits = SolverLimits {
            max_iterations: 1,
            tolerance: 1e-12,
        };

        let result = least_squares(&anchors, Point::new(500.0, 500.0), &limits);
        assert_eq!(result, Err(Unresolvable::NoConvergence { iterations: 1 }));

        let kept = refine(&anchors, Point::new(500.0, 500.0), &limits);
        assert_eq!(kept.position, Point::new(500.0, 500.0));
        assert_eq!(kept.iterations, 1);
    }

    #[test]
    fn test_refine_keeps_seed_on_singular_step() {
        let line = [
            Point::new(0.0, 0.0),
            Point::new(10.0, 0.0),
            Point::new(20.0, 0.0),
        ];
        let anchors = anchors_for(Point::new(5.0, 4.0), &line);
        let seed = Point::new(5.0, 0.0);

        assert_eq!(
            least_squares(&anchors, seed, &SolverLimits::default()),
            Err(Unresolvable::SingularSystem)
        );

        let kept = refine(&anchors, seed, &SolverLimits::default());
        assert_eq!(kept.position, seed);
        assert_eq!(kept.iterations, 0);
    }

    #[test]
    fn test_gdop_drops_with_more_receivers() {
        let truth = Point::new(5.0, 3.33);
        let three = anchors_for(truth, &triangle());
        let mut four = three.clone();
        four.extend(anchors_for(truth, &[Point::new(10.0, 10.0)]));

        assert!(gdop(&four, truth) <= gdop(&three, truth));
    }

    #[test]
    fn test_gdop_parallel_lines_of_sight() {
        let receivers = [Point::new(10.0, 0.0), Point::new(20.0, 0.0)];
        let anchors = anchors_for(Point::new(0.0, 0.0), &receivers);
        assert!(gdop(&anchors, Point::new(0.0, 0.0)).is_infinite());
    }

    #[test]
    fn test_normalized_residual_zero_at_truth() {
        let truth = Point::new(5.0, 3.33);
        let anchors = anchors_for(truth, &triangle());
        assert!(normalized_residual(&anchors, truth) < 1e-12);
        assert!(normalized_residual(&anchors, Point::new(0.0, 0.0)) > 1.0);
    }
}
