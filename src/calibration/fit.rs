//! Curve fitting for the calibration pipeline.
//!
//! Two numeric routines, both self-contained:
//!
//! - [`fit_flat_top`]: bounded nonlinear least squares of power-vs-angle
//!   samples against the flat-top (super-)Gaussian
//!   `f(x) = B·exp(−(((x−x0)/a)²)ⁿ) + y0`. Levenberg–Marquardt with an
//!   analytic Jacobian; parameters are projected onto the supplied box
//!   bounds after every step, which keeps the fit physically plausible
//!   (positive width, bounded exponent) without a constrained solver.
//! - [`linear_fit`]: ordinary least-squares regression, used to reduce the
//!   per-leg peak angles `x0` to one `(slope, intercept)` pair per scan
//!   direction.
//!
//! The exponent `n` controls plateau flatness: `n = 1` is a plain Gaussian,
//! larger `n` squares off the top the way a real interference filter's
//! transmission curve does.

use thiserror::Error;

/// Parameters of the flat-top Gaussian, in the order `[B, x0, a, n, y0]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlatTopParams {
    /// Peak amplitude above the floor (B).
    pub amplitude: f64,
    /// Center position of the peak (x0).
    pub center: f64,
    /// Width parameter (a).
    pub width: f64,
    /// Super-Gaussian exponent (n).
    pub exponent: f64,
    /// Baseline offset (y0).
    pub floor: f64,
}

impl FlatTopParams {
    fn from_array(p: [f64; 5]) -> Self {
        Self {
            amplitude: p[0],
            center: p[1],
            width: p[2],
            exponent: p[3],
            floor: p[4],
        }
    }

    fn to_array(self) -> [f64; 5] {
        [
            self.amplitude,
            self.center,
            self.width,
            self.exponent,
            self.floor,
        ]
    }

    /// Evaluate the model at `x`.
    pub fn eval(&self, x: f64) -> f64 {
        let u = ((x - self.center) / self.width).powi(2);
        self.amplitude * (-u.powf(self.exponent)).exp() + self.floor
    }
}

/// Box bounds on the five fit parameters, `[B, x0, a, n, y0]`.
#[derive(Debug, Clone, Copy)]
pub struct FitBounds {
    pub lower: [f64; 5],
    pub upper: [f64; 5],
}

impl FitBounds {
    fn clamp(&self, p: &mut [f64; 5]) {
        for i in 0..5 {
            p[i] = p[i].clamp(self.lower[i], self.upper[i]);
        }
    }
}

#[derive(Error, Debug)]
pub enum FitError {
    #[error("need at least {needed} samples, got {got}")]
    TooFewSamples { needed: usize, got: usize },

    #[error("fit did not converge within {max_iterations} iterations")]
    DidNotConverge { max_iterations: usize },

    #[error("degenerate sample set: {0}")]
    DegenerateData(&'static str),
}

const MAX_ITERATIONS: usize = 200;
const COST_TOLERANCE: f64 = 1e-12;

/// Fit `(x, y)` samples to the flat-top Gaussian within `bounds`.
///
/// The initial guess is derived from the data (floor from the minimum,
/// amplitude from the span, center from the argmax) and projected onto the
/// bounds before the first iteration.
pub fn fit_flat_top(
    xs: &[f64],
    ys: &[f64],
    bounds: &FitBounds,
) -> Result<FlatTopParams, FitError> {
    if xs.len() != ys.len() || xs.len() < 6 {
        return Err(FitError::TooFewSamples {
            needed: 6,
            got: xs.len().min(ys.len()),
        });
    }

    let mut p = initial_guess(xs, ys)?.to_array();
    bounds.clamp(&mut p);

    let mut lambda = 1e-3;
    let mut cost = residual_cost(xs, ys, &p);

    for _ in 0..MAX_ITERATIONS {
        let (jtj, jtr) = normal_equations(xs, ys, &p);

        // Inner damping loop: retry with a larger lambda until a step
        // lowers the cost or damping saturates.
        let mut stepped = false;
        for _ in 0..16 {
            let mut damped = jtj;
            for (i, row) in damped.iter_mut().enumerate() {
                row[i] += lambda * jtj[i][i].max(1e-12);
            }
            let Some(delta) = solve5(&damped, &jtr) else {
                lambda *= 10.0;
                continue;
            };

            let mut candidate = p;
            for i in 0..5 {
                candidate[i] -= delta[i];
            }
            bounds.clamp(&mut candidate);

            let candidate_cost = residual_cost(xs, ys, &candidate);
            if candidate_cost < cost {
                let improvement = cost - candidate_cost;
                p = candidate;
                cost = candidate_cost;
                lambda = (lambda / 3.0).max(1e-12);
                stepped = true;
                if improvement <= COST_TOLERANCE * (cost + COST_TOLERANCE) {
                    return Ok(FlatTopParams::from_array(p));
                }
                break;
            }
            lambda *= 4.0;
        }

        if !stepped {
            // Damping saturated without improvement: local minimum reached.
            return Ok(FlatTopParams::from_array(p));
        }
    }

    Err(FitError::DidNotConverge {
        max_iterations: MAX_ITERATIONS,
    })
}

fn initial_guess(xs: &[f64], ys: &[f64]) -> Result<FlatTopParams, FitError> {
    let mut y_min = f64::INFINITY;
    let mut y_max = f64::NEG_INFINITY;
    let mut x_at_max = xs[0];
    let mut x_min = f64::INFINITY;
    let mut x_max = f64::NEG_INFINITY;
    for (&x, &y) in xs.iter().zip(ys) {
        if y < y_min {
            y_min = y;
        }
        if y > y_max {
            y_max = y;
            x_at_max = x;
        }
        x_min = x_min.min(x);
        x_max = x_max.max(x);
    }
    if x_max <= x_min {
        return Err(FitError::DegenerateData("all sample positions identical"));
    }
    if y_max <= y_min {
        return Err(FitError::DegenerateData("flat power trace"));
    }
    Ok(FlatTopParams {
        amplitude: y_max - y_min,
        center: x_at_max,
        width: (x_max - x_min) / 4.0,
        exponent: 2.0,
        floor: y_min,
    })
}

fn residual_cost(xs: &[f64], ys: &[f64], p: &[f64; 5]) -> f64 {
    let model = FlatTopParams::from_array(*p);
    xs.iter()
        .zip(ys)
        .map(|(&x, &y)| {
            let r = model.eval(x) - y;
            r * r
        })
        .sum()
}

/// Accumulate `JᵀJ` and `Jᵀr` for the current parameters.
fn normal_equations(xs: &[f64], ys: &[f64], p: &[f64; 5]) -> ([[f64; 5]; 5], [f64; 5]) {
    let [b, x0, a, n, y0] = *p;
    let mut jtj = [[0.0; 5]; 5];
    let mut jtr = [0.0; 5];

    for (&x, &y) in xs.iter().zip(ys) {
        let u = ((x - x0) / a).powi(2);
        let t = u.powf(n);
        let e = (-t).exp();
        let r = b * e + y0 - y;

        // Analytic partials of f = B·exp(−uⁿ) + y0.
        let common = if u > 1e-300 { b * e * n * u.powf(n - 1.0) } else { 0.0 };
        let row = [
            e,                                     // ∂f/∂B
            common * 2.0 * (x - x0) / (a * a),     // ∂f/∂x0
            common * 2.0 * (x - x0).powi(2) / (a * a * a), // ∂f/∂a
            if u > 1e-300 { -b * e * t * u.ln() } else { 0.0 }, // ∂f/∂n
            1.0,                                   // ∂f/∂y0
        ];

        for i in 0..5 {
            jtr[i] += row[i] * r;
            for j in 0..5 {
                jtj[i][j] += row[i] * row[j];
            }
        }
    }
    (jtj, jtr)
}

/// Solve a 5×5 linear system by Gaussian elimination with partial pivoting.
/// Returns `None` when the system is singular.
fn solve5(a: &[[f64; 5]; 5], b: &[f64; 5]) -> Option<[f64; 5]> {
    let mut m = *a;
    let mut v = *b;

    for col in 0..5 {
        let mut pivot = col;
        for row in col + 1..5 {
            if m[row][col].abs() > m[pivot][col].abs() {
                pivot = row;
            }
        }
        if m[pivot][col].abs() < 1e-300 {
            return None;
        }
        m.swap(col, pivot);
        v.swap(col, pivot);

        for row in col + 1..5 {
            let factor = m[row][col] / m[col][col];
            for k in col..5 {
                m[row][k] -= factor * m[col][k];
            }
            v[row] -= factor * v[col];
        }
    }

    let mut x = [0.0; 5];
    for col in (0..5).rev() {
        let mut sum = v[col];
        for k in col + 1..5 {
            sum -= m[col][k] * x[k];
        }
        x[col] = sum / m[col][col];
    }
    Some(x)
}

/// Ordinary least-squares line through `(x, y)` samples.
///
/// Returns `(slope, intercept)`.
pub fn linear_fit(xs: &[f64], ys: &[f64]) -> Result<(f64, f64), FitError> {
    if xs.len() != ys.len() || xs.len() < 2 {
        return Err(FitError::TooFewSamples {
            needed: 2,
            got: xs.len().min(ys.len()),
        });
    }
    let n = xs.len() as f64;
    let sum_x: f64 = xs.iter().sum();
    let sum_y: f64 = ys.iter().sum();
    let sum_xx: f64 = xs.iter().map(|x| x * x).sum();
    let sum_xy: f64 = xs.iter().zip(ys).map(|(x, y)| x * y).sum();

    let denom = n * sum_xx - sum_x * sum_x;
    if denom.abs() < 1e-300 {
        return Err(FitError::DegenerateData("all x values identical"));
    }
    let slope = (n * sum_xy - sum_x * sum_y) / denom;
    let intercept = (sum_y - slope * sum_x) / n;
    Ok((slope, intercept))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn default_bounds() -> FitBounds {
        FitBounds {
            lower: [1e-6, 100.0, 0.05, 0.5, 0.0],
            upper: [1.0, 130.0, 10.0, 8.0, 0.1],
        }
    }

    fn gaussian_noise(rng: &mut StdRng, sigma: f64) -> f64 {
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen_range(0.0..1.0);
        sigma * (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
    }

    #[test]
    fn recovers_center_of_noiseless_flat_top() {
        let truth = FlatTopParams {
            amplitude: 0.02,
            center: 114.0,
            width: 1.0,
            exponent: 2.0,
            floor: 0.01,
        };
        let xs: Vec<f64> = (0..200).map(|i| 110.0 + i as f64 * 0.04).collect();
        let ys: Vec<f64> = xs.iter().map(|&x| truth.eval(x)).collect();

        let fitted = fit_flat_top(&xs, &ys, &default_bounds()).unwrap();
        assert!((fitted.center - 114.0).abs() < 1e-4, "center {}", fitted.center);
        assert!((fitted.amplitude - 0.02).abs() < 1e-4);
        assert!((fitted.floor - 0.01).abs() < 1e-4);
    }

    #[test]
    fn recovers_center_under_measurement_noise() {
        let truth = FlatTopParams {
            amplitude: 0.02,
            center: 114.0,
            width: 1.0,
            exponent: 2.0,
            floor: 0.01,
        };
        let mut rng = StdRng::seed_from_u64(42);
        let xs: Vec<f64> = (0..200).map(|i| 110.0 + i as f64 * 0.04).collect();
        let ys: Vec<f64> = xs
            .iter()
            .map(|&x| truth.eval(x) + gaussian_noise(&mut rng, 0.001))
            .collect();

        let fitted = fit_flat_top(&xs, &ys, &default_bounds()).unwrap();
        assert!(
            (fitted.center - 114.0).abs() < 0.05,
            "center off by {}",
            (fitted.center - 114.0).abs()
        );
    }

    #[test]
    fn respects_bounds() {
        let truth = FlatTopParams {
            amplitude: 0.02,
            center: 114.0,
            width: 1.0,
            exponent: 2.0,
            floor: 0.01,
        };
        let xs: Vec<f64> = (0..100).map(|i| 110.0 + i as f64 * 0.08).collect();
        let ys: Vec<f64> = xs.iter().map(|&x| truth.eval(x)).collect();

        // Center is forced away from the true peak by the box.
        let bounds = FitBounds {
            lower: [1e-6, 115.0, 0.05, 0.5, 0.0],
            upper: [1.0, 130.0, 10.0, 8.0, 0.1],
        };
        let fitted = fit_flat_top(&xs, &ys, &bounds).unwrap();
        assert!(fitted.center >= 115.0);
    }

    #[test]
    fn rejects_flat_trace() {
        let xs: Vec<f64> = (0..50).map(|i| i as f64).collect();
        let ys = vec![0.5; 50];
        assert!(matches!(
            fit_flat_top(&xs, &ys, &default_bounds()),
            Err(FitError::DegenerateData(_))
        ));
    }

    #[test]
    fn linear_fit_recovers_known_line() {
        let xs: Vec<f64> = (0..20).map(|i| 1027.0 + i as f64 * 0.25).collect();
        let ys: Vec<f64> = xs.iter().map(|&x| 0.5 * x + 10.0).collect();
        let (slope, intercept) = linear_fit(&xs, &ys).unwrap();
        assert!((slope - 0.5).abs() < 1e-3);
        assert!((intercept - 10.0).abs() < 1e-3);
    }

    #[test]
    fn linear_fit_rejects_degenerate_input() {
        assert!(linear_fit(&[1.0], &[2.0]).is_err());
        assert!(linear_fit(&[3.0, 3.0, 3.0], &[1.0, 2.0, 3.0]).is_err());
    }
}
