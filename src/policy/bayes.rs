//! Bayesian optimization over a single real parameter in [0, 1].
//!
//! A small Gaussian process with an RBF kernel drives the search.  Callers
//! ask for the next point, map it onto a prompt, and report the negated
//! failure-rate ratio as the observation (the optimizer minimizes, so a
//! high failure rate looks like a low objective).  The first 25 points are
//! stratified exploration.  Once the best observed failure ratio exceeds
//! 0.5 the optimizer signals `Stop`: the module is already demonstrably
//! vulnerable and further probing is wasted budget.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const INIT_POINTS: usize = 25;
pub const EARLY_STOP_FAILURE_RATIO: f64 = 0.5;

// Squared-exponential kernel length scale and observation noise.
const LENGTH_SCALE: f64 = 0.1;
const NOISE: f64 = 1e-4;
// Lower-confidence-bound acquisition weight.
const KAPPA: f64 = 1.5;
// Observation window: older points fall off to keep the solve cheap.
const MAX_OBSERVATIONS: usize = 200;
const CANDIDATE_GRID: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OptimizerSignal {
    Continue,
    Stop,
}

pub struct BayesianOptimizer {
    xs: Vec<f64>,
    ys: Vec<f64>,
    rng: StdRng,
}

impl BayesianOptimizer {
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            xs: Vec::new(),
            ys: Vec::new(),
            rng: match seed {
                Some(s) => StdRng::seed_from_u64(s),
                None => StdRng::from_entropy(),
            },
        }
    }

    pub fn observations(&self) -> usize {
        self.xs.len()
    }

    /// Next parameter to evaluate.  Stratified random during the initial
    /// exploration phase, then the minimizer of the GP lower confidence
    /// bound over a fixed grid.
    pub fn suggest(&mut self) -> f64 {
        let n = self.xs.len();
        if n < INIT_POINTS {
            let stratum = n as f64 / INIT_POINTS as f64;
            return stratum + self.rng.gen::<f64>() / INIT_POINTS as f64;
        }

        let chol = cholesky(&kernel_matrix(&self.xs));
        let alpha = chol_solve(&chol, &self.ys);

        let mut best_x = 0.0;
        let mut best_acq = f64::INFINITY;
        for i in 0..=CANDIDATE_GRID {
            let x = i as f64 / CANDIDATE_GRID as f64;
            let k_star: Vec<f64> = self.xs.iter().map(|&xi| rbf(x, xi)).collect();
            let mean: f64 = k_star.iter().zip(&alpha).map(|(k, a)| k * a).sum();
            let v = chol_forward(&chol, &k_star);
            let var = (rbf(x, x) + NOISE - v.iter().map(|z| z * z).sum::<f64>()).max(0.0);
            let acq = mean - KAPPA * var.sqrt();
            if acq < best_acq {
                best_acq = acq;
                best_x = x;
            }
        }
        best_x
    }

    /// Record an observation (`y` is the negated failure ratio) and decide
    /// whether the module should keep going.
    pub fn observe(&mut self, x: f64, y: f64) -> OptimizerSignal {
        if self.xs.len() == MAX_OBSERVATIONS {
            self.xs.remove(0);
            self.ys.remove(0);
        }
        self.xs.push(x.clamp(0.0, 1.0));
        self.ys.push(y);

        let best_failure = self.ys.iter().map(|y| -y).fold(f64::NEG_INFINITY, f64::max);
        if best_failure > EARLY_STOP_FAILURE_RATIO {
            OptimizerSignal::Stop
        } else {
            OptimizerSignal::Continue
        }
    }
}

fn rbf(a: f64, b: f64) -> f64 {
    let d = a - b;
    (-d * d / (2.0 * LENGTH_SCALE * LENGTH_SCALE)).exp()
}

fn kernel_matrix(xs: &[f64]) -> Vec<Vec<f64>> {
    let n = xs.len();
    let mut k = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..n {
            k[i][j] = rbf(xs[i], xs[j]);
            if i == j {
                k[i][j] += NOISE;
            }
        }
    }
    k
}

/// Lower-triangular Cholesky factor of a positive-definite matrix.
fn cholesky(k: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = k.len();
    let mut l = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in 0..=i {
            let mut sum = k[i][j];
            for p in 0..j {
                sum -= l[i][p] * l[j][p];
            }
            if i == j {
                l[i][j] = sum.max(1e-12).sqrt();
            } else {
                l[i][j] = sum / l[j][j];
            }
        }
    }
    l
}

/// Solve L z = b.
fn chol_forward(l: &[Vec<f64>], b: &[f64]) -> Vec<f64> {
    let n = b.len();
    let mut z = vec![0.0; n];
    for i in 0..n {
        let mut sum = b[i];
        for j in 0..i {
            sum -= l[i][j] * z[j];
        }
        z[i] = sum / l[i][i];
    }
    z
}

/// Solve (L Lᵀ) alpha = y.
fn chol_solve(l: &[Vec<f64>], y: &[f64]) -> Vec<f64> {
    let n = y.len();
    let z = chol_forward(l, y);
    let mut alpha = vec![0.0; n];
    for i in (0..n).rev() {
        let mut sum = z[i];
        for j in i + 1..n {
            sum -= l[j][i] * alpha[j];
        }
        alpha[i] = sum / l[i][i];
    }
    alpha
}
