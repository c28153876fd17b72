//! Jacobian-free Newton-Krylov solver for the implicit macro-step equations.
//!
//! Every residual evaluation of an envelope corrector integrates the full system over one
//! period, so the Jacobian is never formed: GMRES only needs Jacobian-vector products, which
//! are approximated by forward differences of the residual.

use crate::error::EnvelopeError;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NewtonSettings {
    pub max_steps: usize,
    pub damping: f64,
    /// Convergence threshold on the max-norm of the residual scaled by `atol + rtol * |Y|`.
    pub tolerance: f64,
}

impl Default for NewtonSettings {
    fn default() -> Self {
        Self {
            max_steps: 20,
            damping: 1.0,
            tolerance: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NewtonOutcome {
    Converged {
        solution: DVector<f64>,
        iterations: usize,
    },
    NotConverged {
        iterations: usize,
        residual_norm: f64,
    },
}

const MAX_BACKTRACKS: usize = 4;
const GMRES_RELATIVE_TOLERANCE: f64 = 1e-3;

/// Solves `F(Y) = 0` starting from `guess`.
///
/// `weights` holds the per-component error scale used for the convergence test.
/// `fd_step` is the relative size of the finite-difference perturbation.
/// Errors returned by `residual` abort the solve; failing to converge does not.
pub fn newton_krylov<F>(
    mut residual: F,
    guess: DVector<f64>,
    weights: &DVector<f64>,
    settings: NewtonSettings,
    fd_step: f64,
) -> Result<NewtonOutcome, EnvelopeError>
where
    F: FnMut(&DVector<f64>) -> Result<DVector<f64>, EnvelopeError>,
{
    let mut x = guess;
    let mut r = residual(&x)?;
    let mut norm = scaled_max_norm(&r, weights);

    for iteration in 0..settings.max_steps {
        if norm <= settings.tolerance {
            return Ok(NewtonOutcome::Converged {
                solution: x,
                iterations: iteration,
            });
        }
        if !norm.is_finite() {
            break;
        }

        let rhs = -&r;
        let base_norm = x.norm();
        let direction = {
            let x_ref = &x;
            let r_ref = &r;
            let mut jvp = |v: &DVector<f64>| -> Result<DVector<f64>, EnvelopeError> {
                let v_norm = v.norm();
                if v_norm == 0.0 {
                    return Ok(DVector::zeros(v.len()));
                }
                let eps = fd_step * (1.0 + base_norm) / v_norm;
                let shifted = residual(&(x_ref + v * eps))?;
                Ok((shifted - r_ref) / eps)
            };
            gmres(&mut jvp, &rhs, rhs.len(), GMRES_RELATIVE_TOLERANCE)?
        };
        let Some(direction) = direction else {
            break;
        };

        let mut lambda = settings.damping;
        let mut improved = None;
        for _ in 0..MAX_BACKTRACKS {
            let candidate = &x + &direction * lambda;
            let r_candidate = residual(&candidate)?;
            let candidate_norm = scaled_max_norm(&r_candidate, weights);
            if candidate_norm < norm {
                improved = Some((candidate, r_candidate, candidate_norm));
                break;
            }
            lambda *= 0.5;
        }
        let Some((candidate, r_candidate, candidate_norm)) = improved else {
            return Ok(NewtonOutcome::NotConverged {
                iterations: iteration + 1,
                residual_norm: norm,
            });
        };
        x = candidate;
        r = r_candidate;
        norm = candidate_norm;
    }

    if norm <= settings.tolerance {
        Ok(NewtonOutcome::Converged {
            solution: x,
            iterations: settings.max_steps,
        })
    } else {
        Ok(NewtonOutcome::NotConverged {
            iterations: settings.max_steps,
            residual_norm: norm,
        })
    }
}

/// Max-norm of `r / weights`.
pub fn scaled_max_norm(r: &DVector<f64>, weights: &DVector<f64>) -> f64 {
    r.iter()
        .zip(weights.iter())
        .map(|(v, w)| (v / w).abs())
        .fold(0.0, f64::max)
}

/// Unrestarted GMRES for `A d = b` with `A` given as an operator.
///
/// Returns `None` when the least-squares update cannot be computed.
fn gmres<A>(
    apply: &mut A,
    b: &DVector<f64>,
    max_iterations: usize,
    relative_tolerance: f64,
) -> Result<Option<DVector<f64>>, EnvelopeError>
where
    A: FnMut(&DVector<f64>) -> Result<DVector<f64>, EnvelopeError>,
{
    let n = b.len();
    let beta = b.norm();
    if beta == 0.0 {
        return Ok(Some(DVector::zeros(n)));
    }
    let m = max_iterations.max(1);
    let mut basis: Vec<DVector<f64>> = vec![b / beta];
    let mut hessenberg = DMatrix::<f64>::zeros(m + 1, m);
    let mut coefficients = DVector::zeros(0);

    for j in 0..m {
        let mut w = apply(&basis[j])?;
        for (i, v) in basis.iter().enumerate() {
            let h = w.dot(v);
            hessenberg[(i, j)] = h;
            w -= v * h;
        }
        let h_next = w.norm();
        hessenberg[(j + 1, j)] = h_next;

        let k = j + 1;
        let h_k = hessenberg.view((0, 0), (k + 1, k)).clone_owned();
        let mut e1 = DVector::zeros(k + 1);
        e1[0] = beta;
        let Ok(y) = h_k.clone().svd(true, true).solve(&e1, 1e-14) else {
            return Ok(None);
        };
        let residual = (&e1 - &h_k * &y).norm();
        coefficients = y;

        if h_next <= 1e-14 * beta || residual <= relative_tolerance * beta {
            break;
        }
        basis.push(w / h_next);
    }

    let mut solution = DVector::zeros(n);
    for (v, c) in basis.iter().zip(coefficients.iter()) {
        solution += v * *c;
    }
    if solution.iter().all(|v| v.is_finite()) {
        Ok(Some(solution))
    } else {
        Ok(None)
    }
}
