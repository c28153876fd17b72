//! Periodic steady states of the envelope by Newton shooting.
//!
//! The envelope is integrated over one large period with the fundamental matrix propagated
//! alongside. The mismatch `Y(T_large) - Y(0)` and the monodromy `Phi(T_large)` give the
//! Newton update `(Phi - I) dY = -(Y(T_large) - Y(0))`.

use crate::analysis::floquet_multipliers;
use crate::envelope::{
    Corrector, EnvelopeConfig, EnvelopeSettings, EnvelopeSolution, EnvelopeSolver, EnvelopeStatus,
    VariationalSettings,
};
use crate::traits::VectorFieldModel;
use anyhow::{anyhow, bail, Context, Result};
use nalgebra::{DMatrix, DVector};
use num_complex::Complex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShootingSettings {
    /// Convergence threshold on the max-norm of `Y(T_large) - Y(0)`.
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Period of the envelope steady state.
    pub large_period: f64,
}

impl ShootingSettings {
    pub fn new(large_period: f64) -> Self {
        Self {
            tolerance: 1e-3,
            max_iterations: 20,
            large_period,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ShootingResult {
    pub state: Vec<f64>,
    pub iterations: usize,
    pub residual_norm: f64,
    /// Envelope integration of every iteration, in order.
    pub integrations: Vec<EnvelopeSolution>,
    /// Multipliers of the large-period map at the final iterate, largest modulus first.
    pub multipliers: Vec<Complex<f64>>,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvelopeShooting {
    settings: ShootingSettings,
}

impl EnvelopeShooting {
    pub fn new(settings: ShootingSettings) -> Self {
        Self { settings }
    }

    /// Runs Newton shooting from `y0_guess`.
    ///
    /// Variational propagation is switched on when `envelope` does not already request it.
    /// Every iteration restarts the model from the mode it had on entry.
    pub fn run<M, C>(
        &self,
        model: &mut M,
        corrector: C,
        mut envelope: EnvelopeSettings,
        y0_guess: &[f64],
    ) -> Result<ShootingResult>
    where
        M: VectorFieldModel + ?Sized,
        C: Corrector,
    {
        let ShootingSettings {
            tolerance,
            max_iterations,
            large_period,
        } = self.settings;
        if !(large_period.is_finite() && large_period > 0.0) {
            bail!("Large period must be positive, got {}.", large_period);
        }
        if !(tolerance.is_finite() && tolerance > 0.0) {
            bail!("Shooting tolerance must be positive, got {}.", tolerance);
        }
        if envelope.variational.is_none() {
            envelope.variational = Some(VariationalSettings::default());
        }
        let config = EnvelopeConfig::new(envelope).context("Invalid envelope settings")?;

        let n = y0_guess.len();
        let mode = model.mode();
        let mut y = DVector::from_row_slice(y0_guess);
        let mut integrations = Vec::new();

        for iteration in 1..=max_iterations {
            model.set_mode(mode);
            let solution = EnvelopeSolver::new(
                &mut *model,
                corrector.clone(),
                config.clone(),
                (0.0, large_period),
                y.as_slice(),
            )
            .context("Failed to set up envelope integration")?
            .solve();
            if let EnvelopeStatus::Failed(error) = &solution.status {
                bail!("Envelope integration failed at iteration {}: {}", iteration, error);
            }

            let y_end = solution
                .final_state()
                .map(DVector::from_row_slice)
                .ok_or_else(|| anyhow!("Envelope integration returned no samples."))?;
            let monodromy = solution
                .final_fundamental()
                .ok_or_else(|| anyhow!("Envelope integration returned no fundamental matrix."))?;
            integrations.push(solution);

            let residual = &y_end - &y;
            let residual_norm = residual.amax();
            debug!(iteration, residual_norm, "shooting iteration");

            if residual_norm <= tolerance {
                info!(iterations = iteration, residual_norm, "shooting converged");
                return Ok(ShootingResult {
                    state: y.iter().copied().collect(),
                    iterations: iteration,
                    residual_norm,
                    integrations,
                    multipliers: floquet_multipliers(&monodromy),
                });
            }

            let jacobian = monodromy - DMatrix::identity(n, n);
            let delta = jacobian
                .lu()
                .solve(&(-residual))
                .ok_or_else(|| anyhow!("Shooting Jacobian is singular (multiplier at 1)."))?;
            y += delta;
        }

        bail!(
            "Shooting did not converge within {} iterations.",
            max_iterations
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::BackwardEuler;
    use crate::traits::DynamicalSystem;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    struct Forced {
        lambda: f64,
    }

    impl DynamicalSystem for Forced {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
            out[0] = -self.lambda * x[0] + (2.0 * PI * t).cos();
        }

        fn jacobian(&self, _t: f64, _x: &[f64]) -> Option<DMatrix<f64>> {
            Some(DMatrix::from_element(1, 1, -self.lambda))
        }
    }

    impl VectorFieldModel for Forced {}

    /// `y' = y` has no periodic steady state and its integration blows past any tolerance.
    struct Growth;

    impl DynamicalSystem for Growth {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
            out[0] = x[0];
        }
    }

    impl VectorFieldModel for Growth {}

    fn settings() -> EnvelopeSettings {
        EnvelopeSettings {
            period: Some(1.0),
            fun_rtol: 1e-10,
            fun_atol: 1e-12,
            ..EnvelopeSettings::default()
        }
    }

    #[test]
    fn converges_to_forced_steady_state() {
        let lambda = 0.1;
        let mut model = Forced { lambda };
        let shooting = EnvelopeShooting::new(ShootingSettings {
            tolerance: 1e-7,
            ..ShootingSettings::new(20.0)
        });
        let result = shooting
            .run(&mut model, BackwardEuler, settings(), &[1.0])
            .expect("shooting");

        // The stroboscopic steady state of y' = -lambda y + cos(2 pi t) at integer times.
        let steady = lambda / (lambda * lambda + 4.0 * PI * PI);
        assert_relative_eq!(result.state[0], steady, epsilon = 1e-6);
        assert!(result.iterations <= 3);
        assert_eq!(result.integrations.len(), result.iterations);
        assert!(result.residual_norm <= 1e-7);

        assert_eq!(result.multipliers.len(), 1);
        assert_relative_eq!(result.multipliers[0].re, (-20.0 * lambda).exp(), max_relative = 1e-6);
        assert_relative_eq!(result.multipliers[0].im, 0.0);
    }

    #[test]
    fn reports_missing_jacobian() {
        let shooting = EnvelopeShooting::new(ShootingSettings::new(5.0));
        let err = shooting
            .run(&mut Growth, BackwardEuler, settings(), &[1.0])
            .expect_err("no jacobian");
        assert!(format!("{err:#}").contains("Jacobian"));
    }

    #[test]
    fn rejects_non_positive_large_period() {
        let shooting = EnvelopeShooting::new(ShootingSettings::new(0.0));
        let err = shooting
            .run(&mut Forced { lambda: 0.1 }, BackwardEuler, settings(), &[1.0])
            .expect_err("period");
        assert!(format!("{err}").contains("Large period must be positive"));
    }
}
