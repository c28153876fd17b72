use super::config::PeriodSpec;
use super::period::{finished, first_return, fixed_return};
use crate::error::{EnvelopeError, IntegrationError};
use crate::solvers::{OdeIntegrator, Tolerances};
use crate::switching::{Propagation, SwitchedDriver};
use crate::traits::{VariationalSystem, VectorFieldModel};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// One-period maps of the fundamental matrix computed at the start of a macro step.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MonodromyProbe {
    /// Monodromy over one envelope period.
    pub period_map: DMatrix<f64>,
    /// Map over one variational period and that period, when a cadence is configured.
    pub cadence: Option<(DMatrix<f64>, f64)>,
}

/// Snapshot of the fundamental matrix used by the variational error test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariationalSample {
    pub t: f64,
    /// Row-major.
    pub fundamental: Vec<f64>,
}

impl VariationalSample {
    pub(crate) fn new(t: f64, fundamental: &DMatrix<f64>) -> Self {
        Self {
            t,
            fundamental: row_major(fundamental),
        }
    }
}

pub(crate) fn row_major(matrix: &DMatrix<f64>) -> Vec<f64> {
    matrix.transpose().as_slice().to_vec()
}

/// Flattens a matrix row-major into a column vector.
pub(crate) fn flatten(matrix: &DMatrix<f64>) -> nalgebra::DVector<f64> {
    nalgebra::DVector::from_vec(row_major(matrix))
}

/// `matrix^power` by repeated squaring.
pub(crate) fn matrix_power(matrix: &DMatrix<f64>, mut power: usize) -> DMatrix<f64> {
    let n = matrix.nrows();
    let mut result = DMatrix::identity(n, n);
    let mut base = matrix.clone();
    while power > 0 {
        if power & 1 == 1 {
            result = &result * &base;
        }
        power >>= 1;
        if power > 0 {
            base = &base * &base;
        }
    }
    result
}

/// Integrates the variational equation from `(t, y)` with `Phi(t) = I`.
///
/// `cadence` carries the configured variational period and the current value of an
/// estimated one. A fixed cadence shares one integration with the period map.
pub(crate) fn probe_monodromy<M, I>(
    driver: &mut SwitchedDriver<I>,
    model: &mut M,
    t: f64,
    y: &[f64],
    period: f64,
    cadence: Option<(PeriodSpec, f64)>,
    tolerances: Tolerances,
) -> Result<MonodromyProbe, EnvelopeError>
where
    M: VectorFieldModel + ?Sized,
    I: OdeIntegrator,
{
    let n = y.len();
    let augmented = VariationalSystem::<M>::augment(y, &DMatrix::identity(n, n));
    let fundamental = |state: &[f64]| VariationalSystem::<M>::split(state, n).1;

    match cadence {
        None => {
            let ret = fixed_return(
                driver,
                model,
                t,
                &augmented,
                period,
                tolerances,
                Propagation::Variational,
            )?;
            Ok(MonodromyProbe {
                period_map: fundamental(&ret.state),
                cadence: None,
            })
        }
        Some((PeriodSpec::Fixed(var_period), _)) => {
            let t_stop = t + period.max(var_period);
            let t_inner = t + period.min(var_period);
            let solution = driver.integrate(
                model,
                (t, t_stop),
                &augmented,
                tolerances,
                &[],
                Propagation::Variational,
            )?;
            let outer = fundamental(&finished(&solution, t)?);
            let inner = solution
                .dense
                .evaluate(t_inner)
                .map(|state| fundamental(&state))
                .ok_or(IntegrationError::OutsideDenseOutput { t: t_inner })?;
            let (period_map, var_map) = if var_period >= period {
                (inner, outer)
            } else {
                (outer, inner)
            };
            Ok(MonodromyProbe {
                period_map,
                cadence: Some((var_map, var_period)),
            })
        }
        Some((PeriodSpec::Estimated { .. }, current)) => {
            let phi_components: Vec<usize> = (n..n + n * n).collect();
            let var = first_return(
                driver,
                model,
                t,
                &augmented,
                current,
                &phi_components,
                tolerances,
                Propagation::Variational,
            )?;
            let ret = fixed_return(
                driver,
                model,
                t,
                &augmented,
                period,
                tolerances,
                Propagation::Variational,
            )?;
            Ok(MonodromyProbe {
                period_map: fundamental(&ret.state),
                cadence: Some((fundamental(&var.state), var.period)),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::systems::VanDerPol;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    #[test]
    fn power_by_squaring() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 1.0, 0.0, 1.0]);
        assert_eq!(matrix_power(&m, 0), DMatrix::identity(2, 2));
        assert_eq!(
            matrix_power(&m, 5),
            DMatrix::from_row_slice(2, 2, &[1.0, 5.0, 0.0, 1.0])
        );
    }

    #[test]
    fn flattening_is_row_major() {
        let m = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 3.0, 4.0]);
        assert_eq!(row_major(&m), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(flatten(&m).as_slice(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn harmonic_monodromy_is_identity_over_one_period() {
        let mut oscillator = VanDerPol::new(0.0, Vec::new());
        let mut driver = SwitchedDriver::new();
        let probe = probe_monodromy(
            &mut driver,
            &mut oscillator,
            0.0,
            &[1.0, 0.0],
            2.0 * PI,
            Some((PeriodSpec::Fixed(PI), PI)),
            Tolerances::new(1e-10, 1e-12),
        )
        .expect("probe");

        let identity = DMatrix::<f64>::identity(2, 2);
        for i in 0..2 {
            for j in 0..2 {
                assert_relative_eq!(probe.period_map[(i, j)], identity[(i, j)], epsilon = 1e-8);
            }
        }
        let (half, var_period) = probe.cadence.expect("cadence");
        assert_eq!(var_period, PI);
        assert_relative_eq!(half[(0, 0)], -1.0, epsilon = 1e-6);
        assert_relative_eq!(half[(1, 1)], -1.0, epsilon = 1e-6);
    }
}
