//! Implicit correctors for the envelope ODE `dY/dt = g(t, Y)`.
//!
//! A corrector solves the implicit equation of one macro step, estimates the local
//! truncation error of the accepted step from divided differences of `g`, and proposes
//! the next step as a whole number of periods.

use super::newton_krylov::{newton_krylov, NewtonOutcome, NewtonSettings};
use crate::error::EnvelopeError;
use nalgebra::DVector;

/// Local truncation error of a macro step together with the per-component coefficient
/// the step-size formula is built from.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalError {
    pub lte: DVector<f64>,
    pub coefficients: DVector<f64>,
}

/// Data of one implicit macro step.
#[derive(Debug, Clone, Copy)]
pub struct CorrectionStep<'a> {
    pub y_cur: &'a DVector<f64>,
    pub f_cur: &'a DVector<f64>,
    /// Explicit predictor, used as the Newton initial guess.
    pub y_predicted: &'a DVector<f64>,
    pub step: f64,
    /// Error scale of the convergence test.
    pub weights: &'a DVector<f64>,
}

pub trait Corrector: Clone {
    /// Order of the local error, used to size the next step.
    fn order(&self) -> u32;

    /// Residual of the implicit equation at candidate `y_next`, given `g_next = g(t_next, y_next)`.
    fn residual(
        &self,
        y_next: &DVector<f64>,
        g_next: &DVector<f64>,
        y_cur: &DVector<f64>,
        f_cur: &DVector<f64>,
        step: f64,
    ) -> DVector<f64>;

    fn local_error(
        &self,
        step: f64,
        y_cur: &DVector<f64>,
        f_cur: &DVector<f64>,
        y_next: &DVector<f64>,
        f_next: &DVector<f64>,
    ) -> LocalError;

    /// Largest step bringing every component's error to its scale, before rounding to periods.
    fn admissible_step(&self, scale: f64, coefficient: f64) -> f64;

    /// Records an accepted step. Correctors that carry divided differences across steps
    /// update them here.
    fn record_step(
        &mut self,
        _y_prev: &DVector<f64>,
        _f_prev: &DVector<f64>,
        _y_next: &DVector<f64>,
        _f_next: &DVector<f64>,
    ) {
    }

    /// Solves the implicit equation with Newton-Krylov, evaluating `g` through `envelope`.
    fn correct<G>(
        &self,
        step: CorrectionStep<'_>,
        mut envelope: G,
        settings: NewtonSettings,
        fd_step: f64,
    ) -> Result<NewtonOutcome, EnvelopeError>
    where
        G: FnMut(&DVector<f64>) -> Result<DVector<f64>, EnvelopeError>,
    {
        newton_krylov(
            |y| {
                let g = envelope(y)?;
                Ok(self.residual(y, &g, step.y_cur, step.f_cur, step.step))
            },
            step.y_predicted.clone(),
            step.weights,
            settings,
            fd_step,
        )
    }

    /// Next step as a whole number of periods, at most `max_periods`.
    ///
    /// The result may be zero when even one period exceeds the error target.
    fn next_step(
        &self,
        scale: &DVector<f64>,
        coefficients: &DVector<f64>,
        period: f64,
        max_periods: usize,
    ) -> f64 {
        let admissible = scale
            .iter()
            .zip(coefficients.iter())
            .map(|(s, c)| self.admissible_step(*s, *c))
            .fold(f64::INFINITY, f64::min);
        let periods = (admissible / period).floor().min(max_periods as f64).max(0.0);
        periods * period
    }
}

/// Componentwise `num / den`, zero where the quotient is not finite.
///
/// Small denominators are kept whatever their scale; the zero coefficients left by a
/// vanishing denominator are replaced later by [`guard_coefficients`].
pub(crate) fn divided_difference(num: &DVector<f64>, den: &DVector<f64>) -> DVector<f64> {
    num.zip_map(den, |n, d| {
        let q = n / d;
        if q.is_finite() {
            q
        } else {
            0.0
        }
    })
}

/// Replaces zero coefficients by the smallest non-zero one, or by the smallest positive
/// float when all vanish, so the step-size formula stays finite.
pub(crate) fn guard_coefficients(coefficients: DVector<f64>) -> DVector<f64> {
    let smallest = coefficients
        .iter()
        .copied()
        .filter(|c| *c > 0.0)
        .fold(f64::INFINITY, f64::min);
    let floor = if smallest.is_finite() {
        smallest
    } else {
        f64::MIN_POSITIVE
    };
    coefficients.map(|c| if c == 0.0 { floor } else { c })
}

/// Backward Euler on the envelope: first order, local error of order two.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackwardEuler;

impl Corrector for BackwardEuler {
    fn order(&self) -> u32 {
        2
    }

    fn residual(
        &self,
        y_next: &DVector<f64>,
        g_next: &DVector<f64>,
        y_cur: &DVector<f64>,
        _f_cur: &DVector<f64>,
        step: f64,
    ) -> DVector<f64> {
        y_next - y_cur - g_next * step
    }

    fn local_error(
        &self,
        step: f64,
        y_cur: &DVector<f64>,
        f_cur: &DVector<f64>,
        y_next: &DVector<f64>,
        f_next: &DVector<f64>,
    ) -> LocalError {
        let df = divided_difference(&(f_next - f_cur), &(y_next - y_cur));
        let coefficients = guard_coefficients(f_next.component_mul(&df).abs());
        let lte = &coefficients * (step * step / 2.0);
        LocalError { lte, coefficients }
    }

    fn admissible_step(&self, scale: f64, coefficient: f64) -> f64 {
        (2.0 * scale / coefficient).sqrt()
    }
}

/// Trapezoidal rule on the envelope: second order, local error of order three.
///
/// The second divided difference of `g` needs the first divided difference of the
/// previous accepted step, which starts at zero.
#[derive(Debug, Clone, Default)]
pub struct Trapezoidal {
    df_cur: Option<DVector<f64>>,
}

impl Trapezoidal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Corrector for Trapezoidal {
    fn order(&self) -> u32 {
        3
    }

    fn residual(
        &self,
        y_next: &DVector<f64>,
        g_next: &DVector<f64>,
        y_cur: &DVector<f64>,
        f_cur: &DVector<f64>,
        step: f64,
    ) -> DVector<f64> {
        y_next - y_cur - (f_cur + g_next) * (step / 2.0)
    }

    fn local_error(
        &self,
        step: f64,
        y_cur: &DVector<f64>,
        f_cur: &DVector<f64>,
        y_next: &DVector<f64>,
        f_next: &DVector<f64>,
    ) -> LocalError {
        let dy = y_next - y_cur;
        let df_next = divided_difference(&(f_next - f_cur), &dy);
        let df_cur = self
            .df_cur
            .clone()
            .filter(|df| df.len() == dy.len())
            .unwrap_or_else(|| DVector::zeros(dy.len()));
        let d2f = divided_difference(&(&df_next - df_cur), &dy);
        let inner = f_next.component_mul(&d2f) + df_next.component_mul(&df_next) * 2.0;
        let coefficients = guard_coefficients(f_next.component_mul(&inner).abs());
        let lte = &coefficients * (step.powi(3) / 12.0);
        LocalError { lte, coefficients }
    }

    fn admissible_step(&self, scale: f64, coefficient: f64) -> f64 {
        (12.0 * scale / coefficient).cbrt()
    }

    fn record_step(
        &mut self,
        y_prev: &DVector<f64>,
        f_prev: &DVector<f64>,
        y_next: &DVector<f64>,
        f_next: &DVector<f64>,
    ) {
        self.df_cur = Some(divided_difference(&(f_next - f_prev), &(y_next - y_prev)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn v(values: &[f64]) -> DVector<f64> {
        DVector::from_row_slice(values)
    }

    #[test]
    fn backward_euler_error_and_step() {
        let be = BackwardEuler;
        // g(y) = -0.1 y sampled at y = 1 and y = 0.9.
        let local = be.local_error(1.0, &v(&[1.0]), &v(&[-0.1]), &v(&[0.9]), &v(&[-0.09]));
        // |f_next * df| = 0.09 * 0.1
        assert_relative_eq!(local.coefficients[0], 0.009, epsilon = 1e-15);
        assert_relative_eq!(local.lte[0], 0.0045, epsilon = 1e-15);

        // sqrt(2 * 1e-3 / 0.009) = 0.471..., 4.71 periods of 0.1 -> 4 periods
        let step = be.next_step(&v(&[1e-3]), &local.coefficients, 0.1, 1000);
        assert_relative_eq!(step, 0.4, epsilon = 1e-12);
        assert_eq!(be.next_step(&v(&[1e-3]), &local.coefficients, 0.1, 2), 0.2);
        assert_eq!(be.order(), 2);
    }

    #[test]
    fn zero_coefficients_are_guarded() {
        let be = BackwardEuler;
        // Constant g: the divided difference vanishes everywhere.
        let local = be.local_error(
            5.0,
            &v(&[1.0, 2.0]),
            &v(&[0.3, 0.0]),
            &v(&[2.5, 2.0]),
            &v(&[0.3, 0.0]),
        );
        assert!(local.coefficients.iter().all(|c| *c == f64::MIN_POSITIVE));
        let step = be.next_step(&v(&[1e-6, 1e-6]), &local.coefficients, 1.0, 50);
        assert_eq!(step, 50.0);
    }

    #[test]
    fn small_scale_components_keep_their_error() {
        let be = BackwardEuler;
        // g(y) = -0.1 y on a component of size 1e-18: the increment is far below f64::EPSILON.
        let local = be.local_error(
            1.0,
            &v(&[1e-18]),
            &v(&[-1e-19]),
            &v(&[0.9e-18]),
            &v(&[-0.9e-19]),
        );
        assert_relative_eq!(local.coefficients[0], 0.9e-20, max_relative = 1e-9);
        assert_relative_eq!(local.lte[0], 0.45e-20, max_relative = 1e-9);

        // A truly vanishing increment still yields a finite coefficient.
        let divided = divided_difference(&v(&[1.0, 0.0]), &v(&[0.0, 0.0]));
        assert_eq!(divided, v(&[0.0, 0.0]));
    }

    #[test]
    fn mixed_zero_coefficient_takes_smallest_nonzero() {
        let guarded = guard_coefficients(v(&[0.0, 3.0, 2.0]));
        assert_eq!(guarded, v(&[2.0, 3.0, 2.0]));
    }

    #[test]
    fn trapezoidal_uses_recorded_divided_difference() {
        let mut trap = Trapezoidal::new();
        // Linear g(y) = -y: df = -1 on every step, so the second difference is zero once
        // the previous step has been recorded.
        trap.record_step(&v(&[2.0]), &v(&[-2.0]), &v(&[1.5]), &v(&[-1.5]));
        let local = trap.local_error(1.0, &v(&[1.5]), &v(&[-1.5]), &v(&[1.0]), &v(&[-1.0]));
        // |f (f * 0 + 2 * 1)| = 2
        assert_relative_eq!(local.coefficients[0], 2.0, epsilon = 1e-12);
        assert_relative_eq!(local.lte[0], 2.0 / 12.0, epsilon = 1e-12);

        // (12 * 1e-3 / 2)^(1/3) = 0.1817
        let step = trap.next_step(&v(&[1e-3]), &local.coefficients, 0.05, 100);
        assert_relative_eq!(step, 0.15, epsilon = 1e-12);
        assert_eq!(trap.order(), 3);
    }

    #[test]
    fn residuals_match_the_integration_rules() {
        let y_cur = v(&[1.0]);
        let f_cur = v(&[2.0]);
        let y_next = v(&[4.0]);
        let g_next = v(&[1.0]);
        assert_eq!(
            BackwardEuler.residual(&y_next, &g_next, &y_cur, &f_cur, 2.0),
            v(&[1.0])
        );
        assert_eq!(
            Trapezoidal::new().residual(&y_next, &g_next, &y_cur, &f_cur, 2.0),
            v(&[0.0])
        );
    }
}
