//! The envelope function `g(t, y) = (y(t + T) - y(t)) / T`.
//!
//! With a fixed period the fine system is integrated over exactly one period. Otherwise the
//! period is estimated on every call as the first return to the hyperplane through `y`
//! orthogonal to the flow, restricted to the configured components.

use super::config::PeriodSpec;
use crate::error::{EnvelopeError, IntegrationError};
use crate::events::{EventDescriptor, EventDirection};
use crate::solvers::{OdeIntegrator, SolveStatus, Tolerances};
use crate::switching::{Propagation, SwitchedDriver, SwitchedSolution};
use crate::traits::{DynamicalSystem, VariationalSystem, VectorFieldModel};
use nalgebra::DVector;
use tracing::{trace, warn};

/// Fraction of the period guess integrated before the return plane is armed.
const WARMUP_FRACTION: f64 = 0.75;
/// The return is searched up to this multiple of the period guess.
const SEARCH_HORIZON: f64 = 2.0;

/// One evaluation of the envelope function.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeEval {
    /// `(y(t + T) - y(t)) / T`.
    pub derivative: DVector<f64>,
    pub period: f64,
    pub t_end: f64,
    pub y_end: DVector<f64>,
    /// The return plane was not crossed and the guess was used as the period.
    pub degenerate: bool,
}

/// End point of one period of the fine system.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Return {
    pub period: f64,
    pub state: Vec<f64>,
    pub degenerate: bool,
}

/// Turns a [`SwitchedSolution`] into its end state, or a fatal error if it failed.
pub(crate) fn finished(solution: &SwitchedSolution, t_start: f64) -> Result<Vec<f64>, EnvelopeError> {
    if let SolveStatus::Failed(message) = &solution.status {
        return Err(EnvelopeError::Integration {
            t: solution.last_time().unwrap_or(t_start),
            message: message.clone(),
        });
    }
    solution
        .last_state()
        .map(<[f64]>::to_vec)
        .ok_or_else(|| EnvelopeError::Integration {
            t: t_start,
            message: "empty trajectory".into(),
        })
}

/// Integrates exactly one period `period` from `(t, y)`.
pub(crate) fn fixed_return<M, I>(
    driver: &mut SwitchedDriver<I>,
    model: &mut M,
    t: f64,
    y: &[f64],
    period: f64,
    tolerances: Tolerances,
    propagation: Propagation,
) -> Result<Return, EnvelopeError>
where
    M: VectorFieldModel + ?Sized,
    I: OdeIntegrator,
{
    let solution = driver.integrate(model, (t, t + period), y, tolerances, &[], propagation)?;
    Ok(Return {
        period,
        state: finished(&solution, t)?,
        degenerate: false,
    })
}

/// Estimates the period from `(t, y)` as the first return to the plane through `y`
/// orthogonal to the flow on `components`.
///
/// Falls back to `guess` (flagged degenerate) when the flow vanishes on the components or
/// no crossing occurs within the search horizon.
pub(crate) fn first_return<M, I>(
    driver: &mut SwitchedDriver<I>,
    model: &mut M,
    t: f64,
    y: &[f64],
    guess: f64,
    components: &[usize],
    tolerances: Tolerances,
    propagation: Propagation,
) -> Result<Return, EnvelopeError>
where
    M: VectorFieldModel + ?Sized,
    I: OdeIntegrator,
{
    let mut flow = vec![0.0; y.len()];
    match propagation {
        Propagation::State => model.apply(t, y, &mut flow),
        Propagation::Variational => VariationalSystem::new(&*model).apply(t, y, &mut flow),
    }
    let norm = components.iter().map(|&c| flow[c] * flow[c]).sum::<f64>().sqrt();

    let t_warm = t + WARMUP_FRACTION * guess;
    let warmup = driver.integrate(model, (t, t_warm), y, tolerances, &[], propagation)?;
    let y_warm = finished(&warmup, t)?;

    if norm == 0.0 || !norm.is_finite() {
        warn!(t, guess, "flow vanishes on the period components; using the period guess");
        let rest =
            driver.integrate(model, (t_warm, t + guess), &y_warm, tolerances, &[], propagation)?;
        return Ok(Return {
            period: guess,
            state: finished(&rest, t)?,
            degenerate: true,
        });
    }

    let normal: Vec<(usize, f64, f64)> = components
        .iter()
        .map(|&c| (c, flow[c] / norm, y[c]))
        .collect();
    let plane = EventDescriptor::new(
        move |_, x| normal.iter().map(|&(c, w, origin)| w * (x[c] - origin)).sum::<f64>(),
        EventDirection::Rising,
        true,
    );

    let search = driver.integrate(
        model,
        (t_warm, t + SEARCH_HORIZON * guess),
        &y_warm,
        tolerances,
        &[plane],
        propagation,
    )?;
    finished(&search, t)?;

    match (search.t_events[0].first(), search.y_events[0].first()) {
        (Some(&t_cross), Some(state)) => {
            trace!(t, period = t_cross - t, "period estimated");
            Ok(Return {
                period: t_cross - t,
                state: state.clone(),
                degenerate: false,
            })
        }
        _ => {
            warn!(t, guess, "no return to the period plane; using the period guess");
            let state = search
                .dense
                .evaluate(t + guess)
                .ok_or(IntegrationError::OutsideDenseOutput { t: t + guess })?;
            Ok(Return {
                period: guess,
                state,
                degenerate: true,
            })
        }
    }
}

/// Evaluates the envelope function, estimating the period when configured to.
#[derive(Debug, Clone)]
pub struct PeriodEstimator {
    spec: PeriodSpec,
    components: Vec<usize>,
    tolerances: Tolerances,
    evaluations: usize,
    degenerate: usize,
}

impl PeriodEstimator {
    pub fn new(spec: PeriodSpec, components: Vec<usize>, tolerances: Tolerances) -> Self {
        Self {
            spec,
            components,
            tolerances,
            evaluations: 0,
            degenerate: 0,
        }
    }

    pub fn spec(&self) -> PeriodSpec {
        self.spec
    }

    /// Number of envelope evaluations so far.
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }

    /// Number of evaluations that fell back to the period guess.
    pub fn degenerate(&self) -> usize {
        self.degenerate
    }

    /// Computes `g(t, y)` and the period it was computed over.
    ///
    /// `guess` seeds the estimate in estimated mode and is ignored for a fixed period.
    pub fn envelope_derivative<M, I>(
        &mut self,
        driver: &mut SwitchedDriver<I>,
        model: &mut M,
        t: f64,
        y: &DVector<f64>,
        guess: f64,
    ) -> Result<EnvelopeEval, EnvelopeError>
    where
        M: VectorFieldModel + ?Sized,
        I: OdeIntegrator,
    {
        self.evaluations += 1;
        let ret = match self.spec {
            PeriodSpec::Fixed(period) => fixed_return(
                driver,
                model,
                t,
                y.as_slice(),
                period,
                self.tolerances,
                Propagation::State,
            )?,
            PeriodSpec::Estimated { .. } => first_return(
                driver,
                model,
                t,
                y.as_slice(),
                guess,
                &self.components,
                self.tolerances,
                Propagation::State,
            )?,
        };
        if ret.degenerate {
            self.degenerate += 1;
        }
        let y_end = DVector::from_vec(ret.state);
        Ok(EnvelopeEval {
            derivative: (&y_end - y) / ret.period,
            period: ret.period,
            t_end: t + ret.period,
            y_end,
            degenerate: ret.degenerate,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::systems::VanDerPol;
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    struct Decay;

    impl DynamicalSystem for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
            out[0] = -x[0];
        }
    }

    impl VectorFieldModel for Decay {}

    struct Drift;

    impl DynamicalSystem for Drift {
        fn dimension(&self) -> usize {
            2
        }

        fn apply(&self, _t: f64, _x: &[f64], out: &mut [f64]) {
            out[0] = 1.0;
            out[1] = 0.5;
        }
    }

    impl VectorFieldModel for Drift {}

    fn tight() -> Tolerances {
        Tolerances::new(1e-10, 1e-12)
    }

    #[test]
    fn fixed_period_difference_quotient() {
        let mut estimator = PeriodEstimator::new(PeriodSpec::Fixed(0.5), vec![0], tight());
        let mut driver = SwitchedDriver::new();
        let y = DVector::from_vec(vec![2.0]);
        let eval = estimator
            .envelope_derivative(&mut driver, &mut Decay, 0.0, &y, 123.0)
            .expect("eval");

        assert_eq!(eval.period, 0.5);
        assert_eq!(eval.t_end, 0.5);
        assert!(!eval.degenerate);
        assert_relative_eq!(eval.y_end[0], 2.0 * (-0.5f64).exp(), max_relative = 1e-8);
        assert_relative_eq!(
            eval.derivative[0],
            (2.0 * (-0.5f64).exp() - 2.0) / 0.5,
            max_relative = 1e-8
        );
        assert_eq!(estimator.evaluations(), 1);
    }

    #[test]
    fn estimates_period_of_harmonic_oscillator() {
        let mut oscillator = VanDerPol::new(0.0, Vec::new());
        let mut estimator = PeriodEstimator::new(
            PeriodSpec::Estimated { guess: 6.0 },
            vec![0, 1],
            tight(),
        );
        let mut driver = SwitchedDriver::new();
        let y = DVector::from_vec(vec![0.3, 1.7]);
        let eval = estimator
            .envelope_derivative(&mut driver, &mut oscillator, 2.0, &y, 6.0)
            .expect("eval");

        assert!(!eval.degenerate);
        assert_relative_eq!(eval.period, 2.0 * PI, epsilon = 1e-7);
        assert_relative_eq!(eval.y_end[0], 0.3, epsilon = 1e-7);
        assert_relative_eq!(eval.y_end[1], 1.7, epsilon = 1e-7);
        assert!(eval.derivative.amax() < 1e-6);
    }

    #[test]
    fn constant_flow_falls_back_to_guess() {
        let mut estimator =
            PeriodEstimator::new(PeriodSpec::Estimated { guess: 1.5 }, vec![0, 1], tight());
        let mut driver = SwitchedDriver::new();
        let y = DVector::from_vec(vec![0.0, 0.0]);
        let eval = estimator
            .envelope_derivative(&mut driver, &mut Drift, 0.0, &y, 1.5)
            .expect("eval");

        assert!(eval.degenerate);
        assert_eq!(eval.period, 1.5);
        assert_relative_eq!(eval.derivative[0], 1.0, epsilon = 1e-9);
        assert_relative_eq!(eval.derivative[1], 0.5, epsilon = 1e-9);
        assert_eq!(estimator.degenerate(), 1);
    }

    #[test]
    fn vanishing_flow_falls_back_to_guess() {
        let mut oscillator = VanDerPol::new(1.0, Vec::new());
        let mut estimator =
            PeriodEstimator::new(PeriodSpec::Estimated { guess: 7.0 }, vec![0, 1], tight());
        let mut driver = SwitchedDriver::new();
        let y = DVector::from_vec(vec![0.0, 0.0]);
        let eval = estimator
            .envelope_derivative(&mut driver, &mut oscillator, 0.0, &y, 7.0)
            .expect("eval");

        assert!(eval.degenerate);
        assert_eq!(eval.period, 7.0);
        assert_eq!(eval.derivative.amax(), 0.0);
    }
}
