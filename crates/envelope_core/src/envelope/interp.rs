//! Fine trajectory between envelope samples.
//!
//! An envelope run keeps one state per macro step. The state at an arbitrary time is
//! recovered by integrating the fine system from the last whole period before that time,
//! starting from the envelope sampled (or linearly interpolated) there.

use super::period::finished;
use super::solver::whole_periods;
use super::types::EnvelopeSolution;
use crate::error::{EnvelopeError, IntegrationError};
use crate::solvers::{OdeIntegrator, Tolerances, Tsit5};
use crate::switching::{Propagation, SwitchedDriver};
use crate::traits::VectorFieldModel;
use tracing::trace;

pub struct EnvelopeInterp<'s, I = Tsit5> {
    solution: &'s EnvelopeSolution,
    driver: SwitchedDriver<I>,
    tolerances: Tolerances,
    /// Mode of the model at every envelope sample.
    mode: usize,
    last: Option<(f64, Vec<f64>)>,
    integrated_time: f64,
}

impl<'s> EnvelopeInterp<'s> {
    pub fn new(solution: &'s EnvelopeSolution, mode: usize, tolerances: Tolerances) -> Self {
        Self::with_driver(solution, mode, tolerances, SwitchedDriver::new())
    }
}

impl<'s, I: OdeIntegrator> EnvelopeInterp<'s, I> {
    pub fn with_driver(
        solution: &'s EnvelopeSolution,
        mode: usize,
        tolerances: Tolerances,
        driver: SwitchedDriver<I>,
    ) -> Self {
        Self {
            solution,
            driver,
            tolerances,
            mode,
            last: None,
            integrated_time: 0.0,
        }
    }

    /// Total fine time integrated over all queries.
    pub fn integrated_time(&self) -> f64 {
        self.integrated_time
    }

    /// State of the fine system at `t`.
    ///
    /// `t` must lie between the first sample and one period past the last. Repeating the
    /// previous query returns the cached state.
    pub fn evaluate<M>(&mut self, model: &mut M, t: f64) -> Result<Vec<f64>, EnvelopeError>
    where
        M: VectorFieldModel + ?Sized,
    {
        if let Some((t_last, y)) = &self.last {
            if *t_last == t {
                return Ok(y.clone());
            }
        }

        let (t0, y0) = self.envelope_point(t)?;
        let y = if t > t0 {
            model.set_mode(self.mode);
            let solution = self.driver.integrate(
                model,
                (t0, t),
                &y0,
                self.tolerances,
                &[],
                Propagation::State,
            )?;
            self.integrated_time += t - t0;
            finished(&solution, t0)?
        } else {
            y0
        };
        trace!(t, t0, "fine state reconstructed");
        self.last = Some((t, y.clone()));
        Ok(y)
    }

    /// Envelope state at the last whole period at or before `t`.
    fn envelope_point(&self, t: f64) -> Result<(f64, Vec<f64>), EnvelopeError> {
        let solution = self.solution;
        let outside = IntegrationError::OutsideDenseOutput { t };
        let (Some(&first), Some(&last), Some(&last_period)) = (
            solution.t.first(),
            solution.t.last(),
            solution.periods.last(),
        ) else {
            return Err(outside.into());
        };
        if !(t >= first && t <= last + last_period) {
            return Err(outside.into());
        }

        let k = solution.t.partition_point(|&s| s <= t) - 1;
        let (t_k, period) = (solution.t[k], solution.periods[k]);
        let periods = whole_periods(t - t_k, period);
        if periods == 0.0 || k + 1 == solution.t.len() {
            return Ok((t_k, solution.y[k].clone()));
        }

        let t0 = t_k + periods * period;
        let weight = (t0 - t_k) / (solution.t[k + 1] - t_k);
        let y0 = solution.y[k]
            .iter()
            .zip(&solution.y[k + 1])
            .map(|(a, b)| a + weight * (b - a))
            .collect();
        Ok((t0, y0))
    }
}
