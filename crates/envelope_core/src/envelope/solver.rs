use super::config::{EnvelopeConfig, PeriodSpec};
use super::corrector::{BackwardEuler, CorrectionStep, Corrector, Trapezoidal};
use super::newton_krylov::NewtonOutcome;
use super::period::{EnvelopeEval, PeriodEstimator};
use super::types::{EnvelopeSolution, EnvelopeStats, EnvelopeStatus, StepOutcome};
use super::variational::{
    flatten, matrix_power, probe_monodromy, row_major, MonodromyProbe, VariationalSample,
};
use crate::error::{ConfigError, EnvelopeError};
use crate::solvers::{OdeIntegrator, Tsit5};
use crate::switching::SwitchedDriver;
use crate::traits::VectorFieldModel;
use nalgebra::{DMatrix, DVector};
use tracing::{debug, info, warn};

/// Two times closer than this fraction of a period are the same envelope point.
const PERIOD_FRACTION: f64 = 1e-6;

/// Number of whole periods in `span`, tolerating rounding in accumulated times.
pub(super) fn whole_periods(span: f64, period: f64) -> f64 {
    (span / period + PERIOD_FRACTION).floor().max(0.0)
}

/// Backward Euler envelope solver.
pub type BeEnvelope<'m, M> = EnvelopeSolver<'m, M, BackwardEuler>;

/// Trapezoidal envelope solver.
pub type TrapEnvelope<'m, M> = EnvelopeSolver<'m, M, Trapezoidal>;

/// Adaptive macro-step integrator of the envelope of a periodically forced or
/// autonomous oscillating system.
///
/// Every macro step is a whole number of periods of the fine system. The step is
/// solved implicitly by the corrector `C`, checked against period drift and the
/// corrector's local error, and resized from that error estimate.
pub struct EnvelopeSolver<'m, M: ?Sized, C, I = Tsit5> {
    model: &'m mut M,
    corrector: C,
    variational_corrector: C,
    config: EnvelopeConfig,
    driver: SwitchedDriver<I>,
    estimator: PeriodEstimator,
    t_span: (f64, f64),
    y0: DVector<f64>,
    mode: usize,
}

impl<'m, M, C> EnvelopeSolver<'m, M, C>
where
    M: VectorFieldModel + ?Sized,
    C: Corrector,
{
    /// Validates the problem against the model. No integration happens until [`Self::solve`].
    pub fn new(
        model: &'m mut M,
        corrector: C,
        config: EnvelopeConfig,
        t_span: (f64, f64),
        y0: &[f64],
    ) -> Result<Self, EnvelopeError> {
        let driver = SwitchedDriver::with_integrator(Tsit5::new(), config.driver());
        Self::with_driver(model, corrector, config, t_span, y0, driver)
    }
}

/// Accepted macro step, applied to the progress by [`EnvelopeSolver::accept`].
struct AcceptedStep {
    t_next: f64,
    y_next: DVector<f64>,
    eval: EnvelopeEval,
    next_step: f64,
    periods: usize,
    probe: Option<MonodromyProbe>,
    variational: Option<VariationalUpdate>,
}

/// Fundamental matrix samples of the variational error test.
struct VariationalUpdate {
    samples: Vec<(f64, DMatrix<f64>)>,
    var_period: f64,
    /// `(Phi1, rate into Phi1, Phi2, rate into Phi2)` flattened, when the test ran.
    rates: Option<(DVector<f64>, DVector<f64>, DVector<f64>, DVector<f64>)>,
}

enum Attempt {
    Accepted(Box<AcceptedStep>),
    PeriodDrift,
    LocalError { next_step: f64, single_period: bool },
    NotConverged,
}

impl Attempt {
    fn outcome(&self) -> StepOutcome {
        match self {
            Attempt::Accepted(_) => StepOutcome::Accepted,
            Attempt::PeriodDrift => StepOutcome::PeriodDrift,
            Attempt::LocalError { .. } => StepOutcome::LocalError,
            Attempt::NotConverged => StepOutcome::NotConverged,
        }
    }
}

struct VariationalProgress {
    fundamental: DMatrix<f64>,
    fundamentals: Vec<DMatrix<f64>>,
    monodromy: Vec<DMatrix<f64>>,
    samples: Vec<VariationalSample>,
    var_period: Option<f64>,
}

impl VariationalProgress {
    /// Records a sample unless it repeats the previous one.
    fn sample(&mut self, t: f64, fundamental: &DMatrix<f64>) {
        let sample = VariationalSample::new(t, fundamental);
        if self.samples.last() != Some(&sample) {
            self.samples.push(sample);
        }
    }
}

struct Progress {
    t: Vec<f64>,
    y: Vec<DVector<f64>>,
    periods: Vec<f64>,
    t_cur: f64,
    y_cur: DVector<f64>,
    f_cur: DVector<f64>,
    /// Envelope evaluation at the current point.
    current: EnvelopeEval,
    period: f64,
    step: f64,
    next_step: f64,
    rejections: usize,
    variational: Option<VariationalProgress>,
    stats: EnvelopeStats,
}

impl Progress {
    fn push(&mut self, t: f64, y: DVector<f64>, eval: EnvelopeEval) {
        self.t.push(t);
        self.y.push(y.clone());
        self.periods.push(eval.period);
        self.t_cur = t;
        self.y_cur = y;
        self.f_cur = eval.derivative.clone();
        self.period = eval.period;
        self.current = eval;
    }
}

/// Evaluates the envelope function from the envelope points' mode.
fn evaluate_envelope<M, I>(
    estimator: &mut PeriodEstimator,
    driver: &mut SwitchedDriver<I>,
    model: &mut M,
    mode: usize,
    t: f64,
    y: &DVector<f64>,
    guess: f64,
) -> Result<EnvelopeEval, EnvelopeError>
where
    M: VectorFieldModel + ?Sized,
    I: OdeIntegrator,
{
    let advances = |period: f64| period.is_finite() && period > 0.0 && t + period > t;
    if !advances(guess) {
        return Err(EnvelopeError::DegeneratePeriod { t, period: guess });
    }
    model.set_mode(mode);
    let eval = estimator.envelope_derivative(driver, model, t, y, guess)?;
    if !advances(eval.period) {
        return Err(EnvelopeError::DegeneratePeriod {
            t,
            period: eval.period,
        });
    }
    Ok(eval)
}

impl<'m, M, C, I> EnvelopeSolver<'m, M, C, I>
where
    M: VectorFieldModel + ?Sized,
    C: Corrector,
    I: OdeIntegrator,
{
    /// Like [`EnvelopeSolver::new`] with a caller-supplied fine driver.
    pub fn with_driver(
        model: &'m mut M,
        corrector: C,
        config: EnvelopeConfig,
        t_span: (f64, f64),
        y0: &[f64],
        driver: SwitchedDriver<I>,
    ) -> Result<Self, EnvelopeError> {
        let n = model.dimension();
        if y0.len() != n {
            return Err(ConfigError::DimensionMismatch {
                expected: n,
                actual: y0.len(),
            }
            .into());
        }
        let (t0, t1) = t_span;
        if !(t0.is_finite() && t1.is_finite() && t1 > t0) {
            return Err(ConfigError::InvalidSpan { t0, t1 }.into());
        }
        let components = match config.period_components() {
            Some(components) => {
                if let Some(&index) = components.iter().find(|&&c| c >= n) {
                    return Err(ConfigError::ComponentOutOfRange {
                        index,
                        dimension: n,
                    }
                    .into());
                }
                components.to_vec()
            }
            None => (0..n).collect(),
        };
        if config.variational().is_some() && model.jacobian(t0, y0).is_none() {
            return Err(ConfigError::MissingJacobian.into());
        }

        let estimator = PeriodEstimator::new(config.period(), components, config.fun_tolerances());
        let mode = model.mode();
        Ok(Self {
            model,
            variational_corrector: corrector.clone(),
            corrector,
            config,
            driver,
            estimator,
            t_span,
            y0: DVector::from_row_slice(y0),
            mode,
        })
    }

    pub fn config(&self) -> &EnvelopeConfig {
        &self.config
    }

    /// Runs the envelope integration over the whole time span.
    ///
    /// Fatal failures are reported through [`EnvelopeSolution::status`] together with
    /// every point accepted before them.
    pub fn solve(mut self) -> EnvelopeSolution {
        let (t0, t_end) = self.t_span;
        info!(
            t0,
            t_end,
            dimension = self.y0.len(),
            order = self.corrector.order(),
            "envelope integration started"
        );

        let mut progress = match self.initialize() {
            Ok(progress) => progress,
            Err(error) => {
                warn!(%error, "envelope initialization failed");
                return self.initial_failure(error);
            }
        };

        let status = match self.run(&mut progress) {
            Ok(()) => EnvelopeStatus::Completed,
            Err(error) => {
                warn!(t = progress.t_cur, %error, "envelope integration failed");
                EnvelopeStatus::Failed(error)
            }
        };
        info!(
            t = progress.t_cur,
            accepted = progress.stats.accepted,
            rejected = progress.stats.rejected(),
            evaluations = self.estimator.evaluations(),
            "envelope integration finished"
        );
        self.finish(progress, status)
    }

    fn evaluate(&mut self, t: f64, y: &DVector<f64>, guess: f64) -> Result<EnvelopeEval, EnvelopeError> {
        evaluate_envelope(
            &mut self.estimator,
            &mut self.driver,
            &mut *self.model,
            self.mode,
            t,
            y,
            guess,
        )
    }

    fn probe(
        &mut self,
        t: f64,
        y: &DVector<f64>,
        period: f64,
        var_period: Option<f64>,
    ) -> Result<MonodromyProbe, EnvelopeError> {
        let cadence = self
            .config
            .variational()
            .and_then(|v| v.cadence())
            .map(|spec| (spec, var_period.unwrap_or_else(|| spec.value())));
        self.model.set_mode(self.mode);
        probe_monodromy(
            &mut self.driver,
            &mut *self.model,
            t,
            y.as_slice(),
            period,
            cadence,
            self.config.fun_tolerances(),
        )
    }

    fn initialize(&mut self) -> Result<Progress, EnvelopeError> {
        let (t0, _) = self.t_span;
        let y0 = self.y0.clone();
        let eval = self.evaluate(t0, &y0, self.config.period().value())?;
        let period = eval.period;

        let variational = match self.config.variational() {
            None => None,
            Some(settings) => {
                let var_period = match settings.cadence() {
                    None => None,
                    Some(PeriodSpec::Fixed(var_period)) => Some(var_period),
                    Some(PeriodSpec::Estimated { guess }) => self
                        .probe(t0, &y0, period, Some(guess))?
                        .cadence
                        .map(|(_, var_period)| var_period),
                };
                let n = y0.len();
                let identity = DMatrix::identity(n, n);
                Some(VariationalProgress {
                    fundamental: identity.clone(),
                    fundamentals: vec![identity.clone()],
                    monodromy: Vec::new(),
                    samples: vec![VariationalSample::new(t0, &identity)],
                    var_period,
                })
            }
        };

        Ok(Progress {
            t: vec![t0],
            y: vec![y0.clone()],
            periods: vec![period],
            t_cur: t0,
            f_cur: eval.derivative.clone(),
            y_cur: y0,
            current: eval,
            period,
            step: period,
            next_step: period,
            rejections: 0,
            variational,
            stats: EnvelopeStats::default(),
        })
    }

    fn reached_end(&self, progress: &Progress) -> bool {
        self.t_span.1 - progress.t_cur <= PERIOD_FRACTION * progress.period
    }

    fn run(&mut self, progress: &mut Progress) -> Result<(), EnvelopeError> {
        while !self.reached_end(progress) {
            let attempt = self.attempt(progress)?;
            let outcome = attempt.outcome();
            progress.stats.record(outcome);
            let halved = ((progress.step / progress.period).round() / 2.0).floor() * progress.period;

            match attempt {
                Attempt::Accepted(step) => {
                    self.accept(progress, *step);
                }
                Attempt::PeriodDrift => {
                    progress.rejections += 1;
                    if progress.step > 2.0 * progress.period {
                        progress.next_step = halved;
                    } else {
                        self.one_period_step(progress)?;
                    }
                }
                Attempt::LocalError {
                    next_step,
                    single_period,
                } => {
                    progress.rejections += 1;
                    if single_period {
                        self.one_period_step(progress)?;
                    } else {
                        progress.next_step = next_step;
                    }
                }
                Attempt::NotConverged => {
                    progress.rejections += 1;
                    progress.next_step = halved;
                }
            }
            debug!(
                t = progress.t_cur,
                period = progress.period,
                step = progress.step,
                next_step = progress.next_step,
                outcome = ?outcome,
                "macro step"
            );

            if progress.rejections > self.config.max_rejections() {
                return Err(EnvelopeError::StepTooSmall {
                    t: progress.t_cur,
                    period: progress.period,
                    rejections: progress.rejections,
                });
            }
            if progress.next_step < progress.period && !self.reached_end(progress) {
                self.one_period_step(progress)?;
            }
            progress.step = progress.next_step;
        }
        Ok(())
    }

    /// Clips a proposed step so it does not run past the end of the span.
    fn clip_to_end(&self, t: f64, step: f64, period: f64) -> f64 {
        let remaining = self.t_span.1 - t;
        if step > remaining + PERIOD_FRACTION * period {
            period * whole_periods(remaining, period)
        } else {
            step
        }
    }

    fn attempt(&mut self, progress: &mut Progress) -> Result<Attempt, EnvelopeError> {
        let t_cur = progress.t_cur;
        let period = progress.period;

        let mut step = self.clip_to_end(t_cur, progress.step, period);
        step = step.max(period);
        let periods = (step / period).round().max(1.0) as usize;
        let step = periods as f64 * period;
        progress.step = step;
        let t_next = t_cur + step;

        let probe = match self.config.variational() {
            Some(_) => {
                let var_period = progress.variational.as_ref().and_then(|v| v.var_period);
                let y_cur = progress.y_cur.clone();
                Some(self.probe(t_cur, &y_cur, period, var_period)?)
            }
            None => None,
        };

        let y_next = if periods == 1 {
            progress.current.y_end.clone()
        } else {
            let y_predicted = &progress.y_cur + &progress.f_cur * step;
            let tolerances = self.config.tolerances();
            let weights = y_predicted.map(|v| tolerances.atol + tolerances.rtol * v.abs());
            let fd_step = self.config.fun_tolerances().rtol.sqrt().max(f64::EPSILON.sqrt());
            let newton = self.config.newton();
            let mode = self.mode;
            let Self {
                model,
                corrector,
                driver,
                estimator,
                ..
            } = &mut *self;
            let outcome = corrector.correct(
                CorrectionStep {
                    y_cur: &progress.y_cur,
                    f_cur: &progress.f_cur,
                    y_predicted: &y_predicted,
                    step,
                    weights: &weights,
                },
                |y| {
                    evaluate_envelope(estimator, driver, &mut **model, mode, t_next, y, period)
                        .map(|eval| eval.derivative)
                },
                newton,
                fd_step,
            )?;
            match outcome {
                NewtonOutcome::Converged { solution, .. } => solution,
                NewtonOutcome::NotConverged {
                    iterations,
                    residual_norm,
                } => {
                    warn!(
                        t = t_cur,
                        step,
                        iterations,
                        residual_norm,
                        "corrector did not converge"
                    );
                    return Ok(Attempt::NotConverged);
                }
            }
        };

        let eval = self.evaluate(t_next, &y_next, period)?;
        if self.config.period().is_estimated()
            && (eval.period - period).abs() > self.config.period_tolerance()
        {
            return Ok(Attempt::PeriodDrift);
        }

        let tolerances = self.config.tolerances();
        let scale = y_next.map(|v| tolerances.atol + tolerances.rtol * v.abs());
        let local = self.corrector.local_error(
            step,
            &progress.y_cur,
            &progress.f_cur,
            &y_next,
            &eval.derivative,
        );
        let period_next = eval.period;
        let mut next_step = self.corrector.next_step(
            &scale,
            &local.coefficients,
            period_next,
            self.config.max_step(),
        );
        next_step = self.clip_to_end(t_next, next_step, period_next);
        let mut reject = local.lte.iter().zip(scale.iter()).any(|(e, s)| e > s);

        let variational = match (&probe, progress.variational.as_ref()) {
            (Some(probe), Some(state)) => match (&probe.cadence, state.var_period) {
                (Some((var_map, new_var_period)), Some(var_period)) => {
                    let (update, limit, rejected) =
                        self.variational_error(t_cur, step, &state.fundamental, var_map, var_period);
                    if let Some(limit) = limit {
                        next_step = next_step.min(whole_periods(limit, period_next) * period_next);
                    }
                    reject |= rejected;
                    Some(VariationalUpdate {
                        var_period: *new_var_period,
                        ..update
                    })
                }
                _ => None,
            },
            _ => None,
        };

        if reject {
            return Ok(Attempt::LocalError {
                next_step,
                single_period: periods == 1,
            });
        }
        Ok(Attempt::Accepted(Box::new(AcceptedStep {
            t_next,
            y_next,
            eval,
            next_step,
            periods,
            probe,
            variational,
        })))
    }

    /// Local error test on the fundamental matrix sampled at the variational period.
    ///
    /// Returns the samples, the largest step the test admits and whether it failed.
    fn variational_error(
        &self,
        t_cur: f64,
        step: f64,
        fundamental: &DMatrix<f64>,
        var_map: &DMatrix<f64>,
        var_period: f64,
    ) -> (VariationalUpdate, Option<f64>, bool) {
        let n_var = (step / var_period + PERIOD_FRACTION).floor() as usize + 1;
        let phi1 = var_map * fundamental;
        let phi2 = matrix_power(var_map, n_var) * fundamental;
        let t1 = t_cur + var_period;
        let t2 = t_cur + n_var as f64 * var_period;

        let mut update = VariationalUpdate {
            samples: vec![
                (t_cur, fundamental.clone()),
                (t1, phi1.clone()),
                (t2, phi2.clone()),
            ],
            var_period,
            rates: None,
        };
        let Some(settings) = self.config.variational() else {
            return (update, None, false);
        };
        if n_var < 2 {
            return (update, None, false);
        }

        let y0 = flatten(fundamental);
        let y1 = flatten(&phi1);
        let y2 = flatten(&phi2);
        let f1 = (&y1 - &y0) / var_period;
        let f2 = (&y2 - &y1) / (t2 - t1);
        let local = self
            .variational_corrector
            .local_error(t2 - t1, &y1, &f1, &y2, &f2);
        let tolerances = settings.tolerances();
        let scale = y2.map(|v| tolerances.atol + tolerances.rtol * v.abs());
        let limit = self.variational_corrector.next_step(
            &scale,
            &local.coefficients,
            var_period,
            usize::MAX,
        );
        let rejected = local.lte.iter().zip(scale.iter()).any(|(e, s)| e > s);
        update.rates = Some((y1, f1, y2, f2));
        (update, Some(limit), rejected)
    }

    fn accept(&mut self, progress: &mut Progress, step: AcceptedStep) {
        self.corrector.record_step(
            &progress.y_cur,
            &progress.f_cur,
            &step.y_next,
            &step.eval.derivative,
        );

        if let Some(state) = progress.variational.as_mut() {
            if let Some(probe) = &step.probe {
                let map = matrix_power(&probe.period_map, step.periods);
                state.fundamental = &map * &state.fundamental;
                state.monodromy.push(map);
                state.fundamentals.push(state.fundamental.clone());
            }
            if let Some(update) = step.variational {
                for (t, phi) in &update.samples {
                    state.sample(*t, phi);
                }
                state.var_period = Some(update.var_period);
                if let Some((y1, f1, y2, f2)) = update.rates {
                    self.variational_corrector.record_step(&y1, &f1, &y2, &f2);
                }
            }
        }

        progress.push(step.t_next, step.y_next, step.eval);
        progress.next_step = if step.next_step == 0.0 {
            progress.period
        } else {
            step.next_step
        };
        progress.rejections = 0;
    }

    /// Advances the envelope by exactly one fine period along the true trajectory.
    fn one_period_step(&mut self, progress: &mut Progress) -> Result<(), EnvelopeError> {
        let t_cur = progress.t_cur;
        let period = progress.period;

        if self.config.variational().is_some() {
            let var_period = progress.variational.as_ref().and_then(|v| v.var_period);
            let y_cur = progress.y_cur.clone();
            let probe = self.probe(t_cur, &y_cur, period, var_period)?;
            if let Some(state) = progress.variational.as_mut() {
                state.fundamental = &probe.period_map * &state.fundamental;
                state.monodromy.push(probe.period_map.clone());
                state.fundamentals.push(state.fundamental.clone());
                if let Some((var_map, new_var_period)) = &probe.cadence {
                    let phi0 = state.fundamentals[state.fundamentals.len() - 2].clone();
                    let t_var = t_cur + var_period.unwrap_or(*new_var_period);
                    let phi1 = var_map * &phi0;
                    state.sample(t_cur, &phi0);
                    state.sample(t_var, &phi1);
                    state.var_period = Some(*new_var_period);
                }
            }
        }

        let t_new = progress.current.t_end;
        let y_new = progress.current.y_end.clone();
        let eval = self.evaluate(t_new, &y_new, period)?;
        self.corrector
            .record_step(&progress.y_cur, &progress.f_cur, &y_new, &eval.derivative);
        progress.push(t_new, y_new, eval);
        progress.step = progress.period;
        progress.next_step = progress.period;
        progress.rejections = 0;
        progress.stats.record(StepOutcome::OnePeriod);
        debug!(t = t_new, period = progress.period, "one period step");
        Ok(())
    }

    fn collect_stats(&self, mut stats: EnvelopeStats) -> EnvelopeStats {
        stats.evaluations = self.estimator.evaluations();
        stats.degenerate = self.estimator.degenerate();
        stats.fine = self.driver.stats();
        stats
    }

    fn initial_failure(self, error: EnvelopeError) -> EnvelopeSolution {
        let (t0, _) = self.t_span;
        EnvelopeSolution {
            t: vec![t0],
            y: vec![self.y0.iter().copied().collect()],
            periods: vec![self.config.period().value()],
            fundamental: Vec::new(),
            monodromy: Vec::new(),
            variational_samples: Vec::new(),
            stats: self.collect_stats(EnvelopeStats::default()),
            status: EnvelopeStatus::Failed(error),
        }
    }

    /// Builds the solution, dropping samples more than half a period past the end.
    fn finish(self, progress: Progress, status: EnvelopeStatus) -> EnvelopeSolution {
        let limit = self.t_span.1 + progress.period / 2.0;
        let keep = progress.t.iter().take_while(|&&t| t <= limit).count().max(1);

        let (fundamental, monodromy, variational_samples) = match &progress.variational {
            Some(state) => (
                state.fundamentals.iter().take(keep).map(row_major).collect(),
                state
                    .monodromy
                    .iter()
                    .take(keep.saturating_sub(1))
                    .map(row_major)
                    .collect(),
                state
                    .samples
                    .iter()
                    .filter(|sample| sample.t <= limit)
                    .cloned()
                    .collect(),
            ),
            None => (Vec::new(), Vec::new(), Vec::new()),
        };

        EnvelopeSolution {
            t: progress.t[..keep].to_vec(),
            y: progress.y[..keep]
                .iter()
                .map(|y| y.iter().copied().collect())
                .collect(),
            periods: progress.periods[..keep].to_vec(),
            fundamental,
            monodromy,
            variational_samples,
            stats: self.collect_stats(progress.stats),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::config::{EnvelopeSettings, VariationalSettings};
    use crate::envelope::newton_krylov::NewtonSettings;
    use crate::events::{EventDescriptor, EventDirection};
    use crate::solvers::{Tolerances, Tsit5Settings};
    use crate::switching::{DriverSettings, Propagation};
    use crate::traits::{DynamicalSystem, VariationalSystem};
    use approx::assert_relative_eq;
    use std::f64::consts::PI;

    /// `y' = -lambda y + a cos(2 pi t)`: its one-period map is affine and known in closed form.
    struct Forced {
        lambda: f64,
        amplitude: f64,
    }

    impl Forced {
        fn exact(&self, y0: f64, periods: f64) -> f64 {
            let fixed = self.amplitude * self.lambda / (self.lambda.powi(2) + 4.0 * PI * PI);
            (-self.lambda * periods).exp() * (y0 - fixed) + fixed
        }
    }

    impl DynamicalSystem for Forced {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
            out[0] = -self.lambda * x[0] + self.amplitude * (2.0 * PI * t).cos();
        }

        fn jacobian(&self, _t: f64, _x: &[f64]) -> Option<DMatrix<f64>> {
            Some(DMatrix::from_element(1, 1, -self.lambda))
        }
    }

    impl VectorFieldModel for Forced {}

    /// Oscillator with Coulomb friction. Mode 0 rotates about `(friction, 0)`, mode 1 about
    /// `(-friction, 0)`; the velocity changing sign switches the mode.
    struct Coulomb {
        friction: f64,
        mode: usize,
    }

    impl DynamicalSystem for Coulomb {
        fn dimension(&self) -> usize {
            2
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
            let center = if self.mode == 0 {
                self.friction
            } else {
                -self.friction
            };
            out[0] = x[1];
            out[1] = center - x[0];
        }
    }

    impl VectorFieldModel for Coulomb {
        fn events(&self) -> Vec<EventDescriptor> {
            vec![
                EventDescriptor::new(|_, x| x[1], EventDirection::Falling, true),
                EventDescriptor::new(|_, x| x[1], EventDirection::Rising, true),
            ]
        }

        fn handle_event(&mut self, index: usize, _t: f64, _x: &[f64]) -> Option<DMatrix<f64>> {
            self.mode = index;
            None
        }

        fn mode(&self) -> usize {
            self.mode
        }

        fn set_mode(&mut self, mode: usize) {
            self.mode = mode;
        }
    }

    /// Damped linear oscillator.
    struct Linear;

    impl Linear {
        fn matrix() -> DMatrix<f64> {
            DMatrix::from_row_slice(2, 2, &[-0.1, 1.0, -1.0, -0.3])
        }
    }

    impl DynamicalSystem for Linear {
        fn dimension(&self) -> usize {
            2
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
            let a = Self::matrix();
            out[0] = a[(0, 0)] * x[0] + a[(0, 1)] * x[1];
            out[1] = a[(1, 0)] * x[0] + a[(1, 1)] * x[1];
        }

        fn jacobian(&self, _t: f64, _x: &[f64]) -> Option<DMatrix<f64>> {
            Some(Self::matrix())
        }
    }

    impl VectorFieldModel for Linear {}

    /// Same field as [`Linear`] without a Jacobian.
    struct Opaque;

    impl DynamicalSystem for Opaque {
        fn dimension(&self) -> usize {
            2
        }

        fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
            Linear.apply(t, x, out);
        }
    }

    impl VectorFieldModel for Opaque {}

    /// `x'' = -(1 + z)^2 x` with `z' = rate`: an oscillator whose period shortens steadily.
    struct Chirp {
        rate: f64,
    }

    impl DynamicalSystem for Chirp {
        fn dimension(&self) -> usize {
            3
        }

        fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
            out[0] = x[1];
            out[1] = -(1.0 + x[2]).powi(2) * x[0];
            out[2] = self.rate;
        }
    }

    impl VectorFieldModel for Chirp {}

    fn forced_settings() -> EnvelopeSettings {
        EnvelopeSettings {
            rtol: 1e-4,
            atol: 1e-8,
            fun_rtol: 1e-9,
            fun_atol: 1e-12,
            period: Some(1.0),
            ..EnvelopeSettings::default()
        }
    }

    fn forced() -> Forced {
        Forced {
            lambda: 1e-3,
            amplitude: 1.0,
        }
    }

    fn assert_whole_periods(solution: &EnvelopeSolution, period: f64) {
        for (w, p) in solution.t.windows(2).zip(&solution.periods) {
            let periods = (w[1] - w[0]) / p;
            assert!(w[1] > w[0]);
            assert_relative_eq!(periods, periods.round(), epsilon = 1e-9);
            assert_relative_eq!(*p, period, max_relative = 1e-6);
        }
    }

    #[test]
    fn backward_euler_tracks_slow_decay() {
        let mut model = forced();
        let config = EnvelopeConfig::new(forced_settings()).expect("config");
        let solution = BeEnvelope::new(&mut model, BackwardEuler, config, (0.0, 2000.0), &[1.0])
            .expect("solver")
            .solve();

        assert!(solution.is_success(), "{:?}", solution.status);
        assert_whole_periods(&solution, 1.0);
        let t_end = solution.final_time().expect("samples");
        assert_relative_eq!(t_end, 2000.0, epsilon = 1e-9);
        assert!(solution.t.len() < 500);
        assert!(solution.stats.accepted > 0);
        assert!(solution.stats.fine.nfev > 0);

        let exact = model.exact(1.0, t_end.round());
        let y = solution.final_state().expect("samples")[0];
        assert!(((y - exact) / exact).abs() < 5e-2, "{y} vs {exact}");
    }

    #[test]
    fn trapezoidal_is_more_accurate_with_fewer_steps() {
        let config = EnvelopeConfig::new(forced_settings()).expect("config");

        let mut model = forced();
        let be = BeEnvelope::new(&mut model, BackwardEuler, config.clone(), (0.0, 2000.0), &[1.0])
            .expect("solver")
            .solve();
        let trap = TrapEnvelope::new(&mut model, Trapezoidal::new(), config, (0.0, 2000.0), &[1.0])
            .expect("solver")
            .solve();

        assert!(trap.is_success(), "{:?}", trap.status);
        assert_whole_periods(&trap, 1.0);
        assert!(trap.t.len() < be.t.len());

        let t_end = trap.final_time().expect("samples");
        let exact = model.exact(1.0, t_end.round());
        let y = trap.final_state().expect("samples")[0];
        assert!(((y - exact) / exact).abs() < 1e-2, "{y} vs {exact}");
    }

    #[test]
    fn estimated_period_follows_friction_decay() {
        let friction = 0.01;
        let mut model = Coulomb { friction, mode: 0 };
        let settings = EnvelopeSettings {
            rtol: 1e-4,
            atol: 1e-6,
            fun_rtol: 1e-10,
            fun_atol: 1e-12,
            period_guess: Some(6.0),
            max_step: 20,
            ..EnvelopeSettings::default()
        };
        let config = EnvelopeConfig::new(settings).expect("config");
        let y0 = [0.0, -10.0];
        let solution = BeEnvelope::new(&mut model, BackwardEuler, config, (0.0, 200.0 * PI), &y0)
            .expect("solver")
            .solve();

        assert!(solution.is_success(), "{:?}", solution.status);
        assert_whole_periods(&solution, 2.0 * PI);
        assert!(solution.t.len() < 50);

        // Each period shrinks the radius about (friction, 0) by four times the friction
        // without changing the phase.
        let radius0 = (friction.powi(2) + 100.0).sqrt();
        let t_end = solution.final_time().expect("samples");
        let periods = (t_end / (2.0 * PI)).round();
        let shrink = (radius0 - 4.0 * friction * periods) / radius0;
        let y = solution.final_state().expect("samples");
        assert_relative_eq!(y[0], friction + shrink * (y0[0] - friction), epsilon = 1e-4);
        assert_relative_eq!(y[1], shrink * y0[1], epsilon = 1e-4);
    }

    #[test]
    fn monodromy_product_matches_direct_variational_run() {
        let settings = EnvelopeSettings {
            period: Some(1.0),
            fun_rtol: 1e-10,
            fun_atol: 1e-12,
            variational: Some(VariationalSettings {
                period: Some(1.0),
                ..VariationalSettings::default()
            }),
            ..EnvelopeSettings::default()
        };
        let config = EnvelopeConfig::new(settings).expect("config");
        let solution =
            TrapEnvelope::new(&mut Linear, Trapezoidal::new(), config, (0.0, 20.0), &[1.0, 0.0])
                .expect("solver")
                .solve();

        assert!(solution.is_success(), "{:?}", solution.status);
        assert_eq!(solution.fundamental.len(), solution.t.len());
        assert_eq!(solution.monodromy.len(), solution.t.len() - 1);
        assert!(!solution.variational_samples.is_empty());
        assert_eq!(solution.variational_samples[0].fundamental, vec![1.0, 0.0, 0.0, 1.0]);

        let t_end = solution.final_time().expect("samples");
        let phi = solution.final_fundamental().expect("fundamental");

        let mut driver = SwitchedDriver::new();
        let augmented = VariationalSystem::<Linear>::augment(&[1.0, 0.0], &DMatrix::identity(2, 2));
        let reference = driver
            .integrate(
                &mut Linear,
                (0.0, t_end),
                &augmented,
                Tolerances::new(1e-10, 1e-12),
                &[],
                Propagation::Variational,
            )
            .expect("reference");
        let (_, expected) =
            VariationalSystem::<Linear>::split(reference.last_state().expect("samples"), 2);
        for i in 0..2 {
            for j in 0..2 {
                assert_relative_eq!(phi[(i, j)], expected[(i, j)], epsilon = 1e-7);
            }
        }

        // The product of the per-step monodromies is the final fundamental matrix.
        let product = solution
            .monodromy
            .iter()
            .map(|m| DMatrix::from_row_slice(2, 2, m))
            .fold(DMatrix::identity(2, 2), |acc, m| m * acc);
        for i in 0..2 {
            for j in 0..2 {
                assert_relative_eq!(product[(i, j)], phi[(i, j)], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn rejects_invalid_problems() {
        let variational = EnvelopeSettings {
            period: Some(1.0),
            variational: Some(VariationalSettings::default()),
            ..EnvelopeSettings::default()
        };
        let config = EnvelopeConfig::new(variational).expect("config");
        let err = BeEnvelope::new(&mut Opaque, BackwardEuler, config.clone(), (0.0, 1.0), &[1.0, 0.0])
            .err()
            .expect("missing jacobian");
        assert_eq!(err, EnvelopeError::Configuration(ConfigError::MissingJacobian));

        let err = BeEnvelope::new(&mut Linear, BackwardEuler, config.clone(), (0.0, 1.0), &[1.0])
            .err()
            .expect("dimension");
        assert_eq!(
            err,
            EnvelopeError::Configuration(ConfigError::DimensionMismatch {
                expected: 2,
                actual: 1
            })
        );

        let err = BeEnvelope::new(&mut Linear, BackwardEuler, config, (1.0, 1.0), &[1.0, 0.0])
            .err()
            .expect("span");
        assert!(matches!(
            err,
            EnvelopeError::Configuration(ConfigError::InvalidSpan { .. })
        ));

        let components = EnvelopeSettings {
            period_guess: Some(1.0),
            period_components: Some(vec![0, 2]),
            ..EnvelopeSettings::default()
        };
        let config = EnvelopeConfig::new(components).expect("config");
        let err = BeEnvelope::new(&mut Linear, BackwardEuler, config, (0.0, 1.0), &[1.0, 0.0])
            .err()
            .expect("component");
        assert_eq!(
            err,
            EnvelopeError::Configuration(ConfigError::ComponentOutOfRange {
                index: 2,
                dimension: 2
            })
        );
    }

    #[test]
    fn fine_integration_failure_is_reported_in_the_solution() {
        let settings = EnvelopeSettings {
            period: Some(2.0 * PI),
            ..EnvelopeSettings::default()
        };
        let config = EnvelopeConfig::new(settings).expect("config");
        let starved = Tsit5::with_settings(Tsit5Settings {
            max_steps: 3,
            ..Tsit5Settings::default()
        });
        let driver = SwitchedDriver::with_integrator(starved, DriverSettings::default());
        let solution = EnvelopeSolver::with_driver(
            &mut Linear,
            BackwardEuler,
            config,
            (0.0, 100.0),
            &[1.0, 0.0],
            driver,
        )
        .expect("solver")
        .solve();

        assert!(!solution.is_success());
        assert!(matches!(
            solution.status,
            EnvelopeStatus::Failed(EnvelopeError::Integration { .. })
        ));
        assert_eq!(solution.t, vec![0.0]);
        assert_eq!(solution.y, vec![vec![1.0, 0.0]]);
    }

    #[test]
    fn period_drift_halves_then_forces_single_period() {
        let rate = 1.5e-4;
        let mut model = Chirp { rate };
        let settings = EnvelopeSettings {
            atol: 1e-4,
            fun_rtol: 1e-10,
            fun_atol: 1e-12,
            period_guess: Some(2.0 * PI),
            period_components: Some(vec![0, 1]),
            max_step: 16,
            ..EnvelopeSettings::default()
        };
        let config = EnvelopeConfig::new(settings).expect("config");
        let y0 = [1.0, 0.0, 0.0];
        let solution = BeEnvelope::new(&mut model, BackwardEuler, config, (0.0, 150.0), &y0)
            .expect("solver")
            .solve();

        assert!(solution.is_success(), "{:?}", solution.status);
        // The period shrinks by about 6e-3 per period. Long steps drift too far and are halved
        // down to 2 periods, which still drift and fall back to a single period.
        assert!(solution.stats.period_rejections >= 2, "{:?}", solution.stats);
        assert!(solution.stats.one_period >= 1, "{:?}", solution.stats);

        for w in solution.periods.windows(2) {
            assert!((w[1] - w[0]).abs() <= 1e-2, "{} -> {}", w[0], w[1]);
        }
        for (period, y) in solution.periods.iter().zip(&solution.y) {
            assert_relative_eq!(*period, 2.0 * PI / (1.0 + y[2]), max_relative = 2e-3);
        }
        let t_end = solution.final_time().expect("samples");
        let y = solution.final_state().expect("samples");
        assert_relative_eq!(y[2], rate * t_end, epsilon = 1e-8);
    }

    #[test]
    fn exhausted_rejections_end_with_partial_trajectory() {
        let settings = EnvelopeSettings {
            newton: NewtonSettings {
                max_steps: 1,
                tolerance: f64::MIN_POSITIVE,
                ..NewtonSettings::default()
            },
            max_rejections: 1,
            ..forced_settings()
        };
        let config = EnvelopeConfig::new(settings).expect("config");
        let mut model = forced();
        let solution = BeEnvelope::new(&mut model, BackwardEuler, config, (0.0, 2000.0), &[1.0])
            .expect("solver")
            .solve();

        // The single period step needs no Newton solve. The next two multi-period steps cannot
        // converge and exceed the rejection budget.
        assert!(matches!(
            solution.status,
            EnvelopeStatus::Failed(EnvelopeError::StepTooSmall { rejections: 2, .. })
        ));
        assert_eq!(solution.t, vec![0.0, 1.0]);
        assert_eq!(solution.y.len(), 2);
        assert_relative_eq!(solution.y[1][0], model.exact(1.0, 1.0), epsilon = 1e-7);
        assert_eq!(solution.stats.accepted, 1);
        assert_eq!(solution.stats.newton_failures, 2);
    }

    #[test]
    fn step_count_grows_faster_for_backward_euler_as_tolerance_tightens() {
        let count = |rtol: f64, trapezoidal: bool| {
            let settings = EnvelopeSettings {
                rtol,
                ..forced_settings()
            };
            let config = EnvelopeConfig::new(settings).expect("config");
            let mut model = forced();
            let solution = if trapezoidal {
                TrapEnvelope::new(&mut model, Trapezoidal::new(), config, (0.0, 2000.0), &[1.0])
                    .expect("solver")
                    .solve()
            } else {
                BeEnvelope::new(&mut model, BackwardEuler, config, (0.0, 2000.0), &[1.0])
                    .expect("solver")
                    .solve()
            };
            assert!(solution.is_success(), "{:?}", solution.status);
            solution.t.len() as f64
        };

        // Two halvings of the tolerance: steps scale like tol^(-1/2) for BE, tol^(-1/3) for Trap.
        let be = count(2.5e-5, false) / count(1e-4, false);
        let trap = count(2.5e-5, true) / count(1e-4, true);
        assert!((1.7..2.4).contains(&be), "backward Euler ratio {be}");
        assert!((1.3..1.9).contains(&trap), "trapezoidal ratio {trap}");
        assert!(trap < be);
    }

    #[test]
    fn every_sample_tracks_the_exact_envelope() {
        let settings = forced_settings();
        let config = EnvelopeConfig::new(settings.clone()).expect("config");
        let mut model = forced();
        let be = BeEnvelope::new(&mut model, BackwardEuler, config.clone(), (0.0, 2000.0), &[1.0])
            .expect("solver")
            .solve();
        let trap = TrapEnvelope::new(&mut model, Trapezoidal::new(), config, (0.0, 2000.0), &[1.0])
            .expect("solver")
            .solve();

        // The global error at each sample stays within the local tolerances spent to reach it.
        for solution in [&be, &trap] {
            assert!(solution.is_success(), "{:?}", solution.status);
            let mut budget = 0.0;
            for (t, y) in solution.t.iter().zip(&solution.y).skip(1) {
                let exact = model.exact(1.0, *t);
                budget += settings.atol + settings.rtol * exact.abs();
                assert!(
                    (y[0] - exact).abs() <= 2.0 * budget,
                    "t = {t}: {} vs {exact}",
                    y[0]
                );
            }
        }
    }

    #[test]
    fn period_that_cannot_advance_time_is_reported() {
        let config = EnvelopeConfig::new(forced_settings()).expect("config");
        let mut model = forced();
        let solution = BeEnvelope::new(&mut model, BackwardEuler, config, (1e20, 2e20), &[1.0])
            .expect("solver")
            .solve();

        assert_eq!(
            solution.status,
            EnvelopeStatus::Failed(EnvelopeError::DegeneratePeriod {
                t: 1e20,
                period: 1.0
            })
        );
        assert_eq!(solution.t, vec![1e20]);
    }
}
