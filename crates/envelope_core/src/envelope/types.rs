//! Result types of an envelope integration.

use super::variational::VariationalSample;
use crate::error::EnvelopeError;
use crate::solvers::SolverStats;
use nalgebra::DMatrix;
use serde::Serialize;

/// What happened to one macro-step attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepOutcome {
    Accepted,
    /// The estimated period moved by more than the period tolerance.
    PeriodDrift,
    /// The local truncation error exceeded its scale.
    LocalError,
    /// Newton-Krylov did not converge on the implicit equation.
    NotConverged,
    /// The state was advanced by exactly one fine period.
    OnePeriod,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EnvelopeStats {
    pub accepted: usize,
    pub one_period: usize,
    pub period_rejections: usize,
    pub error_rejections: usize,
    pub newton_failures: usize,
    /// Envelope function evaluations, including those made by Newton-Krylov.
    pub evaluations: usize,
    /// Evaluations that fell back to the period guess.
    pub degenerate: usize,
    /// Work of every fine integration performed.
    pub fine: SolverStats,
}

impl EnvelopeStats {
    pub(crate) fn record(&mut self, outcome: StepOutcome) {
        match outcome {
            StepOutcome::Accepted => self.accepted += 1,
            StepOutcome::PeriodDrift => self.period_rejections += 1,
            StepOutcome::LocalError => self.error_rejections += 1,
            StepOutcome::NotConverged => self.newton_failures += 1,
            StepOutcome::OnePeriod => self.one_period += 1,
        }
    }

    pub fn rejected(&self) -> usize {
        self.period_rejections + self.error_rejections + self.newton_failures
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum EnvelopeStatus {
    #[default]
    Completed,
    /// The run stopped early; the solution holds every point accepted before the failure.
    Failed(EnvelopeError),
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvelopeSolution {
    pub t: Vec<f64>,
    pub y: Vec<Vec<f64>>,
    /// Period in force at each sample.
    pub periods: Vec<f64>,
    /// Fundamental matrix at each sample, row-major. Empty without variational propagation.
    pub fundamental: Vec<Vec<f64>>,
    /// Monodromy matrix of each macro step, row-major.
    pub monodromy: Vec<Vec<f64>>,
    pub variational_samples: Vec<VariationalSample>,
    pub stats: EnvelopeStats,
    #[serde(skip)]
    pub status: EnvelopeStatus,
}

impl EnvelopeSolution {
    pub fn is_success(&self) -> bool {
        matches!(self.status, EnvelopeStatus::Completed)
    }

    pub fn dimension(&self) -> usize {
        self.y.first().map_or(0, Vec::len)
    }

    pub fn final_time(&self) -> Option<f64> {
        self.t.last().copied()
    }

    pub fn final_state(&self) -> Option<&[f64]> {
        self.y.last().map(Vec::as_slice)
    }

    /// Fundamental matrix at the last sample.
    pub fn final_fundamental(&self) -> Option<DMatrix<f64>> {
        let n = self.dimension();
        self.fundamental
            .last()
            .map(|phi| DMatrix::from_row_slice(n, n, phi))
    }

    /// States as columns of a `dimension x samples` matrix.
    pub fn state_matrix(&self) -> DMatrix<f64> {
        let n = self.dimension();
        DMatrix::from_fn(n, self.y.len(), |i, j| self.y[j][i])
    }
}
