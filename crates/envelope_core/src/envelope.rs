//! Envelope following.
//!
//! The state sampled once per period of a fast oscillation evolves slowly. Treating those
//! samples as the solution of an ODE whose right-hand side is the one-period difference
//! quotient lets an implicit integrator skip many periods per step.
pub mod config;
pub mod corrector;
pub mod interp;
pub mod newton_krylov;
pub mod period;
pub mod solver;
pub mod types;
pub mod variational;

pub use config::{EnvelopeConfig, EnvelopeSettings, PeriodSpec, VariationalConfig, VariationalSettings};
pub use corrector::{BackwardEuler, CorrectionStep, Corrector, LocalError, Trapezoidal};
pub use interp::EnvelopeInterp;
pub use newton_krylov::{newton_krylov, NewtonOutcome, NewtonSettings};
pub use period::{EnvelopeEval, PeriodEstimator};
pub use solver::{BeEnvelope, EnvelopeSolver, TrapEnvelope};
pub use types::{EnvelopeSolution, EnvelopeStats, EnvelopeStatus, StepOutcome};
pub use variational::VariationalSample;
