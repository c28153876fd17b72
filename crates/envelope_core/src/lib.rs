//! The `envelope_core` crate simulates systems whose state oscillates quickly around a slowly
//! drifting envelope, such as switching power converters and forced oscillators.
//!
//! Key components:
//! - **Traits**: `DynamicalSystem` (vector fields), `VectorFieldModel` (mode-switching models), saltation matrices.
//! - **Solvers**: Adaptive Tsit5 with dense output and event location.
//! - **Switching**: A driver that integrates across mode changes and propagates the fundamental matrix.
//! - **Envelope**: Period estimation, BE/trapezoidal correctors solved by Newton-Krylov, and the macro-step controller.
//! - **Shooting**: Periodic steady states of the envelope, with Floquet multipliers from `analysis`.

pub mod analysis;
pub mod dense;
pub mod error;
pub mod events;
pub mod envelope;
pub mod shooting;
pub mod solvers;
pub mod switching;
pub mod systems;
pub mod traits;

pub use envelope::{
    BackwardEuler, BeEnvelope, EnvelopeConfig, EnvelopeInterp, EnvelopeSettings,
    EnvelopeSolution, EnvelopeSolver, TrapEnvelope, Trapezoidal,
};
pub use error::{ConfigError, EnvelopeError, IntegrationError};
pub use shooting::{EnvelopeShooting, ShootingResult, ShootingSettings};
pub use switching::{SwitchedDriver, SwitchedSolution};
pub use traits::{DynamicalSystem, VectorFieldModel};
