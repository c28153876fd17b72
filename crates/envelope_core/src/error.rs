use thiserror::Error;

/// Invalid input handed to the fine integrator or the switching driver.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntegrationError {
    #[error("State dimension mismatch. Expected {expected}, got {actual}.")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Integration interval [{t0}, {t1}] must be finite and increasing.")]
    InvalidSpan { t0: f64, t1: f64 },

    #[error("Tolerances must be positive and finite (rtol = {rtol}, atol = {atol}).")]
    InvalidTolerances { rtol: f64, atol: f64 },

    #[error("Dense output is not defined at t = {t}.")]
    OutsideDenseOutput { t: f64 },
}

/// Rejected envelope configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("Either a fixed period or a period guess must be provided.")]
    MissingPeriod,

    #[error("A fixed period and a period guess cannot both be provided.")]
    AmbiguousPeriod,

    #[error("{name} must be positive and finite, got {value}.")]
    NonPositive { name: &'static str, value: f64 },

    #[error("{name} must be non-negative and finite, got {value}.")]
    Negative { name: &'static str, value: f64 },

    #[error("{name} must be greater than zero.")]
    Zero { name: &'static str },

    #[error("Period component {index} is out of range for dimension {dimension}.")]
    ComponentOutOfRange { index: usize, dimension: usize },

    #[error("Period components cannot be empty.")]
    EmptyComponents,

    #[error("Initial state dimension mismatch. Expected {expected}, got {actual}.")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Time span [{t0}, {t1}] must be finite and increasing.")]
    InvalidSpan { t0: f64, t1: f64 },

    #[error("Variational integration requires the model to provide a Jacobian.")]
    MissingJacobian,
}

/// Fatal failure of an envelope run.
///
/// Recoverable conditions (period drift, local error, Newton non-convergence) are
/// handled by the step controller and never surface here.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EnvelopeError {
    #[error("Invalid envelope configuration: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Step size cannot be reduced further at t = {t:e} (period {period:e}, {rejections} consecutive rejections).")]
    StepTooSmall {
        t: f64,
        period: f64,
        rejections: usize,
    },

    #[error("Period {period:e} at t = {t:e} does not advance time.")]
    DegeneratePeriod { t: f64, period: f64 },

    #[error("Fine integration failed at t = {t:e}: {message}")]
    Integration { t: f64, message: String },

    #[error(transparent)]
    Input(#[from] IntegrationError),
}
