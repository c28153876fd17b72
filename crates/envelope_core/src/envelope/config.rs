use super::newton_krylov::NewtonSettings;
use crate::error::ConfigError;
use crate::solvers::Tolerances;
use crate::switching::DriverSettings;
use serde::{Deserialize, Serialize};

/// How the period of the fast oscillation is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PeriodSpec {
    /// Known forcing period, used unchanged for the whole run.
    Fixed(f64),
    /// Autonomous oscillation; re-estimated at every envelope evaluation starting from `guess`.
    Estimated { guess: f64 },
}

impl PeriodSpec {
    /// Builds the spec from the two mutually exclusive options.
    pub fn from_options(period: Option<f64>, guess: Option<f64>) -> Result<Self, ConfigError> {
        let spec = match (period, guess) {
            (Some(period), None) => PeriodSpec::Fixed(period),
            (None, Some(guess)) => PeriodSpec::Estimated { guess },
            (None, None) => return Err(ConfigError::MissingPeriod),
            (Some(_), Some(_)) => return Err(ConfigError::AmbiguousPeriod),
        };
        let value = spec.value();
        if !(value.is_finite() && value > 0.0) {
            let name = match spec {
                PeriodSpec::Fixed(_) => "period",
                PeriodSpec::Estimated { .. } => "period_guess",
            };
            return Err(ConfigError::NonPositive { name, value });
        }
        Ok(spec)
    }

    /// The fixed period or the initial guess.
    pub fn value(&self) -> f64 {
        match *self {
            PeriodSpec::Fixed(period) => period,
            PeriodSpec::Estimated { guess } => guess,
        }
    }

    pub fn is_estimated(&self) -> bool {
        matches!(self, PeriodSpec::Estimated { .. })
    }
}

/// Optional propagation of the fundamental matrix alongside the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VariationalSettings {
    /// Tolerances of the local error test on the fundamental matrix.
    pub rtol: f64,
    pub atol: f64,
    /// Fixed variational period.
    pub period: Option<f64>,
    /// Initial guess of an estimated variational period. Mutually exclusive with `period`.
    pub period_guess: Option<f64>,
}

impl Default for VariationalSettings {
    fn default() -> Self {
        Self {
            rtol: 1e-2,
            atol: 1e-3,
            period: None,
            period_guess: None,
        }
    }
}

/// User-facing envelope settings. Validated into an [`EnvelopeConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeSettings {
    /// Envelope local error tolerances.
    pub rtol: f64,
    pub atol: f64,
    /// Tolerances of the fine integrations inside each envelope evaluation.
    pub fun_rtol: f64,
    pub fun_atol: f64,
    /// Maximum absolute change of an estimated period across one macro step.
    pub period_tolerance: f64,
    /// Maximum macro step, in periods.
    pub max_step: usize,
    pub period: Option<f64>,
    pub period_guess: Option<f64>,
    /// State components spanning the return plane of the period estimate. All components when `None`.
    pub period_components: Option<Vec<usize>>,
    pub variational: Option<VariationalSettings>,
    pub newton: NewtonSettings,
    pub driver: DriverSettings,
    /// Consecutive rejected macro steps tolerated before the run is abandoned.
    pub max_rejections: usize,
}

impl Default for EnvelopeSettings {
    fn default() -> Self {
        Self {
            rtol: 1e-3,
            atol: 1e-6,
            fun_rtol: 1e-6,
            fun_atol: 1e-8,
            period_tolerance: 1e-2,
            max_step: 1000,
            period: None,
            period_guess: None,
            period_components: None,
            variational: None,
            newton: NewtonSettings::default(),
            driver: DriverSettings::default(),
            max_rejections: 64,
        }
    }
}

/// Variational settings after validation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VariationalConfig {
    tolerances: Tolerances,
    cadence: Option<PeriodSpec>,
}

impl VariationalConfig {
    /// Tolerances of the local error test on the fundamental matrix.
    #[must_use]
    pub fn tolerances(&self) -> Tolerances {
        self.tolerances
    }

    /// Period of the variational error test, when one is configured.
    #[must_use]
    pub fn cadence(&self) -> Option<PeriodSpec> {
        self.cadence
    }
}

/// Validated envelope configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeConfig {
    tolerances: Tolerances,
    fun_tolerances: Tolerances,
    period_tolerance: f64,
    max_step: usize,
    period: PeriodSpec,
    period_components: Option<Vec<usize>>,
    variational: Option<VariationalConfig>,
    newton: NewtonSettings,
    driver: DriverSettings,
    max_rejections: usize,
}

fn positive(name: &'static str, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::NonPositive { name, value })
    }
}

fn non_negative(name: &'static str, value: f64) -> Result<f64, ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(value)
    } else {
        Err(ConfigError::Negative { name, value })
    }
}

impl EnvelopeConfig {
    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// Returns an error if a tolerance or period is not positive and finite, if neither or
    /// both of `period` and `period_guess` are given, or if a count is zero.
    pub fn new(settings: EnvelopeSettings) -> Result<Self, ConfigError> {
        let tolerances = Tolerances::new(
            positive("rtol", settings.rtol)?,
            positive("atol", settings.atol)?,
        );
        let fun_tolerances = Tolerances::new(
            positive("fun_rtol", settings.fun_rtol)?,
            positive("fun_atol", settings.fun_atol)?,
        );
        let period_tolerance = positive("period_tolerance", settings.period_tolerance)?;
        if settings.max_step == 0 {
            return Err(ConfigError::Zero { name: "max_step" });
        }
        if settings.max_rejections == 0 {
            return Err(ConfigError::Zero {
                name: "max_rejections",
            });
        }
        let period = PeriodSpec::from_options(settings.period, settings.period_guess)?;
        if let Some(components) = &settings.period_components {
            if components.is_empty() {
                return Err(ConfigError::EmptyComponents);
            }
        }

        let variational = match settings.variational {
            None => None,
            Some(v) => {
                let tolerances =
                    Tolerances::new(positive("var_rtol", v.rtol)?, positive("var_atol", v.atol)?);
                let cadence = match (v.period, v.period_guess) {
                    (None, None) => None,
                    (period, guess) => Some(PeriodSpec::from_options(period, guess)?),
                };
                Some(VariationalConfig {
                    tolerances,
                    cadence,
                })
            }
        };

        let newton = settings.newton;
        if newton.max_steps == 0 {
            return Err(ConfigError::Zero {
                name: "newton.max_steps",
            });
        }
        positive("newton.damping", newton.damping)?;
        positive("newton.tolerance", newton.tolerance)?;
        positive("driver.event_tolerance", settings.driver.event_tolerance)?;
        non_negative("driver.overshoot", settings.driver.overshoot)?;

        Ok(Self {
            tolerances,
            fun_tolerances,
            period_tolerance,
            max_step: settings.max_step,
            period,
            period_components: settings.period_components,
            variational,
            newton,
            driver: settings.driver,
            max_rejections: settings.max_rejections,
        })
    }

    /// Envelope local error tolerances.
    #[must_use]
    pub fn tolerances(&self) -> Tolerances {
        self.tolerances
    }

    /// Fine integration tolerances.
    #[must_use]
    pub fn fun_tolerances(&self) -> Tolerances {
        self.fun_tolerances
    }

    #[must_use]
    pub fn period_tolerance(&self) -> f64 {
        self.period_tolerance
    }

    /// Maximum macro step, in periods.
    #[must_use]
    pub fn max_step(&self) -> usize {
        self.max_step
    }

    #[must_use]
    pub fn period(&self) -> PeriodSpec {
        self.period
    }

    #[must_use]
    pub fn period_components(&self) -> Option<&[usize]> {
        self.period_components.as_deref()
    }

    #[must_use]
    pub fn variational(&self) -> Option<VariationalConfig> {
        self.variational
    }

    #[must_use]
    pub fn newton(&self) -> NewtonSettings {
        self.newton
    }

    #[must_use]
    pub fn driver(&self) -> DriverSettings {
        self.driver
    }

    #[must_use]
    pub fn max_rejections(&self) -> usize {
        self.max_rejections
    }
}
