//! Ready-made models: a peak-current-controlled boost converter and a forced Van der Pol
//! oscillator.

use crate::events::{EventDescriptor, EventDirection};
use crate::traits::{saltation_matrix, DynamicalSystem, VectorFieldModel};
use anyhow::{bail, Result};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Electrical parameters of [`Boost`]. State is `[v_C, i_L]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoostParameters {
    /// Clock period.
    pub period: f64,
    /// Current sense gain.
    pub ki: f64,
    /// Peak current reference, in volts at the sense output.
    pub vref: f64,
    pub vin: f64,
    pub r: f64,
    pub l: f64,
    pub c: f64,
    /// Inductor series resistance.
    pub rs: f64,
    /// Phase of the clock, in radians.
    pub clock_phase: f64,
}

impl Default for BoostParameters {
    fn default() -> Self {
        Self {
            period: 20e-6,
            ki: 1.5,
            vref: 5.0,
            vin: 5.0,
            r: 5.0,
            l: 10e-6,
            c: 47e-6,
            rs: 0.0,
            clock_phase: 0.0,
        }
    }
}

/// Peak-current-mode boost converter.
///
/// Mode 0 has the switch closed (the inductor charges from the input), mode 1 has it open
/// (the inductor discharges into the output). The switch opens when the sensed current
/// reaches the reference and closes on every rising zero of the clock.
#[derive(Debug, Clone)]
pub struct Boost {
    params: BoostParameters,
    matrices: [DMatrix<f64>; 2],
    mode: usize,
}

const CURRENT_LIMIT: usize = 0;
const CLOCK: usize = 1;

impl Boost {
    pub fn new(params: BoostParameters, mode: usize) -> Result<Self> {
        if mode > 1 {
            bail!("Boost converter mode must be 0 or 1, got {}.", mode);
        }
        for (name, value) in [
            ("period", params.period),
            ("r", params.r),
            ("l", params.l),
            ("c", params.c),
        ] {
            if !(value.is_finite() && value > 0.0) {
                bail!("Boost parameter {} must be positive, got {}.", name, value);
            }
        }
        let BoostParameters { r, l, c, rs, .. } = params;
        let closed = DMatrix::from_row_slice(2, 2, &[-1.0 / (r * c), 0.0, 0.0, -rs / l]);
        let open = DMatrix::from_row_slice(2, 2, &[-1.0 / (r * c), 1.0 / c, -1.0 / l, -rs / l]);
        Ok(Self {
            params,
            matrices: [closed, open],
            mode,
        })
    }

    pub fn params(&self) -> &BoostParameters {
        &self.params
    }

    fn clock_argument(&self, t: f64) -> f64 {
        2.0 * PI * t / self.params.period - self.params.clock_phase
    }

    fn field(&self, mode: usize, x: &[f64]) -> [f64; 2] {
        let a = &self.matrices[mode];
        [
            a[(0, 0)] * x[0] + a[(0, 1)] * x[1],
            a[(1, 0)] * x[0] + a[(1, 1)] * x[1] + self.params.vin / self.params.l,
        ]
    }
}

impl DynamicalSystem for Boost {
    fn dimension(&self) -> usize {
        2
    }

    fn apply(&self, _t: f64, x: &[f64], out: &mut [f64]) {
        out.copy_from_slice(&self.field(self.mode, x));
    }

    fn jacobian(&self, _t: f64, _x: &[f64]) -> Option<DMatrix<f64>> {
        Some(self.matrices[self.mode].clone())
    }
}

impl VectorFieldModel for Boost {
    fn events(&self) -> Vec<EventDescriptor> {
        let BoostParameters {
            ki,
            vref,
            period,
            clock_phase,
            ..
        } = self.params;
        vec![
            EventDescriptor::new(
                move |_, x| ki * x[1] - vref,
                EventDirection::Rising,
                true,
            ),
            EventDescriptor::new(
                move |t, _| (2.0 * PI * t / period - clock_phase).sin(),
                EventDirection::Rising,
                true,
            ),
        ]
    }

    fn handle_event(&mut self, index: usize, t: f64, x: &[f64]) -> Option<DMatrix<f64>> {
        let before = self.field(self.mode, x);
        self.mode = match index {
            CURRENT_LIMIT => 1,
            CLOCK => 0,
            _ => return None,
        };
        let after = self.field(self.mode, x);
        let (gradient, time_derivative) = match index {
            CURRENT_LIMIT => ([0.0, self.params.ki], 0.0),
            _ => (
                [0.0, 0.0],
                2.0 * PI / self.params.period * self.clock_argument(t).cos(),
            ),
        };
        Some(saltation_matrix(&before, &after, &gradient, time_derivative))
    }

    fn mode(&self) -> usize {
        self.mode
    }

    fn set_mode(&mut self, mode: usize) {
        if mode < self.matrices.len() {
            self.mode = mode;
        }
    }
}

/// Van der Pol oscillator `x'' - epsilon (1 - x^2) x' + x = sum_k A_k cos(2 pi t / T_k)`.
#[derive(Debug, Clone, PartialEq)]
pub struct VanDerPol {
    epsilon: f64,
    /// `(amplitude, period)` of each forcing term.
    forcing: Vec<(f64, f64)>,
}

impl VanDerPol {
    pub fn new(epsilon: f64, forcing: Vec<(f64, f64)>) -> Self {
        Self { epsilon, forcing }
    }
}

impl DynamicalSystem for VanDerPol {
    fn dimension(&self) -> usize {
        2
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        let drive: f64 = self
            .forcing
            .iter()
            .map(|&(amplitude, period)| amplitude * (2.0 * PI * t / period).cos())
            .sum();
        out[0] = x[1];
        out[1] = self.epsilon * (1.0 - x[0] * x[0]) * x[1] - x[0] + drive;
    }

    fn jacobian(&self, _t: f64, x: &[f64]) -> Option<DMatrix<f64>> {
        Some(DMatrix::from_row_slice(
            2,
            2,
            &[
                0.0,
                1.0,
                -2.0 * self.epsilon * x[0] * x[1] - 1.0,
                self.epsilon * (1.0 - x[0] * x[0]),
            ],
        ))
    }
}

impl VectorFieldModel for VanDerPol {}
