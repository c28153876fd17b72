use crate::events::EventDescriptor;
use nalgebra::DMatrix;

/// Represents a continuous-time dynamical system `dy/dt = f(t, y)`.
pub trait DynamicalSystem {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// t: current time
    /// x: current state
    /// out: buffer to write dx/dt
    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]);

    /// Jacobian of the vector field with respect to the state, if the system provides one.
    fn jacobian(&self, _t: f64, _x: &[f64]) -> Option<DMatrix<f64>> {
        None
    }
}

/// A vector field whose right-hand side is selected by a discrete mode.
///
/// The mode is switched by the model's own events. The driver integrates with the
/// active mode until the earliest registered event, then hands control back through
/// [`VectorFieldModel::handle_event`] so the model can change mode before integration resumes.
/// Smooth systems keep the default implementations and never switch.
pub trait VectorFieldModel: DynamicalSystem {
    /// Switching events, in registration order. Indices passed to
    /// [`VectorFieldModel::handle_event`] refer to this list.
    fn events(&self) -> Vec<EventDescriptor> {
        Vec::new()
    }

    /// Applies the mode transition triggered by event `index` at `(t, x)`.
    ///
    /// Returns the saltation matrix of the transition when the model can provide it.
    /// `None` is treated as the identity.
    fn handle_event(&mut self, _index: usize, _t: f64, _x: &[f64]) -> Option<DMatrix<f64>> {
        None
    }

    /// Index of the active mode.
    fn mode(&self) -> usize {
        0
    }

    /// Forces the active mode. Envelope evaluations start every fine integration from the
    /// mode the model had at the initial time, since envelope points share its phase.
    fn set_mode(&mut self, _mode: usize) {}
}

/// Saltation matrix `S = I + (f+ - f-) n^T / (n^T f- + dh/dt)` of a switching surface `h(t, x) = 0`.
///
/// `gradient` is the state gradient `n` of `h`, `time_derivative` its explicit time derivative.
/// A grazing crossing (vanishing denominator) has no defined saltation; the identity is returned.
pub fn saltation_matrix(
    f_before: &[f64],
    f_after: &[f64],
    gradient: &[f64],
    time_derivative: f64,
) -> DMatrix<f64> {
    let n = f_before.len();
    let mut saltation = DMatrix::identity(n, n);
    let denominator: f64 = gradient
        .iter()
        .zip(f_before)
        .map(|(g, f)| g * f)
        .sum::<f64>()
        + time_derivative;
    if denominator == 0.0 || !denominator.is_finite() {
        return saltation;
    }
    for i in 0..n {
        let jump = (f_after[i] - f_before[i]) / denominator;
        for j in 0..n {
            saltation[(i, j)] += jump * gradient[j];
        }
    }
    saltation
}

/// Augments a system with its variational equation `Phi' = J(t, y) Phi`.
///
/// The state layout is `[y, vec(Phi)]` with `Phi` flattened row-major, so the augmented
/// dimension is `n + n * n`. The inner system must provide a Jacobian; when it does not,
/// the `Phi` block is frozen.
pub struct VariationalSystem<'a, S: ?Sized> {
    inner: &'a S,
    dimension: usize,
}

impl<'a, S: DynamicalSystem + ?Sized> VariationalSystem<'a, S> {
    pub fn new(inner: &'a S) -> Self {
        Self {
            dimension: inner.dimension(),
            inner,
        }
    }

    /// Builds the augmented initial condition `[y, vec(Phi)]`.
    pub fn augment(state: &[f64], fundamental: &DMatrix<f64>) -> Vec<f64> {
        let n = state.len();
        let mut augmented = Vec::with_capacity(n + n * n);
        augmented.extend_from_slice(state);
        for i in 0..n {
            for j in 0..n {
                augmented.push(fundamental[(i, j)]);
            }
        }
        augmented
    }

    /// Splits an augmented state back into `y` and `Phi`.
    pub fn split(augmented: &[f64], n: usize) -> (Vec<f64>, DMatrix<f64>) {
        let state = augmented[..n].to_vec();
        let fundamental = DMatrix::from_row_slice(n, n, &augmented[n..n + n * n]);
        (state, fundamental)
    }
}

impl<S: DynamicalSystem + ?Sized> DynamicalSystem for VariationalSystem<'_, S> {
    fn dimension(&self) -> usize {
        let n = self.dimension;
        n + n * n
    }

    fn apply(&self, t: f64, x: &[f64], out: &mut [f64]) {
        let n = self.dimension;
        self.inner.apply(t, &x[..n], &mut out[..n]);

        let Some(jacobian) = self.inner.jacobian(t, &x[..n]) else {
            out[n..].iter_mut().for_each(|v| *v = 0.0);
            return;
        };

        // out[n..] = J * Phi, both row-major
        let phi = &x[n..];
        for i in 0..n {
            for k in 0..n {
                let mut sum = 0.0;
                for j in 0..n {
                    sum += jacobian[(i, j)] * phi[j * n + k];
                }
                out[n + i * n + k] = sum;
            }
        }
    }
}
