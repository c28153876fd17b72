//! Floquet analysis of monodromy matrices produced by variational envelope runs.

use anyhow::{anyhow, bail, Result};
use nalgebra::linalg::SVD;
use nalgebra::DMatrix;
use num_complex::Complex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComplexNumber {
    pub re: f64,
    pub im: f64,
}

impl From<Complex<f64>> for ComplexNumber {
    fn from(value: Complex<f64>) -> Self {
        Self {
            re: value.re,
            im: value.im,
        }
    }
}

impl ComplexNumber {
    pub fn modulus(&self) -> f64 {
        self.re.hypot(self.im)
    }
}

/// Floquet multiplier with its unit-norm eigenvector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EigenPair {
    pub value: ComplexNumber,
    pub vector: Vec<ComplexNumber>,
}

/// Eigenvalues of a monodromy matrix, largest modulus first.
pub fn floquet_multipliers(monodromy: &DMatrix<f64>) -> Vec<Complex<f64>> {
    let mut multipliers: Vec<Complex<f64>> =
        monodromy.complex_eigenvalues().iter().copied().collect();
    multipliers.sort_by(|a, b| b.norm().total_cmp(&a.norm()));
    multipliers
}

/// Multipliers and eigenvectors of a row-major `dim x dim` monodromy matrix.
pub fn floquet_eigenpairs(dim: usize, monodromy: &[f64]) -> Result<Vec<EigenPair>> {
    if monodromy.len() != dim * dim {
        bail!(
            "Monodromy matrix has {} entries, expected {}.",
            monodromy.len(),
            dim * dim
        );
    }
    let matrix = DMatrix::from_row_slice(dim, dim, monodromy);
    let complex_matrix = matrix.map(|v| Complex::new(v, 0.0));

    let mut pairs = Vec::with_capacity(dim);
    for (idx, lambda) in floquet_multipliers(&matrix).into_iter().enumerate() {
        let mut shifted = complex_matrix.clone();
        for i in 0..dim {
            shifted[(i, i)] -= lambda;
        }

        let svd = SVD::new(shifted, false, true);
        let v_t = svd
            .v_t
            .ok_or_else(|| anyhow!("Failed to compute eigenvector for multiplier index {}", idx))?;
        // Null direction is the right singular vector of the smallest singular value.
        let row_index = svd
            .singular_values
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        let mut vector: Vec<Complex<f64>> = v_t.row(row_index).iter().map(|c| c.conj()).collect();
        normalize_complex_vector(&mut vector);

        pairs.push(EigenPair {
            value: ComplexNumber::from(lambda),
            vector: vector.into_iter().map(ComplexNumber::from).collect(),
        });
    }
    Ok(pairs)
}

fn normalize_complex_vector(vec: &mut [Complex<f64>]) {
    let norm = vec.iter().map(|c| c.norm_sqr()).sum::<f64>().sqrt();
    if norm > 0.0 {
        for entry in vec {
            *entry /= norm;
        }
    }
}
