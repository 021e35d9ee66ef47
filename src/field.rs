use ndarray::{Array2, Zip};
use num_complex::Complex64;

use crate::error::{ensure_finite_input, invalid, Result};


/// Forward- and backward-travelling components of one slice.
///
/// Both grids always share one shape; every constructor and mutator
/// preserves that.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldPair {
    pub uf: Array2<Complex64>,
    pub ub: Array2<Complex64>,
}

impl FieldPair {
    pub fn new(uf: Array2<Complex64>, ub: Array2<Complex64>) -> Result<Self> {
        if uf.dim() != ub.dim() {
            return invalid(format!(
                "forward field {:?} and backward field {:?} differ in shape",
                uf.dim(),
                ub.dim()
            ));
        }
        let fields = Self { uf, ub };
        fields.check_finite()?;
        Ok(fields)
    }

    /// Fails with `InvalidArgument` if either component holds NaN or infinity.
    pub fn check_finite(&self) -> Result<()> {
        ensure_finite_input(self.uf.iter(), "forward field")?;
        ensure_finite_input(self.ub.iter(), "backward field")
    }

    pub fn zeros(shape: (usize, usize)) -> Self {
        Self {
            uf: Array2::zeros(shape),
            ub: Array2::zeros(shape),
        }
    }

    /// A purely forward-travelling field.
    pub fn forward(uf: Array2<Complex64>) -> Self {
        let ub = Array2::zeros(uf.dim());
        Self { uf, ub }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.uf.dim()
    }

    /// Multiplies both components by one slice factor.
    pub fn modulate(&mut self, factor: Complex64) {
        self.uf.mapv_inplace(|v| v * factor);
        self.ub.mapv_inplace(|v| v * factor);
    }

    /// Multiplies both components by per-cell slice factors.
    pub fn modulate_map(&mut self, factors: &Array2<Complex64>) -> Result<()> {
        if factors.dim() != self.shape() {
            return invalid(format!(
                "slice factors {:?} do not match field shape {:?}",
                factors.dim(),
                self.shape()
            ));
        }
        Zip::from(&mut self.uf)
            .and(&mut self.ub)
            .and(factors)
            .for_each(|f, b, &t| {
                *f *= t;
                *b *= t;
            });
        Ok(())
    }

    /// Sum of squared magnitudes over both components.
    pub fn energy(&self) -> f64 {
        energy(&self.uf) + energy(&self.ub)
    }

    /// Total field `uf + ub`.
    pub fn total(&self) -> Array2<Complex64> {
        &self.uf + &self.ub
    }
}

pub fn energy(field: &Array2<Complex64>) -> f64 {
    field.iter().map(|v| v.norm_sqr()).sum()
}
