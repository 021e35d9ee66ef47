//! Two-dimensional FFT over a slice, planned once per shape.

use std::sync::Arc;

use ndarray::Array2;
use num_complex::Complex64;
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};

use crate::error::{invalid, Result};

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn impulse_has_flat_spectrum() {
        let fft = Fft2::new((4, 6));
        let mut data = Array2::<Complex64>::zeros((4, 6));
        data[[0, 0]] = Complex64::new(1.0, 0.0);
        fft.forward(&mut data).unwrap();
        assert!(data.iter().all(|v| (v - Complex64::new(1.0, 0.0)).norm() < 1e-12));
    }

    #[test]
    fn inverse_restores_input() {
        let fft = Fft2::new((5, 8));
        let original = Array2::from_shape_fn((5, 8), |(i, j)| {
            Complex64::new((i * 3 + j) as f64, (i as f64 - j as f64) * 0.5)
        });
        let mut data = original.clone();
        fft.forward(&mut data).unwrap();
        fft.inverse(&mut data).unwrap();
        for (a, b) in data.iter().zip(original.iter()) {
            assert!((a - b).norm() < 1e-10);
        }
    }

    #[test]
    fn plane_wave_lands_in_one_bin() {
        let (h, w) = (8, 8);
        let fft = Fft2::new((h, w));
        let mut data = Array2::from_shape_fn((h, w), |(i, j)| {
            let phase = std::f64::consts::TAU * (2.0 * j as f64 / w as f64 + i as f64 / h as f64);
            Complex64::from_polar(1.0, phase)
        });
        fft.forward(&mut data).unwrap();
        assert!((data[[1, 2]].norm() - (h * w) as f64).abs() < 1e-9);
        assert!(data[[0, 0]].norm() < 1e-9);
    }

    #[test]
    fn rejects_shape_mismatch() {
        let fft = Fft2::new((4, 4));
        let mut data = Array2::<Complex64>::zeros((4, 5));
        assert!(fft.forward(&mut data).is_err());
    }
}

/// Planned forward and inverse transforms for one `(height, width)` shape.
///
/// Rows are transformed first, then columns. The inverse is normalised by
/// `1 / (height·width)` so that `inverse(forward(x)) == x`.
#[derive(Clone)]
pub struct Fft2 {
    shape: (usize, usize),
    row_forward: Arc<dyn Fft<f64>>,
    row_inverse: Arc<dyn Fft<f64>>,
    col_forward: Arc<dyn Fft<f64>>,
    col_inverse: Arc<dyn Fft<f64>>,
}

impl std::fmt::Debug for Fft2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fft2").field("shape", &self.shape).finish()
    }
}

impl Fft2 {
    pub fn new(shape: (usize, usize)) -> Self {
        let mut planner = FftPlanner::new();
        Self {
            shape,
            row_forward: planner.plan_fft_forward(shape.1),
            row_inverse: planner.plan_fft_inverse(shape.1),
            col_forward: planner.plan_fft_forward(shape.0),
            col_inverse: planner.plan_fft_inverse(shape.0),
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn forward(&self, data: &mut Array2<Complex64>) -> Result<()> {
        self.transform(data, &self.row_forward, &self.col_forward)
    }

    pub fn inverse(&self, data: &mut Array2<Complex64>) -> Result<()> {
        self.transform(data, &self.row_inverse, &self.col_inverse)?;
        let norm = 1.0 / (self.shape.0 * self.shape.1) as f64;
        data.mapv_inplace(|v| v * norm);
        Ok(())
    }

    fn transform(
        &self,
        data: &mut Array2<Complex64>,
        rows: &Arc<dyn Fft<f64>>,
        cols: &Arc<dyn Fft<f64>>,
    ) -> Result<()> {
        if data.dim() != self.shape {
            return invalid(format!(
                "field shape {:?} does not match planned shape {:?}",
                data.dim(),
                self.shape
            ));
        }
        let (h, w) = self.shape;

        // logical (row-major) order regardless of memory layout
        let mut buffer: Vec<Complex64> = data.iter().copied().collect();
        buffer
            .par_chunks_exact_mut(w)
            .for_each(|row| rows.process(row));

        let mut transposed = vec![Complex64::new(0.0, 0.0); h * w];
        for i in 0..h {
            for j in 0..w {
                transposed[j * h + i] = buffer[i * w + j];
            }
        }
        transposed
            .par_chunks_exact_mut(h)
            .for_each(|col| cols.process(col));

        *data = Array2::from_shape_fn(self.shape, |(i, j)| transposed[j * h + i]);
        Ok(())
    }
}
