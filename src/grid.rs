//! Sampling grid, optical medium and transverse spatial-frequency coordinates.
//!
//! Every other component of the engine is parameterised by a [`Grid`] (the
//! transverse sampling of one slice plus the axial pitch) and a [`Medium`]
//! (reference index and vacuum wavelength). The [`FrequencyGrid`] derived
//! from a grid is the shared input of the gamma field, the pupil mask and the
//! tilt generator.
//!
//! # Conventions
//!
//! - Rows index `y` (height) and columns index `x` (width).
//! - Frequencies follow the discrete-Fourier ordering: zero, increasing
//!   positive frequencies, then negative frequencies wrapping at Nyquist.
//! - Lengths (resolution, wavelength) share one unit.

use std::f64::consts::PI;

use ndarray::{Array1, Array2};
use serde::Deserialize;

use crate::error::{invalid, Result};

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn fftfreq_even() {
        let f = fftfreq(4, 0.5);
        assert_eq!(f.to_vec(), vec![0.0, 0.5, -1.0, -0.5]);
    }

    #[test]
    fn fftfreq_odd() {
        let f = fftfreq(5, 1.0);
        assert_eq!(f.to_vec(), vec![0.0, 0.2, 0.4, -0.4, -0.2]);
    }

    #[test]
    fn dc_is_zero() {
        for shape in [(1, 1), (2, 3), (7, 4), (64, 64)] {
            let grid = Grid::new(shape, [0.1, 0.2, 1.0]).unwrap();
            let freq = FrequencyGrid::new(&grid);
            assert_eq!(freq.pair(0, 0), (0.0, 0.0));
        }
    }

    #[test]
    fn antisymmetric_under_negation() {
        let grid = Grid::new((6, 9), [0.1, 0.3, 1.0]).unwrap();
        let freq = FrequencyGrid::new(&grid);
        let (h, w) = grid.shape;
        for i in 0..h {
            for j in 0..w {
                let (ni, nj) = ((h - i) % h, (w - j) % w);
                let (fx, fy) = freq.pair(i, j);
                let (gx, gy) = freq.pair(ni, nj);
                // the even-length nyquist row maps onto itself
                if i != h / 2 {
                    assert!((fy + gy).abs() < 1e-12);
                }
                assert!((fx + gx).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn scaled_by_extent() {
        let grid = Grid::new((8, 10), [0.25, 0.5, 1.0]).unwrap();
        let freq = FrequencyGrid::new(&grid);
        assert!((freq.fx[1] - 1.0 / (10.0 * 0.25)).abs() < 1e-12);
        assert!((freq.fy[1] - 1.0 / (8.0 * 0.5)).abs() < 1e-12);
    }

    #[test]
    fn rejects_bad_grids() {
        assert!(Grid::new((0, 4), [0.1, 0.1, 0.1]).is_err());
        assert!(Grid::new((4, 4), [0.1, -0.1, 0.1]).is_err());
        assert!(Grid::new((4, 4), [0.1, 0.1, f64::NAN]).is_err());
        assert!(Grid::from_slices(&[4, 4, 4], &[0.1, 0.1, 0.1]).is_err());
        assert!(Grid::from_slices(&[4, 4], &[0.1, 0.1]).is_err());
        assert!(Grid::from_slices(&[4, 4], &[0.1, 0.1, 0.1]).is_ok());
    }

    #[test]
    fn cutoff_boundary() {
        assert!(Cutoff::Inclusive.contains(1.0, 1.0));
        assert!(!Cutoff::Exclusive.contains(1.0, 1.0));
        assert!(Cutoff::Exclusive.contains(0.5, 1.0));
    }
}

/// Physical sampling pitch per axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Resolution {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Resolution {
    pub fn new(x: f64, y: f64, z: f64) -> Result<Self> {
        for (axis, value) in [("x", x), ("y", y), ("z", z)] {
            if !(value.is_finite() && value > 0.0) {
                return invalid(format!("resolution {axis} must be positive, got {value}"));
            }
        }
        Ok(Self { x, y, z })
    }

    pub fn as_array(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

/// Transverse sampling of a slice together with the axial pitch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Grid {
    pub shape: (usize, usize), // (height, width)
    pub res: Resolution,
}

impl Grid {
    pub fn new(shape: (usize, usize), res: [f64; 3]) -> Result<Self> {
        if shape.0 == 0 || shape.1 == 0 {
            return invalid(format!("shape dimensions must be positive, got {shape:?}"));
        }
        let res = Resolution::new(res[0], res[1], res[2])?;
        Ok(Self { shape, res })
    }

    /// Builds a grid from untyped buffers, as received at the kernel boundary.
    pub fn from_slices(shape: &[usize], res: &[f64]) -> Result<Self> {
        if shape.len() != 2 {
            return invalid(format!("shape must be 2-dimensional, got {} dims", shape.len()));
        }
        if res.len() != 3 {
            return invalid(format!(
                "resolution must have 3 components, got {}",
                res.len()
            ));
        }
        Self::new((shape[0], shape[1]), [res[0], res[1], res[2]])
    }

    pub fn height(&self) -> usize {
        self.shape.0
    }

    pub fn width(&self) -> usize {
        self.shape.1
    }

    /// Number of cells in one slice.
    pub fn len(&self) -> usize {
        self.shape.0 * self.shape.1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the volume centre, `(height / 2, width / 2)`.
    pub fn centre(&self) -> (usize, usize) {
        (self.shape.0 / 2, self.shape.1 / 2)
    }
}

/// Reference medium and illumination wavelength.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Medium {
    pub n0: f64,         // reference refractive index
    pub wavelength: f64, // vacuum wavelength
}

impl Default for Medium {
    fn default() -> Self {
        Self {
            n0: 1.0,
            wavelength: 1.0,
        }
    }
}

impl Medium {
    pub fn new(n0: f64, wavelength: f64) -> Result<Self> {
        if !(n0.is_finite() && n0 > 0.0) {
            return invalid(format!("reference index must be positive, got {n0}"));
        }
        if !(wavelength.is_finite() && wavelength > 0.0) {
            return invalid(format!("wavelength must be positive, got {wavelength}"));
        }
        Ok(Self { n0, wavelength })
    }

    /// Vacuum wavenumber `2π/λ`.
    pub fn k0(&self) -> f64 {
        2.0 * PI / self.wavelength
    }

    /// Wavenumber in the reference medium `2π·n0/λ`.
    pub fn k(&self) -> f64 {
        self.k0() * self.n0
    }

    /// Wavelength inside the reference medium.
    pub fn medium_wavelength(&self) -> f64 {
        self.wavelength / self.n0
    }
}

/// Whether a value lying exactly on a cutoff belongs to the support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cutoff {
    #[default]
    Inclusive,
    Exclusive,
}

impl Cutoff {
    pub fn contains(&self, value: f64, limit: f64) -> bool {
        match self {
            Cutoff::Inclusive => value <= limit,
            Cutoff::Exclusive => value < limit,
        }
    }
}

/// Discrete-Fourier sample frequencies for `n` samples spaced `d` apart.
pub fn fftfreq(n: usize, d: f64) -> Array1<f64> {
    let scale = 1.0 / (n as f64 * d);
    let positive = (n + 1) / 2;
    Array1::from_iter((0..n).map(|k| {
        let k = if k < positive {
            k as f64
        } else {
            k as f64 - n as f64
        };
        k * scale
    }))
}

/// Transverse spatial frequencies of a grid, in cycles per unit length.
///
/// Stored as the two separable axes; `pair(i, j)` gives `(fx, fy)` for the
/// cell in row `i`, column `j`.
#[derive(Debug, Clone, PartialEq)]
pub struct FrequencyGrid {
    pub shape: (usize, usize),
    pub fx: Array1<f64>, // length = width
    pub fy: Array1<f64>, // length = height
}

impl FrequencyGrid {
    pub fn new(grid: &Grid) -> Self {
        Self {
            shape: grid.shape,
            fx: fftfreq(grid.width(), grid.res.x),
            fy: fftfreq(grid.height(), grid.res.y),
        }
    }

    pub fn pair(&self, i: usize, j: usize) -> (f64, f64) {
        (self.fx[j], self.fy[i])
    }

    /// Full grid of `(fx, fy)` pairs.
    pub fn pairs(&self) -> Array2<(f64, f64)> {
        Array2::from_shape_fn(self.shape, |(i, j)| self.pair(i, j))
    }

    /// `fx² + fy²` for every cell.
    pub fn radial_sq(&self) -> Array2<f64> {
        Array2::from_shape_fn(self.shape, |(i, j)| {
            self.fx[j] * self.fx[j] + self.fy[i] * self.fy[i]
        })
    }
}
