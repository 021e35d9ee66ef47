//! Binary pupil of a finite-NA optical system.

use ndarray::{Array2, Zip};
use num_complex::Complex64;

use crate::error::{invalid, Result};
use crate::grid::{Cutoff, FrequencyGrid, Grid, Medium};

#[cfg(test)]
mod tests {

    use super::*;

    fn freq() -> FrequencyGrid {
        FrequencyGrid::new(&Grid::new((16, 12), [0.1, 0.15, 0.1]).unwrap())
    }

    #[test]
    fn zero_na_inclusive_keeps_dc() {
        let pupil = PupilMask::new(&freq(), 0.0, &Medium::default(), Cutoff::Inclusive).unwrap();
        assert_eq!(pupil.count(), 1);
        assert!(pupil.mask[[0, 0]]);
    }

    #[test]
    fn zero_na_exclusive_is_empty() {
        let pupil = PupilMask::new(&freq(), 0.0, &Medium::default(), Cutoff::Exclusive).unwrap();
        assert_eq!(pupil.count(), 0);
    }

    #[test]
    fn large_na_is_full() {
        // nyquist radius here is below 7 cycles per unit length
        for cutoff in [Cutoff::Inclusive, Cutoff::Exclusive] {
            let pupil = PupilMask::new(&freq(), 50.0, &Medium::default(), cutoff).unwrap();
            assert_eq!(pupil.count(), 16 * 12);
        }
        let pupil =
            PupilMask::new(&freq(), f64::INFINITY, &Medium::default(), Cutoff::Exclusive).unwrap();
        assert_eq!(pupil.count(), 16 * 12);
    }

    #[test]
    fn boundary_depends_on_cutoff() {
        // fx axis step is 0.5; NA/λ = 1 lands exactly on a bin
        let freq = FrequencyGrid::new(&Grid::new((1, 8), [0.25, 0.25, 1.0]).unwrap());
        let inclusive = PupilMask::new(&freq, 1.0, &Medium::default(), Cutoff::Inclusive).unwrap();
        let exclusive = PupilMask::new(&freq, 1.0, &Medium::default(), Cutoff::Exclusive).unwrap();
        assert!(inclusive.mask[[0, 2]] && inclusive.mask[[0, 6]]);
        assert!(!exclusive.mask[[0, 2]] && !exclusive.mask[[0, 6]]);
        assert_eq!(inclusive.count(), 5);
        assert_eq!(exclusive.count(), 3);
    }

    #[test]
    fn symmetric_like_the_frequency_grid() {
        let grid = Grid::new((9, 11), [0.1, 0.1, 0.1]).unwrap();
        let pupil = PupilMask::from_grid(&grid, 0.65, &Medium::new(1.33, 0.5).unwrap(), Cutoff::Inclusive)
            .unwrap();
        let (h, w) = grid.shape;
        for i in 0..h {
            for j in 0..w {
                assert_eq!(pupil.mask[[i, j]], pupil.mask[[(h - i) % h, (w - j) % w]]);
            }
        }
    }

    #[test]
    fn apply_zeroes_outside() {
        let pupil = PupilMask::new(&freq(), 0.0, &Medium::default(), Cutoff::Inclusive).unwrap();
        let mut spectrum = Array2::from_elem((16, 12), Complex64::new(1.0, 1.0));
        pupil.apply(&mut spectrum).unwrap();
        assert_eq!(spectrum[[0, 0]], Complex64::new(1.0, 1.0));
        assert_eq!(spectrum.iter().filter(|v| v.norm() > 0.0).count(), 1);
        assert!(pupil.apply(&mut Array2::zeros((2, 2))).is_err());
    }

    #[test]
    fn rejects_negative_na() {
        assert!(PupilMask::new(&freq(), -0.1, &Medium::default(), Cutoff::Inclusive).is_err());
        assert!(PupilMask::new(&freq(), f64::NAN, &Medium::default(), Cutoff::Inclusive).is_err());
    }
}

/// True wherever `fx² + fy² ≤ (NA/λ)²` (strict under [`Cutoff::Exclusive`]).
#[derive(Debug, Clone, PartialEq)]
pub struct PupilMask {
    pub mask: Array2<bool>,
    pub na: f64,
    pub cutoff: Cutoff,
}

impl PupilMask {
    pub fn new(freq: &FrequencyGrid, na: f64, medium: &Medium, cutoff: Cutoff) -> Result<Self> {
        if !(na >= 0.0) {
            return invalid(format!("numerical aperture must be >= 0, got {na}"));
        }
        let limit = (na / medium.wavelength).powi(2);
        let mask = freq.radial_sq().mapv(|f_sq| cutoff.contains(f_sq, limit));
        Ok(Self { mask, na, cutoff })
    }

    pub fn from_grid(grid: &Grid, na: f64, medium: &Medium, cutoff: Cutoff) -> Result<Self> {
        Self::new(&FrequencyGrid::new(grid), na, medium, cutoff)
    }

    pub fn shape(&self) -> (usize, usize) {
        self.mask.dim()
    }

    /// Number of cells inside the pupil.
    pub fn count(&self) -> usize {
        self.mask.iter().filter(|&&inside| inside).count()
    }

    /// Zeroes every spectrum cell outside the pupil.
    pub fn apply(&self, spectrum: &mut Array2<Complex64>) -> Result<()> {
        if spectrum.dim() != self.shape() {
            return invalid(format!(
                "spectrum shape {:?} does not match pupil shape {:?}",
                spectrum.dim(),
                self.shape()
            ));
        }
        Zip::from(spectrum).and(&self.mask).for_each(|value, &inside| {
            if !inside {
                *value = Complex64::new(0.0, 0.0);
            }
        });
        Ok(())
    }
}
