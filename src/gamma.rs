//! Non-paraxial axial wavenumber for every transverse spatial frequency.
//!
//! The gamma field `kz(fx, fy) = sqrt(k² − kx² − ky²)` corrects free-space
//! diffraction for off-axis frequencies without the paraxial approximation.
//! Frequencies beyond the propagating limit are handled by an explicit
//! [`EvanescentPolicy`]; no cell is ever NaN.

use std::f64::consts::TAU;

use ndarray::{Array2, Zip};
use num_complex::Complex64;
use serde::Deserialize;

use crate::error::{ensure_finite, Result};
use crate::grid::{Cutoff, FrequencyGrid, Grid, Medium};


/// Treatment of frequencies beyond the propagating limit `kx² + ky² > k²`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvanescentPolicy {
    /// Gamma is set to zero and the diffraction step blocks the component.
    #[default]
    Clamp,
    /// Gamma is purely imaginary and the component decays with distance.
    Decay,
}

/// Axial wavenumber `kz` per transverse frequency, in radians per unit length.
///
/// **Context**: Each plane-wave component of a field advances along the axis
/// at its own rate. The gamma field carries those rates for a given grid and
/// medium, and is shared read-only by every slice and illumination angle.
///
/// **How it Works**: Evaluates `sqrt(k² − (2πfx)² − (2πfy)²)` where the
/// radicand is in the propagating set (decided by the [`Cutoff`]). Outside
/// it, the policy decides between zero and `i·sqrt(kx² + ky² − k²)`. The
/// radicand is clamped at zero on both branches, so the value reaches zero
/// continuously at the boundary.
#[derive(Debug, Clone, PartialEq)]
pub struct GammaField {
    pub values: Array2<Complex64>,
    pub propagating: Array2<bool>,
    pub k: f64,
    pub policy: EvanescentPolicy,
    pub cutoff: Cutoff,
}

impl GammaField {
    pub fn new(
        freq: &FrequencyGrid,
        medium: &Medium,
        policy: EvanescentPolicy,
        cutoff: Cutoff,
    ) -> Result<Self> {
        let k = medium.k();
        let k_sq = k * k;

        let radial_sq = freq.radial_sq().mapv(|f_sq| TAU * TAU * f_sq);
        let propagating = radial_sq.mapv(|rho_sq| cutoff.contains(rho_sq, k_sq));

        let mut values = Array2::<Complex64>::zeros(freq.shape);
        Zip::from(&mut values)
            .and(&radial_sq)
            .and(&propagating)
            .for_each(|value, &rho_sq, &inside| {
                *value = if inside {
                    Complex64::new((k_sq - rho_sq).max(0.0).sqrt(), 0.0)
                } else {
                    match policy {
                        EvanescentPolicy::Clamp => Complex64::new(0.0, 0.0),
                        EvanescentPolicy::Decay => {
                            Complex64::new(0.0, (rho_sq - k_sq).max(0.0).sqrt())
                        }
                    }
                };
            });

        ensure_finite(values.iter(), "gamma field")?;

        Ok(Self {
            values,
            propagating,
            k,
            policy,
            cutoff,
        })
    }

    /// Builds the frequency grid and the gamma field in one go.
    pub fn from_grid(
        grid: &Grid,
        medium: &Medium,
        policy: EvanescentPolicy,
        cutoff: Cutoff,
    ) -> Result<Self> {
        Self::new(&FrequencyGrid::new(grid), medium, policy, cutoff)
    }

    pub fn shape(&self) -> (usize, usize) {
        self.values.dim()
    }

    pub fn is_propagating(&self, i: usize, j: usize) -> bool {
        self.propagating[[i, j]]
    }

    /// Whether the diffraction step must drop the component at this cell.
    pub(crate) fn is_blocked(&self, i: usize, j: usize) -> bool {
        self.policy == EvanescentPolicy::Clamp && !self.propagating[[i, j]]
    }
}
