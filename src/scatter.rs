//! Thin-slice scattering factors derived from the refractive-index perturbation.
//!
//! Under the thin-slice approximation a slice of thickness `t = dz·res_z`
//! with index perturbation `Δn = n − n0` multiplies the field by
//! `exp(i·k0·Δn·t)`, `k0 = 2π/λ`. An imaginary part of `Δn` models
//! absorption. The coupled (field, derivative) formulation uses the real
//! coefficient from [`ssnp_coupling`] instead.

use std::f64::consts::TAU;

use ndarray::Array3;
use num_complex::Complex64;

use crate::config;
use crate::error::{invalid, Result};
use crate::grid::{Grid, Medium};


/// Parameters of the slice discretisation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScatterParams {
    pub res_z: f64,      // axial sampling pitch
    pub dz: f64,         // slice thickness in units of res_z
    pub n0: f64,         // reference refractive index
    pub wavelength: f64, // vacuum wavelength
}

impl Default for ScatterParams {
    fn default() -> Self {
        Self {
            res_z: config::DEFAULT_RES[2],
            dz: 1.0,
            n0: 1.0,
            wavelength: 1.0,
        }
    }
}

impl ScatterParams {
    pub fn new(grid: &Grid, dz: f64, medium: &Medium) -> Self {
        Self {
            res_z: grid.res.z,
            dz,
            n0: medium.n0,
            wavelength: medium.wavelength,
        }
    }

    /// Physical thickness of one slice.
    pub fn thickness(&self) -> f64 {
        self.dz * self.res_z
    }

    /// Vacuum wavenumber.
    pub fn k0(&self) -> f64 {
        TAU / self.wavelength
    }

    fn validate(&self) -> Result<()> {
        if !(self.dz.is_finite() && self.dz > 0.0) {
            return invalid(format!("slice thickness dz must be positive, got {}", self.dz));
        }
        if !(self.res_z.is_finite() && self.res_z > 0.0) {
            return invalid(format!("res_z must be positive, got {}", self.res_z));
        }
        Medium::new(self.n0, self.wavelength).map(|_| ())
    }
}

fn check_sequence<T>(values: &[T], finite: impl Fn(&T) -> bool) -> Result<()> {
    if values.is_empty() {
        return invalid("index sequence is empty");
    }
    if !values.iter().all(finite) {
        return invalid("index sequence contains non-finite values");
    }
    Ok(())
}

/// Phase `k0·Δn·t` imparted by each slice, unwrapped.
pub fn phase(dn: &[f64], params: &ScatterParams) -> Result<Vec<f64>> {
    params.validate()?;
    check_sequence(dn, |d| d.is_finite())?;
    let scale = params.k0() * params.thickness();
    Ok(dn.iter().map(|d| scale * d).collect())
}

/// Complex factor `exp(i·k0·Δn·t)` for every slice.
pub fn scatter_factor(dn: &[f64], params: &ScatterParams) -> Result<Vec<Complex64>> {
    Ok(phase(dn, params)?
        .into_iter()
        .map(|phi| Complex64::from_polar(1.0, phi))
        .collect())
}

/// Like [`scatter_factor`] for a complex perturbation `Δn' + iΔn''`.
/// The imaginary part attenuates by `exp(−k0·Δn''·t)`.
pub fn scatter_factor_absorbing(dn: &[Complex64], params: &ScatterParams) -> Result<Vec<Complex64>> {
    params.validate()?;
    check_sequence(dn, |d| d.re.is_finite() && d.im.is_finite())?;
    let scale = Complex64::new(0.0, params.k0() * params.thickness());
    Ok(dn.iter().map(|d| (scale * d).exp()).collect())
}

/// Per-voxel factors for a `(depth, height, width)` perturbation volume.
pub fn scatter_volume(dn: &Array3<f64>, params: &ScatterParams) -> Result<Array3<Complex64>> {
    params.validate()?;
    if dn.is_empty() {
        return invalid(format!("index volume is empty, shape {:?}", dn.dim()));
    }
    if !dn.iter().all(|d| d.is_finite()) {
        return invalid("index volume contains non-finite values");
    }
    let scale = params.k0() * params.thickness();
    Ok(dn.mapv(|d| Complex64::from_polar(1.0, scale * d)))
}

/// Coupling coefficient `k0²·Δn·(2·n0 + Δn)·t` of the coupled formulation.
///
/// Applied once per slice as `ud ← ud − c·u`, where `ud` is the axial
/// derivative of the field per unit length.
pub fn ssnp_coupling(dn: &[f64], params: &ScatterParams) -> Result<Vec<f64>> {
    params.validate()?;
    check_sequence(dn, |d| d.is_finite())?;
    let scale = params.k0().powi(2) * params.thickness();
    Ok(dn
        .iter()
        .map(|d| scale * d * (2.0 * params.n0 + d))
        .collect())
}
