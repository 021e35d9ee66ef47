//! Angular-spectrum diffraction of coupled forward/backward fields.
//!
//! One step transforms both fields into the spatial-frequency domain,
//! multiplies the forward spectrum by `exp(i·γ·z)` and the backward
//! spectrum by its complex conjugate, and transforms back. Here
//! `z = dz·res_z` is the physical step length.
//!
//! The propagator is unitary on the propagating subspace, so energy there is
//! conserved and a step by `−dz` undoes a step by `dz`. Components the gamma
//! field marks as blocked are removed; decaying components are attenuated
//! by `exp(−κ·|z|)` in both directions.

use std::sync::Arc;

use ndarray::{Array2, Zip};
use num_complex::Complex64;

use crate::config;
use crate::coupled::CoupledField;
use crate::error::{ensure_finite, invalid, Result};
use crate::fft::Fft2;
use crate::field::FieldPair;
use crate::gamma::GammaField;
use crate::grid::Grid;
use crate::pupil::PupilMask;


/// Free-space propagator bound to one gamma field and grid.
#[derive(Debug, Clone)]
pub struct Diffraction {
    gamma: Arc<GammaField>,
    fft: Fft2,
    res_z: f64,
}

/// `exp(i·Re γ·z − Im γ·|z|)`.
fn transfer(gamma: Complex64, z: f64) -> Complex64 {
    Complex64::from_polar((-gamma.im * z.abs()).exp(), gamma.re * z)
}

impl Diffraction {
    pub fn new(gamma: Arc<GammaField>, grid: &Grid) -> Result<Self> {
        if gamma.shape() != grid.shape {
            return invalid(format!(
                "gamma field {:?} does not match grid {:?}",
                gamma.shape(),
                grid.shape
            ));
        }
        Ok(Self {
            fft: Fft2::new(grid.shape),
            gamma,
            res_z: grid.res.z,
        })
    }

    pub fn gamma(&self) -> &GammaField {
        &self.gamma
    }

    pub fn fft(&self) -> &Fft2 {
        &self.fft
    }

    pub fn shape(&self) -> (usize, usize) {
        self.gamma.shape()
    }

    pub(crate) fn check_shape(&self, shape: (usize, usize)) -> Result<()> {
        if shape != self.shape() {
            return invalid(format!(
                "field shape {:?} does not match propagator shape {:?}",
                shape,
                self.shape()
            ));
        }
        Ok(())
    }

    fn distance(&self, dz: f64) -> Result<f64> {
        if !dz.is_finite() {
            return invalid(format!("step dz must be finite, got {dz}"));
        }
        Ok(dz * self.res_z)
    }

    /// Forward-direction multiplier for every frequency; the backward one is its conjugate.
    pub fn propagator(&self, dz: f64) -> Result<Array2<Complex64>> {
        let z = self.distance(dz)?;
        Ok(Array2::from_shape_fn(self.shape(), |(i, j)| {
            if self.gamma.is_blocked(i, j) {
                Complex64::new(0.0, 0.0)
            } else {
                transfer(self.gamma.values[[i, j]], z)
            }
        }))
    }

    pub fn step(&self, fields: &FieldPair, dz: f64) -> Result<FieldPair> {
        let mut next = fields.clone();
        self.step_in_place(&mut next, dz)?;
        Ok(next)
    }

    pub fn step_in_place(&self, fields: &mut FieldPair, dz: f64) -> Result<()> {
        self.check_shape(fields.shape())?;
        fields.check_finite()?;
        let propagator = self.propagator(dz)?;

        self.fft.forward(&mut fields.uf)?;
        self.fft.forward(&mut fields.ub)?;
        Zip::from(&mut fields.uf)
            .and(&mut fields.ub)
            .and(&propagator)
            .for_each(|f, b, &p| {
                *f *= p;
                *b *= p.conj();
            });
        self.fft.inverse(&mut fields.uf)?;
        self.fft.inverse(&mut fields.ub)?;

        ensure_finite(fields.uf.iter(), "forward field")?;
        ensure_finite(fields.ub.iter(), "backward field")
    }

    /// Removes every spectral component outside the pupil from both fields.
    pub fn band_limit(&self, fields: &mut FieldPair, pupil: &PupilMask) -> Result<()> {
        self.check_shape(fields.shape())?;
        fields.check_finite()?;
        if pupil.shape() != self.shape() {
            return invalid(format!(
                "pupil shape {:?} does not match propagator shape {:?}",
                pupil.shape(),
                self.shape()
            ));
        }
        for field in [&mut fields.uf, &mut fields.ub] {
            self.fft.forward(field)?;
            pupil.apply(field)?;
            self.fft.inverse(field)?;
        }
        Ok(())
    }

    /// Advances a field and its axial derivative by one step.
    ///
    /// Applies `[[cos γz, sin γz / γ], [−γ sin γz, cos γz]]` per frequency,
    /// which agrees with [`Diffraction::step`] after conversion. Decaying
    /// components are damped and blocked components removed, as in the
    /// directional step.
    pub fn step_coupled(&self, field: &mut CoupledField, dz: f64) -> Result<()> {
        self.check_shape(field.shape())?;
        field.check_finite()?;
        let z = self.distance(dz)?;

        self.fft.forward(&mut field.u)?;
        self.fft.forward(&mut field.ud)?;
        Zip::indexed(&mut field.u)
            .and(&mut field.ud)
            .for_each(|(i, j), u, ud| {
                let gamma = self.gamma.values[[i, j]];
                if self.gamma.is_blocked(i, j) {
                    *u = Complex64::new(0.0, 0.0);
                    *ud = Complex64::new(0.0, 0.0);
                } else if gamma.im > 0.0 {
                    let damping = (-gamma.im * z.abs()).exp();
                    *u *= damping;
                    *ud *= damping;
                } else {
                    let g = gamma.re;
                    let (s, c) = (g * z).sin_cos();
                    let sinc = if g.abs() < config::GAMMA_EPSILON { z } else { s / g };
                    let (u0, ud0) = (*u, *ud);
                    *u = u0 * c + ud0 * sinc;
                    *ud = ud0 * c - u0 * (g * s);
                }
            });
        self.fft.inverse(&mut field.u)?;
        self.fft.inverse(&mut field.ud)?;

        ensure_finite(field.u.iter(), "coupled field")?;
        ensure_finite(field.ud.iter(), "coupled derivative")
    }
}
