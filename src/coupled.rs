//! Field plus axial derivative, the state carried by the coupled formulation.
//!
//! **Context**: The directional pair (`uf`, `ub`) and the coupled pair
//! (`u`, `∂u/∂z`) describe the same slice. The coupled form lets the slice
//! interaction mix forward and backward light through a single real
//! coefficient per slice, see [`crate::scatter::ssnp_coupling`].
//!
//! **How it Works**: In the frequency domain `U = UF + UB` and
//! `UD = iγ·(UF − UB)`. The inverse divides by `iγ`; where `|γ|` falls
//! below [`config::GAMMA_EPSILON`] the derivative carries no directional
//! information and the field is split evenly.

use ndarray::{Array2, Zip};
use num_complex::Complex64;

use crate::config;
use crate::diffract::Diffraction;
use crate::error::{ensure_finite, ensure_finite_input, invalid, Result};
use crate::field::FieldPair;


#[derive(Debug, Clone, PartialEq)]
pub struct CoupledField {
    pub u: Array2<Complex64>,  // total field
    pub ud: Array2<Complex64>, // axial derivative per unit length
}

impl CoupledField {
    pub fn new(u: Array2<Complex64>, ud: Array2<Complex64>) -> Result<Self> {
        if u.dim() != ud.dim() {
            return invalid(format!(
                "field {:?} and derivative {:?} differ in shape",
                u.dim(),
                ud.dim()
            ));
        }
        let field = Self { u, ud };
        field.check_finite()?;
        Ok(field)
    }

    pub fn shape(&self) -> (usize, usize) {
        self.u.dim()
    }

    /// Fails with `InvalidArgument` if the field or derivative holds NaN or infinity.
    pub fn check_finite(&self) -> Result<()> {
        ensure_finite_input(self.u.iter(), "coupled field")?;
        ensure_finite_input(self.ud.iter(), "coupled derivative")
    }

    pub fn from_directional(fields: &FieldPair, diffraction: &Diffraction) -> Result<Self> {
        diffraction.check_shape(fields.shape())?;
        fields.check_finite()?;
        let gamma = &diffraction.gamma().values;
        let fft = diffraction.fft();

        let mut ud = &fields.uf - &fields.ub;
        fft.forward(&mut ud)?;
        Zip::from(&mut ud)
            .and(gamma)
            .for_each(|d, &g| *d *= Complex64::i() * g);
        fft.inverse(&mut ud)?;

        Ok(Self {
            u: fields.total(),
            ud,
        })
    }

    pub fn to_directional(&self, diffraction: &Diffraction) -> Result<FieldPair> {
        diffraction.check_shape(self.shape())?;
        self.check_finite()?;
        let gamma = &diffraction.gamma().values;
        let fft = diffraction.fft();

        let mut uf = self.u.clone();
        let mut ub = self.ud.clone();
        fft.forward(&mut uf)?;
        fft.forward(&mut ub)?;
        Zip::from(&mut uf)
            .and(&mut ub)
            .and(gamma)
            .for_each(|f, b, &g| {
                // (UF − UB) = UD / (iγ)
                let diff = if g.norm() < config::GAMMA_EPSILON {
                    Complex64::new(0.0, 0.0)
                } else {
                    -Complex64::i() * *b / g
                };
                let total = *f;
                *f = (total + diff) * 0.5;
                *b = (total - diff) * 0.5;
            });
        fft.inverse(&mut uf)?;
        fft.inverse(&mut ub)?;

        ensure_finite(uf.iter().chain(ub.iter()), "directional split")?;
        FieldPair::new(uf, ub)
    }

    /// Slice interaction `ud ← ud − c·u` with one coefficient for the slice.
    pub fn scatter(&mut self, coupling: f64) {
        Zip::from(&mut self.ud)
            .and(&self.u)
            .for_each(|d, &u| *d -= u * coupling);
    }

    /// Slice interaction with a per-cell coefficient map.
    pub fn scatter_map(&mut self, coupling: &Array2<f64>) -> Result<()> {
        if coupling.dim() != self.shape() {
            return invalid(format!(
                "coupling map {:?} does not match field shape {:?}",
                coupling.dim(),
                self.shape()
            ));
        }
        Zip::from(&mut self.ud)
            .and(&self.u)
            .and(coupling)
            .for_each(|d, &u, &c| *d -= u * c);
        Ok(())
    }
}
