//! Slice-by-slice marching through an index volume.
//!
//! Each slice first applies its scattering factor to the field and then
//! diffracts by `dz`. The coupled variant does the same with a coupling
//! coefficient acting on the axial derivative.

use std::sync::Arc;

use ndarray::{Array3, Axis};
use num_complex::Complex64;
use tracing::debug;

use crate::coupled::CoupledField;
use crate::diffract::Diffraction;
use crate::error::{invalid, Result};
use crate::field::FieldPair;
use crate::pupil::PupilMask;


/// Drives a [`Diffraction`] through a stack of slices.
#[derive(Debug, Clone)]
pub struct SliceMarcher {
    diffraction: Diffraction,
    pupil: Option<Arc<PupilMask>>,
}

impl SliceMarcher {
    pub fn new(diffraction: Diffraction) -> Self {
        Self {
            diffraction,
            pupil: None,
        }
    }

    /// Band-limits the fields once the last slice has been crossed.
    pub fn with_pupil(mut self, pupil: Arc<PupilMask>) -> Self {
        self.pupil = Some(pupil);
        self
    }

    pub fn diffraction(&self) -> &Diffraction {
        &self.diffraction
    }

    fn finish(&self, mut fields: FieldPair) -> Result<FieldPair> {
        if let Some(pupil) = &self.pupil {
            self.diffraction.band_limit(&mut fields, pupil)?;
        }
        Ok(fields)
    }

    /// One uniform factor per slice.
    pub fn march(&self, mut fields: FieldPair, factors: &[Complex64], dz: f64) -> Result<FieldPair> {
        if factors.is_empty() {
            return invalid("no slices to march through");
        }
        for factor in factors {
            fields.modulate(*factor);
            self.diffraction.step_in_place(&mut fields, dz)?;
        }
        debug!(slices = factors.len(), dz, "march complete");
        self.finish(fields)
    }

    /// Per-voxel factors with shape `(depth, height, width)`.
    pub fn march_volume(&self, mut fields: FieldPair, factors: &Array3<Complex64>, dz: f64) -> Result<FieldPair> {
        if factors.is_empty() {
            return invalid("no slices to march through");
        }
        for slice in factors.axis_iter(Axis(0)) {
            fields.modulate_map(&slice.to_owned())?;
            self.diffraction.step_in_place(&mut fields, dz)?;
        }
        debug!(slices = factors.len_of(Axis(0)), dz, "volume march complete");
        self.finish(fields)
    }

    /// Coupled formulation, one coupling coefficient per slice.
    pub fn march_coupled(&self, mut field: CoupledField, couplings: &[f64], dz: f64) -> Result<CoupledField> {
        if couplings.is_empty() {
            return invalid("no slices to march through");
        }
        for &coupling in couplings {
            field.scatter(coupling);
            self.diffraction.step_coupled(&mut field, dz)?;
        }
        debug!(slices = couplings.len(), dz, "coupled march complete");
        Ok(field)
    }
}
