//! Split-step non-paraxial forward model.
//!
//! Propagates coupled forward/backward optical fields through a stack of
//! refractive-index slices: thin-slice scattering factors alternate with
//! angular-spectrum diffraction steps corrected by the non-paraxial
//! wavenumber field, under oblique plane-wave illumination.

pub mod backend;
pub mod cache;
pub mod config;
pub mod coupled;
pub mod diffract;
pub mod error;
pub mod fft;
pub mod field;
pub mod gamma;
#[cfg(feature = "gpu")]
pub mod gpu;
pub mod grid;
pub mod host;
pub mod march;
pub mod pupil;
pub mod scan;
pub mod scatter;
pub mod settings;
pub mod tilt;

pub use error::{Result, SsnpError};
