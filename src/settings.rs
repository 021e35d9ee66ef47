use anyhow::{ensure, Context, Result};
use config::{Config, Environment, File, FileFormat};
use itertools::iproduct;
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::gamma::EvanescentPolicy;
use crate::grid::{Cutoff, Grid, Medium};
use crate::scatter::ScatterParams;
use crate::tilt::{FallbackPolicy, IncidenceAngle, TiltParams};

/// Device the tilt amplitudes are generated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendChoice {
    /// Closed-form evaluation only.
    Reference,
    /// Kernel emulated on the CPU.
    #[default]
    Host,
    /// Kernel on a GPU through wgpu; needs the `gpu` feature.
    Gpu,
}

/// Incidence angles in degrees. Every polar angle is combined with every azimuth.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Illumination {
    pub polar_deg: Vec<f64>,
    #[serde(default = "default_azimuths")]
    pub azimuth_deg: Vec<f64>,
}

fn default_azimuths() -> Vec<f64> {
    vec![0.0]
}

/// Uniform slab marched for every illumination angle.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Sample {
    pub dn: f64,      // index perturbation of the slab
    pub slices: usize,
    #[serde(default = "default_dz")]
    pub dz: f64,      // slice thickness in units of res_z
}

fn default_dz() -> f64 {
    1.0
}

fn default_truncate() -> bool {
    true
}

/// Runtime configuration for the application.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Settings {
    pub shape: Vec<usize>,
    pub res: Vec<f64>,
    pub wavelength: f64,
    pub n0: f64,
    pub na: f64,
    #[serde(default = "default_truncate")]
    pub truncate: bool,
    #[serde(default)]
    pub evanescent: EvanescentPolicy,
    #[serde(default)]
    pub cutoff: Cutoff,
    pub illumination: Illumination,
    pub sample: Sample,
    #[serde(default)]
    pub backend: BackendChoice,
    #[serde(default)]
    pub fallback: FallbackPolicy,
}

impl Settings {
    pub fn grid(&self) -> Result<Grid> {
        Grid::from_slices(&self.shape, &self.res).context("invalid grid settings")
    }

    pub fn medium(&self) -> Result<Medium> {
        Medium::new(self.n0, self.wavelength).context("invalid medium settings")
    }

    pub fn tilt_params(&self) -> Result<TiltParams> {
        Ok(TiltParams {
            na: self.na,
            medium: self.medium()?,
            truncate: self.truncate,
            cutoff: self.cutoff,
        })
    }

    pub fn scatter_params(&self) -> Result<ScatterParams> {
        Ok(ScatterParams::new(&self.grid()?, self.sample.dz, &self.medium()?))
    }

    /// Every (polar, azimuth) combination, polar-major.
    pub fn angles(&self) -> Vec<IncidenceAngle> {
        iproduct!(
            self.illumination.polar_deg.iter(),
            self.illumination.azimuth_deg.iter()
        )
        .map(|(&polar, &azimuth)| IncidenceAngle::from_degrees(polar, azimuth))
        .collect()
    }
}

/// Loads `config/default.toml`, then `config/local.toml` if present, then
/// `SSNP__*` environment variables, from the project root.
pub fn load_config() -> Result<Settings> {
    let root = retrieve_project_root()?;
    load_config_from(&root)
}

pub fn load_config_from(root: &Path) -> Result<Settings> {
    let default_config_file = root.join("config/default.toml");
    let local_config = root.join("config/local.toml");

    let settings: Config = Config::builder()
        .add_source(File::from(default_config_file).required(true))
        .add_source(File::from(local_config).required(false))
        .add_source(Environment::with_prefix("ssnp").separator("__"))
        .build()
        .context("error loading configuration")?;

    let config: Settings = settings
        .try_deserialize()
        .context("error deserializing configuration")?;

    validate_config(&config)?;

    Ok(config)
}

/// Parses settings from TOML text, without files or environment.
pub fn parse_config(toml: &str) -> Result<Settings> {
    let settings: Config = Config::builder()
        .add_source(File::from_str(toml, FileFormat::Toml))
        .build()
        .context("error parsing configuration")?;
    let config: Settings = settings
        .try_deserialize()
        .context("error deserializing configuration")?;
    validate_config(&config)?;
    Ok(config)
}

fn retrieve_project_root() -> Result<PathBuf> {
    if let Ok(manifest_dir) = env::var("CARGO_MANIFEST_DIR") {
        // When running through cargo (e.g. cargo run, cargo test)
        return Ok(PathBuf::from(manifest_dir));
    }
    if let Ok(path) = env::var("SSNP_ROOT_DIR") {
        return Ok(PathBuf::from(path));
    }
    // Fallback: walk upward from the executable to the nearest directory
    // containing a "config" subdirectory
    let exe_path = env::current_exe().context("failed to get current executable path")?;
    let mut current_dir = exe_path.parent();
    while let Some(dir) = current_dir {
        if dir.join("config").is_dir() {
            return Ok(dir.to_path_buf());
        }
        current_dir = dir.parent();
    }
    anyhow::bail!("could not find project root directory, set SSNP_ROOT_DIR")
}

pub fn validate_config(config: &Settings) -> Result<()> {
    config.grid()?;
    config.medium()?;
    ensure!(
        config.na.is_finite() && config.na >= 0.0,
        "numerical aperture must be finite and non-negative, got {}",
        config.na
    );
    ensure!(
        !config.illumination.polar_deg.is_empty() && !config.illumination.azimuth_deg.is_empty(),
        "at least one polar and one azimuth angle are required"
    );
    ensure!(
        config
            .illumination
            .polar_deg
            .iter()
            .chain(config.illumination.azimuth_deg.iter())
            .all(|a| a.is_finite()),
        "illumination angles must be finite"
    );
    ensure!(config.sample.slices > 0, "sample must have at least one slice");
    ensure!(
        config.sample.dz.is_finite() && config.sample.dz > 0.0,
        "slice thickness dz must be greater than 0"
    );
    ensure!(config.sample.dn.is_finite(), "index perturbation must be finite");
    Ok(())
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Settings:
  - Shape: {:?}
  - Resolution: {:?}
  - Wavelength: {:.6}
  - Reference Index: {:.6}
  - Numerical Aperture: {:.4}
  - Truncate: {}
  - Evanescent: {:?}
  - Cutoff: {:?}
  - Angles: {} polar x {} azimuth
  - Sample: dn = {:.6}, {} slices of dz = {}
  - Backend: {:?} (fallback {:?})
  ",
            self.shape,
            self.res,
            self.wavelength,
            self.n0,
            self.na,
            self.truncate,
            self.evanescent,
            self.cutoff,
            self.illumination.polar_deg.len(),
            self.illumination.azimuth_deg.len(),
            self.sample.dn,
            self.sample.slices,
            self.sample.dz,
            self.backend,
            self.fallback,
        )
    }
}
