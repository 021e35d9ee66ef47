//! Multi-angle forward simulation of a uniform slab.
//!
//! **Context**: A tomographic acquisition records the same sample under many
//! illumination angles. Each angle is independent once the frequency-domain
//! grids are built, so the angles are marched in parallel.
//!
//! **How it Works**: Tilt amplitudes for all angles are generated in one
//! batch, the shared gamma field and pupil come from a [`GridCache`], and
//! every non-null angle is seeded, marched through the slab and band-limited
//! by the pupil. The transmitted fraction of the incident energy is recorded
//! per angle.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use num_complex::Complex64;
use rayon::prelude::*;
use tracing::{info, warn};

use crate::backend::ComputeBackend;
use crate::cache::GridCache;
use crate::diffract::Diffraction;
use crate::field::energy;
use crate::grid::Grid;
use crate::host::HostBackend;
use crate::march::SliceMarcher;
use crate::scatter::scatter_factor;
use crate::settings::{BackendChoice, Settings};
use crate::tilt::{select_generator, tilt_waves, IncidenceAngle, TiltGenerator, TiltWave};

#[cfg(test)]
mod tests {

    use super::*;
    use crate::settings::parse_config;

    const SMALL: &str = r#"
        shape = [32, 32]
        res = [0.1, 0.1, 0.5]
        wavelength = 0.5
        n0 = 1.33
        na = 0.9
        backend = "host"

        [illumination]
        polar_deg = [0.0, 12.0, 70.0]
        azimuth_deg = [30.0]

        [sample]
        dn = 0.01
        slices = 4
    "#;

    #[test]
    fn lossless_slab_transmits_everything() {
        let settings = parse_config(SMALL).unwrap();
        let scan = AngleScan::new(settings, None).unwrap();
        let results = scan.solve().unwrap();
        assert_eq!(results.len(), 3);
        for result in &results[..2] {
            assert!(!result.null);
            assert!((result.transmitted - 1.0).abs() < 1e-9);
        }
        // 70° lies outside NA 0.9
        assert!(results[2].null);
        assert_eq!(results[2].transmitted, 0.0);
    }

    #[test]
    fn exclusive_cutoff_nulls_angle_on_na_circle() {
        // sin(15.07°)·64·0.125 = 2.08 snaps to bin 2, where ca = 0.25 = na
        let text = |cutoff: &str| {
            format!(
                r#"
                shape = [64, 64]
                res = [0.125, 0.125, 0.125]
                wavelength = 1.0
                n0 = 1.0
                na = 0.25
                cutoff = "{cutoff}"

                [illumination]
                polar_deg = [15.07]

                [sample]
                dn = 0.0
                slices = 1
                "#
            )
        };
        let exclusive = AngleScan::new(parse_config(&text("exclusive")).unwrap(), None)
            .unwrap()
            .solve()
            .unwrap();
        assert!(exclusive[0].null);

        let inclusive = AngleScan::new(parse_config(&text("inclusive")).unwrap(), None)
            .unwrap()
            .solve()
            .unwrap();
        assert!(!inclusive[0].null);
        assert!((inclusive[0].transmitted - 1.0).abs() < 1e-9);
    }

    #[test]
    fn backends_agree() {
        let settings = parse_config(SMALL).unwrap();
        let reference = AngleScan::new(settings.clone(), None).unwrap().solve().unwrap();
        let host: Arc<dyn ComputeBackend> = Arc::new(HostBackend::new());
        let accelerated = AngleScan::new(settings, Some(host)).unwrap().solve().unwrap();
        for (r, a) in reference.iter().zip(accelerated.iter()) {
            assert_eq!(r.null, a.null);
            assert!((r.centre - a.centre).norm() < 1e-4);
        }
    }
}

/// Outcome of marching one illumination angle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AngleResult {
    pub angle: IncidenceAngle,
    pub null: bool,
    pub transmitted: f64, // output over input energy of the forward field
    pub centre: Complex64, // forward field at the volume centre
}

/// Builds the backend selected in the settings.
pub fn build_backend(choice: BackendChoice) -> Option<Arc<dyn ComputeBackend>> {
    match choice {
        BackendChoice::Reference => None,
        BackendChoice::Host => Some(Arc::new(HostBackend::new())),
        BackendChoice::Gpu => gpu_backend(),
    }
}

#[cfg(feature = "gpu")]
fn gpu_backend() -> Option<Arc<dyn ComputeBackend>> {
    match crate::gpu::WgpuBackend::new_blocking() {
        Ok(backend) => Some(Arc::new(backend)),
        Err(err) => {
            warn!(%err, "GPU backend unavailable, using host emulation");
            Some(Arc::new(HostBackend::new()))
        }
    }
}

#[cfg(not(feature = "gpu"))]
fn gpu_backend() -> Option<Arc<dyn ComputeBackend>> {
    warn!("built without the gpu feature, using host emulation");
    Some(Arc::new(HostBackend::new()))
}

/// All angles of one acquisition, sharing grids through a cache.
pub struct AngleScan {
    pub settings: Settings,
    grid: Grid,
    cache: GridCache,
    generator: Box<dyn TiltGenerator>,
}

impl AngleScan {
    pub fn new(settings: Settings, backend: Option<Arc<dyn ComputeBackend>>) -> Result<Self> {
        let grid = settings.grid()?;
        let generator = select_generator(backend, settings.fallback);
        Ok(Self {
            settings,
            grid,
            cache: GridCache::new(),
            generator,
        })
    }

    pub fn cache(&self) -> &GridCache {
        &self.cache
    }

    pub fn waves(&self) -> Result<Vec<TiltWave>> {
        let angles = self.settings.angles();
        tilt_waves(
            self.generator.as_ref(),
            &self.grid,
            &angles,
            &self.settings.tilt_params()?,
        )
        .context("failed to generate tilt amplitudes")
    }

    /// Marches every angle in parallel.
    pub fn solve(&self) -> Result<Vec<AngleResult>> {
        let start = Instant::now();
        let medium = self.settings.medium()?;
        info!(
            angles = self.settings.angles().len(),
            generator = self.generator.name(),
            "solving"
        );

        let waves = self.waves()?;
        let gamma = self
            .cache
            .gamma(&self.grid, &medium, self.settings.evanescent, self.settings.cutoff)?;
        let pupil = self
            .cache
            .pupil(&self.grid, self.settings.na, &medium, self.settings.cutoff)?;
        let marcher = SliceMarcher::new(Diffraction::new(gamma, &self.grid)?).with_pupil(pupil);

        let sample = &self.settings.sample;
        let factors = scatter_factor(
            &vec![sample.dn; sample.slices],
            &self.settings.scatter_params()?,
        )?;

        let pb = ProgressBar::new(waves.len() as u64);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] {bar:40.green/blue} {pos:>5}/{len:5} {msg} ETA: {eta_precise}",
        ) {
            pb.set_style(style.progress_chars("█▇▆▅▄▃▂▁"));
        }
        pb.set_message("angle".to_string());

        let (ci, cj) = self.grid.centre();
        let results = waves
            .par_iter()
            .map(|wave| {
                let result = if wave.is_null() {
                    AngleResult {
                        angle: wave.angle,
                        null: true,
                        transmitted: 0.0,
                        centre: Complex64::new(0.0, 0.0),
                    }
                } else {
                    let seed = wave.seed(&self.grid);
                    let incident = seed.energy();
                    let out = marcher.march(seed, &factors, sample.dz)?;
                    AngleResult {
                        angle: wave.angle,
                        null: false,
                        transmitted: energy(&out.uf) / incident,
                        centre: out.uf[[ci, cj]],
                    }
                };
                pb.inc(1);
                Ok(result)
            })
            .collect::<crate::error::Result<Vec<_>>>()?;
        pb.finish_and_clear();

        let duration = start.elapsed();
        info!(?duration, per_angle = ?duration / waves.len().max(1) as u32, "solve complete");
        Ok(results)
    }
}

/// Logs one line per angle and flags null angles.
pub fn summarize(results: &[AngleResult]) {
    for r in results {
        if r.null {
            warn!(
                polar_deg = r.angle.polar.to_degrees(),
                azimuth_deg = r.angle.azimuth.to_degrees(),
                "angle lies outside the pupil"
            );
        } else {
            info!(
                polar_deg = r.angle.polar.to_degrees(),
                azimuth_deg = r.angle.azimuth.to_degrees(),
                transmitted = r.transmitted,
                phase = r.centre.arg(),
                "angle marched"
            );
        }
    }
}
