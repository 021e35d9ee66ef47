//! Oblique plane-wave illumination.
//!
//! **Context**: Tomographic acquisitions illuminate the sample from many
//! incidence angles. Each angle is reduced to one complex amplitude that
//! phase-references its plane wave to the volume centre; the wave itself is
//! expanded over the grid only when a field pair is seeded.
//!
//! **How it Works**: An angle `(polar, azimuth)` in the medium has direction
//! factors `(sin θ·cos φ, sin θ·sin φ)` and transverse frequency
//! `n0·(direction factors)/λ`. With truncation on, the frequency is snapped
//! toward zero onto the FFT grid so the wave is periodic over the window;
//! snapped frequencies beyond the pupil (under the configured [`Cutoff`]) or
//! Nyquist give a null amplitude.
//!
//! Two generators implement [`TiltGenerator`]: [`ReferenceTilt`] evaluates
//! the closed form in f64 and [`AcceleratedTilt`] runs one batched kernel on
//! a [`ComputeBackend`]. They agree within [`tilt_tolerance`].

use std::f64::consts::TAU;
use std::sync::Arc;

use ndarray::Array2;
use num_complex::Complex64;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::backend::{
    f32_bytes, f32_from_bytes, u32_bytes, workgroups, Binding, BufferScope, BufferUsage,
    ComputeBackend, KernelId, TruncationMode,
};
use crate::config;
use crate::error::{ensure_finite, invalid, Result, SsnpError};
use crate::field::FieldPair;
use crate::grid::{Cutoff, Grid, Medium};

#[cfg(test)]
mod tests {

    use super::*;
    use crate::fft::Fft2;
    use crate::host::HostBackend;

    fn grid() -> Grid {
        Grid::new((32, 32), [0.1, 0.1, 0.1]).unwrap()
    }

    fn params() -> TiltParams {
        TiltParams {
            na: 0.9,
            medium: Medium::new(1.33, 0.5).unwrap(),
            truncate: true,
            cutoff: Cutoff::Inclusive,
        }
    }

    #[test]
    fn normal_incidence_is_unit_dc() {
        let waves = tilt_waves(&ReferenceTilt, &grid(), &[IncidenceAngle::default()], &params()).unwrap();
        assert_eq!(waves[0].amplitude, Complex64::new(1.0, 0.0));
        assert_eq!((waves[0].fx, waves[0].fy), (0.0, 0.0));
        let field = waves[0].synthesize(&grid());
        assert!(field.iter().all(|v| (v - Complex64::new(1.0, 0.0)).norm() < 1e-12));
    }

    #[test]
    fn synthesized_wave_is_one_at_centre() {
        let grid = grid();
        let angle = IncidenceAngle::from_degrees(20.0, 35.0);
        for truncate in [true, false] {
            let params = TiltParams { truncate, ..params() };
            let waves = tilt_waves(&ReferenceTilt, &grid, &[angle], &params).unwrap();
            let field = waves[0].synthesize(&grid);
            let (ci, cj) = grid.centre();
            assert!((field[[ci, cj]] - Complex64::new(1.0, 0.0)).norm() < 1e-10);
            assert!(field.iter().all(|v| (v.norm() - 1.0).abs() < 1e-12));
        }
    }

    #[test]
    fn truncated_wave_occupies_one_bin() {
        let grid = grid();
        let waves = tilt_waves(
            &ReferenceTilt,
            &grid,
            &[IncidenceAngle::from_degrees(25.0, 60.0)],
            &params(),
        )
        .unwrap();
        let mut spectrum = waves[0].synthesize(&grid);
        Fft2::new(grid.shape).forward(&mut spectrum).unwrap();
        let total: f64 = spectrum.iter().map(|v| v.norm_sqr()).sum();
        let peak = spectrum.iter().map(|v| v.norm_sqr()).fold(0.0, f64::max);
        assert!((peak / total - 1.0).abs() < 1e-10);
    }

    #[test]
    fn outside_aperture_is_null() {
        let grid = grid();
        // sin(70°)·1.33 = 1.25 exceeds NA = 0.9
        let angle = IncidenceAngle::from_degrees(70.0, 10.0);
        let waves = tilt_waves(&ReferenceTilt, &grid, &[angle], &params()).unwrap();
        assert!(waves[0].is_null());
        assert!(waves[0].synthesize(&grid).iter().all(|v| v.norm() == 0.0));

        // without truncation the wave is returned anyway
        let params = TiltParams {
            truncate: false,
            ..params()
        };
        let waves = tilt_waves(&ReferenceTilt, &grid, &[angle], &params).unwrap();
        assert!((waves[0].amplitude.norm() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn na_circle_follows_cutoff() {
        // w·rx = 8 medium wavelengths, so bin 2 lands exactly on the NA circle
        let grid = Grid::new((64, 64), [0.125, 0.125, 0.125]).unwrap();
        let angle = [IncidenceAngle::new(0.26f64.asin(), 0.0)];
        let backend: Arc<dyn ComputeBackend> = Arc::new(HostBackend::new());
        for (cutoff, null) in [(Cutoff::Inclusive, false), (Cutoff::Exclusive, true)] {
            let params = TiltParams {
                na: 0.25,
                medium: Medium::default(),
                truncate: true,
                cutoff,
            };
            for generator in [
                select_generator(None, FallbackPolicy::Fail),
                select_generator(Some(backend.clone()), FallbackPolicy::Fail),
            ] {
                let waves = tilt_waves(generator.as_ref(), &grid, &angle, &params).unwrap();
                assert_eq!(waves[0].is_null(), null, "{} with {cutoff:?}", generator.name());
            }
        }
    }

    #[test]
    fn untruncated_tolerance_grows_with_window() {
        let small = Grid::new((64, 64), [0.1, 0.1, 0.1]).unwrap();
        let large = Grid::new((1024, 1024), [0.1, 0.1, 0.1]).unwrap();
        let snapped = params();
        let free = TiltParams {
            truncate: false,
            ..params()
        };
        assert_eq!(tilt_tolerance(&large, &snapped), config::TILT_TOLERANCE);
        // slack is linear in the window extent, 16 times larger here
        let slack = |grid: &Grid| tilt_tolerance(grid, &free) - config::TILT_TOLERANCE;
        assert!(slack(&small) > 0.0);
        assert!((slack(&large) / slack(&small) - 16.0).abs() < 1e-9);
    }

    #[test]
    fn seed_is_forward_only() {
        let grid = grid();
        let waves = tilt_waves(
            &ReferenceTilt,
            &grid,
            &[IncidenceAngle::from_degrees(10.0, 0.0)],
            &params(),
        )
        .unwrap();
        let fields = waves[0].seed(&grid);
        assert_eq!(fields.ub, Array2::zeros(grid.shape));
        assert!((fields.energy() - grid.len() as f64).abs() < 1e-9);
    }

    #[test]
    fn accelerated_matches_reference() {
        let grid = grid();
        let angles: Vec<IncidenceAngle> = [(0.0, 0.0), (12.3, 41.0), (27.1, 200.0), (33.7, 301.0)]
            .iter()
            .map(|&(p, a)| IncidenceAngle::from_degrees(p, a))
            .collect();
        let reference = ReferenceTilt.amplitudes(&grid, &angles, &params()).unwrap();
        let accelerated = AcceleratedTilt::new(Arc::new(HostBackend::new()))
            .amplitudes(&grid, &angles, &params())
            .unwrap();
        for (r, a) in reference.iter().zip(accelerated.iter()) {
            assert!((r - a).norm() <= config::TILT_TOLERANCE * r.norm().max(1.0));
        }
    }

    #[test]
    fn accelerated_releases_buffers() {
        let backend = Arc::new(HostBackend::new());
        let generator = AcceleratedTilt::new(backend.clone());
        generator
            .amplitudes(&grid(), &[IncidenceAngle::default()], &params())
            .unwrap();
        assert_eq!(backend.live_buffers(), 0);
    }

    #[test]
    fn fallback_recovers_from_exhaustion() {
        let backend: Arc<dyn ComputeBackend> = Arc::new(HostBackend::with_capacity(16));
        let angles = [IncidenceAngle::from_degrees(15.0, 30.0)];
        let recovered = FallbackTilt::new(backend.clone(), FallbackPolicy::Reference)
            .amplitudes(&grid(), &angles, &params())
            .unwrap();
        let reference = ReferenceTilt.amplitudes(&grid(), &angles, &params()).unwrap();
        assert_eq!(recovered, reference);

        let failed = FallbackTilt::new(backend, FallbackPolicy::Fail).amplitudes(&grid(), &angles, &params());
        assert!(matches!(failed, Err(SsnpError::ResourceExhausted(_))));
    }

    #[test]
    fn selection_by_availability() {
        assert_eq!(select_generator(None, FallbackPolicy::Reference).name(), "reference");
        let backend: Arc<dyn ComputeBackend> = Arc::new(HostBackend::new());
        assert_eq!(
            select_generator(Some(backend), FallbackPolicy::Reference).name(),
            "accelerated"
        );
    }

    #[test]
    fn rejects_bad_input() {
        let angles = [IncidenceAngle::new(f64::NAN, 0.0)];
        assert!(ReferenceTilt.amplitudes(&grid(), &angles, &params()).is_err());
        let params = TiltParams {
            na: -1.0,
            ..params()
        };
        assert!(ReferenceTilt
            .amplitudes(&grid(), &[IncidenceAngle::default()], &params)
            .is_err());
        assert!(ReferenceTilt.amplitudes(&grid(), &[], &TiltParams::default()).unwrap().is_empty());
    }
}

/// Incidence direction in radians, measured in the medium.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
pub struct IncidenceAngle {
    pub polar: f64,
    pub azimuth: f64,
}

impl IncidenceAngle {
    pub fn new(polar: f64, azimuth: f64) -> Self {
        Self { polar, azimuth }
    }

    pub fn from_degrees(polar: f64, azimuth: f64) -> Self {
        Self::new(polar.to_radians(), azimuth.to_radians())
    }

    /// Direction factors `(sin θ·cos φ, sin θ·sin φ)`.
    pub fn direction(&self) -> (f64, f64) {
        let s = self.polar.sin();
        (s * self.azimuth.cos(), s * self.azimuth.sin())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TiltParams {
    pub na: f64,
    pub medium: Medium,
    pub truncate: bool,
    pub cutoff: Cutoff, // whether a snapped angle exactly on the NA circle is kept
}

impl Default for TiltParams {
    fn default() -> Self {
        Self {
            na: config::DEFAULT_NA,
            medium: Medium::default(),
            truncate: true,
            cutoff: Cutoff::Inclusive,
        }
    }
}

impl TiltParams {
    fn validate(&self) -> Result<()> {
        if !(self.na.is_finite() && self.na >= 0.0) {
            return invalid(format!("numerical aperture must be finite and >= 0, got {}", self.na));
        }
        Medium::new(self.medium.n0, self.medium.wavelength).map(|_| ())
    }

    /// Resolution in medium wavelengths and the aperture over `n0`.
    fn normalized(&self, grid: &Grid) -> ([f64; 3], f64) {
        let scale = self.medium.n0 / self.medium.wavelength;
        let res = grid.res.as_array().map(|r| r * scale);
        (res, self.na / self.medium.n0)
    }

    pub fn mode(&self) -> TruncationMode {
        TruncationMode::new(self.truncate, self.cutoff)
    }
}

/// Largest accepted `|reference − accelerated|` for one angle on `grid`.
///
/// Snapped angles carry their centre phase as a ratio of integer bins, so
/// the kernel matches the reference within [`config::TILT_TOLERANCE`].
/// Unsnapped angles build the phase from `f32` direction factors; the error
/// grows with the half-extent of the window in medium wavelengths and is
/// bounded by [`config::TILT_F32_PHASE_SLACK`] per wavelength.
pub fn tilt_tolerance(grid: &Grid, params: &TiltParams) -> f64 {
    if params.truncate {
        return config::TILT_TOLERANCE;
    }
    let (res, _) = params.normalized(grid);
    let (h, w) = grid.shape;
    let extent = (w / 2) as f64 * res[0] + (h / 2) as f64 * res[1];
    config::TILT_TOLERANCE + config::TILT_F32_PHASE_SLACK * extent
}

fn check_angles(angles: &[IncidenceAngle]) -> Result<()> {
    if let Some(bad) = angles
        .iter()
        .find(|a| !(a.polar.is_finite() && a.azimuth.is_finite()))
    {
        return invalid(format!("incidence angle {bad:?} is not finite"));
    }
    Ok(())
}

/// Fractional part of `m·(n/2)/n` for an integer bin `m`.
fn bin_cycles(m: f64, n: usize) -> f64 {
    let n = n as i64;
    (m as i64 * (n / 2)).rem_euclid(n) as f64 / n as f64
}

/// Direction factors of one angle after optional snapping, with the number
/// of cycles its wave completes between the origin and the volume centre.
struct Snapped {
    ca: f64,
    cb: f64,
    cycles: f64,
}

/// `None` for a null angle.
fn snapped_direction(
    angle: &IncidenceAngle,
    shape: (usize, usize),
    res: [f64; 3],
    na: f64,
    mode: TruncationMode,
) -> Option<Snapped> {
    let (h, w) = shape;
    let (ca, cb) = angle.direction();
    let cutoff = match mode {
        TruncationMode::Off => {
            let cycles = ca * (w / 2) as f64 * res[0] + cb * (h / 2) as f64 * res[1];
            return Some(Snapped { ca, cb, cycles });
        }
        TruncationMode::Inclusive => Cutoff::Inclusive,
        TruncationMode::Exclusive => Cutoff::Exclusive,
    };
    let mx = (ca * w as f64 * res[0]).trunc();
    let my = (cb * h as f64 * res[1]).trunc();
    if mx.abs() > (w / 2) as f64 || my.abs() > (h / 2) as f64 {
        return None;
    }
    let ca = mx / (w as f64 * res[0]);
    let cb = my / (h as f64 * res[1]);
    if !cutoff.contains(ca * ca + cb * cb, na * na) {
        return None;
    }
    Some(Snapped {
        ca,
        cb,
        cycles: bin_cycles(mx, w) + bin_cycles(my, h),
    })
}

/// Produces one complex amplitude per incidence angle, in input order.
pub trait TiltGenerator: Send + Sync {
    fn name(&self) -> &'static str;

    fn amplitudes(
        &self,
        grid: &Grid,
        angles: &[IncidenceAngle],
        params: &TiltParams,
    ) -> Result<Vec<Complex64>>;
}

/// Closed-form evaluation in f64.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReferenceTilt;

impl TiltGenerator for ReferenceTilt {
    fn name(&self) -> &'static str {
        "reference"
    }

    fn amplitudes(
        &self,
        grid: &Grid,
        angles: &[IncidenceAngle],
        params: &TiltParams,
    ) -> Result<Vec<Complex64>> {
        params.validate()?;
        check_angles(angles)?;
        let (res, na) = params.normalized(grid);

        Ok(angles
            .iter()
            .map(|angle| match snapped_direction(angle, grid.shape, res, na, params.mode()) {
                None => Complex64::new(0.0, 0.0),
                Some(Snapped { cycles, .. }) => {
                    Complex64::from_polar(1.0, -TAU * (cycles - cycles.floor()))
                }
            })
            .collect())
    }
}

/// One batched dispatch of the tilt kernel on a compute backend.
#[derive(Clone)]
pub struct AcceleratedTilt {
    backend: Arc<dyn ComputeBackend>,
}

impl AcceleratedTilt {
    pub fn new(backend: Arc<dyn ComputeBackend>) -> Self {
        Self { backend }
    }
}

impl TiltGenerator for AcceleratedTilt {
    fn name(&self) -> &'static str {
        "accelerated"
    }

    fn amplitudes(
        &self,
        grid: &Grid,
        angles: &[IncidenceAngle],
        params: &TiltParams,
    ) -> Result<Vec<Complex64>> {
        params.validate()?;
        check_angles(angles)?;
        if angles.is_empty() {
            return Ok(Vec::new());
        }
        let (h, w) = grid.shape;
        let (Ok(h), Ok(w)) = (u32::try_from(h), u32::try_from(w)) else {
            return invalid(format!("shape {:?} does not fit the kernel", grid.shape));
        };
        let (res, na) = params.normalized(grid);

        let angle_data: Vec<f32> = angles
            .iter()
            .flat_map(|a| [a.polar as f32, a.azimuth as f32])
            .collect();
        let inputs = [
            (f32_bytes(&angle_data), BufferUsage::ReadOnlyStorage),
            (u32_bytes(&[h, w]), BufferUsage::ReadOnlyStorage),
            (f32_bytes(&res.map(|r| r as f32)), BufferUsage::ReadOnlyStorage),
            (f32_bytes(&vec![0.0; 2 * angles.len()]), BufferUsage::Storage),
            (f32_bytes(&[na as f32]), BufferUsage::Uniform),
            (u32_bytes(&[params.mode().flag()]), BufferUsage::Uniform),
        ];

        let mut scope = BufferScope::new(self.backend.as_ref());
        let mut bindings = Vec::with_capacity(inputs.len());
        for (slot, (bytes, usage)) in inputs.iter().enumerate() {
            let handle = scope.allocate(bytes, *usage)?;
            bindings.push(Binding::whole(slot as u32, handle, bytes.len() as u64));
        }

        let groups = workgroups(angles.len());
        debug!(
            angles = angles.len(),
            workgroups = groups,
            device = %self.backend.device_info().name,
            "dispatching tilt kernel"
        );
        scope.backend().dispatch(KernelId::Tilt, &bindings, groups)?;
        let output = f32_from_bytes(&scope.backend().read_back(bindings[3].handle)?)?;

        if output.len() < 2 * angles.len() {
            return Err(SsnpError::NumericalDegeneracy(format!(
                "kernel returned {} values for {} angles",
                output.len(),
                angles.len()
            )));
        }
        let amplitudes: Vec<Complex64> = output
            .chunks_exact(2)
            .take(angles.len())
            .map(|pair| Complex64::new(pair[0] as f64, pair[1] as f64))
            .collect();
        ensure_finite(amplitudes.iter(), "tilt amplitudes")?;
        Ok(amplitudes)
    }
}

/// What [`FallbackTilt`] does when the accelerated path runs out of resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FallbackPolicy {
    /// Log a warning and recompute on the reference path.
    #[default]
    Reference,
    /// Propagate the error.
    Fail,
}

/// Accelerated generation with a reference fallback on `ResourceExhausted`.
#[derive(Clone)]
pub struct FallbackTilt {
    accelerated: AcceleratedTilt,
    policy: FallbackPolicy,
}

impl FallbackTilt {
    pub fn new(backend: Arc<dyn ComputeBackend>, policy: FallbackPolicy) -> Self {
        Self {
            accelerated: AcceleratedTilt::new(backend),
            policy,
        }
    }
}

impl TiltGenerator for FallbackTilt {
    fn name(&self) -> &'static str {
        self.accelerated.name()
    }

    fn amplitudes(
        &self,
        grid: &Grid,
        angles: &[IncidenceAngle],
        params: &TiltParams,
    ) -> Result<Vec<Complex64>> {
        match self.accelerated.amplitudes(grid, angles, params) {
            Err(SsnpError::ResourceExhausted(reason)) if self.policy == FallbackPolicy::Reference => {
                warn!(%reason, angles = angles.len(), "accelerated tilt failed, using reference path");
                ReferenceTilt.amplitudes(grid, angles, params)
            }
            other => other,
        }
    }
}

/// Accelerated generation when a backend is available, reference otherwise.
pub fn select_generator(
    backend: Option<Arc<dyn ComputeBackend>>,
    policy: FallbackPolicy,
) -> Box<dyn TiltGenerator> {
    match backend {
        Some(backend) => Box::new(FallbackTilt::new(backend, policy)),
        None => Box::new(ReferenceTilt),
    }
}

/// Amplitudes for raw shape and resolution slices.
///
/// Fails with `InvalidArgument` unless `shape` has two entries and `res`
/// three.
pub fn tilt_amplitudes(
    generator: &dyn TiltGenerator,
    shape: &[usize],
    res: &[f64],
    angles: &[IncidenceAngle],
    params: &TiltParams,
) -> Result<Vec<Complex64>> {
    let grid = Grid::from_slices(shape, res)?;
    generator.amplitudes(&grid, angles, params)
}

/// A plane wave ready to seed a field pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TiltWave {
    pub angle: IncidenceAngle,
    pub fx: f64, // cycles per unit length along x
    pub fy: f64,
    pub amplitude: Complex64,
}

impl TiltWave {
    /// Null waves lie outside the pupil and carry no light.
    pub fn is_null(&self) -> bool {
        self.amplitude.norm() == 0.0
    }

    /// `A·exp(i2π(fx·x + fy·y))` sampled on the grid.
    pub fn synthesize(&self, grid: &Grid) -> Array2<Complex64> {
        if self.is_null() {
            return Array2::zeros(grid.shape);
        }
        let (dx, dy) = (grid.res.x, grid.res.y);
        Array2::from_shape_fn(grid.shape, |(i, j)| {
            let cycles = self.fx * j as f64 * dx + self.fy * i as f64 * dy;
            self.amplitude * Complex64::from_polar(1.0, TAU * cycles)
        })
    }

    pub fn seed(&self, grid: &Grid) -> FieldPair {
        FieldPair::forward(self.synthesize(grid))
    }
}

/// Amplitudes from `generator` paired with their transverse frequencies.
pub fn tilt_waves(
    generator: &dyn TiltGenerator,
    grid: &Grid,
    angles: &[IncidenceAngle],
    params: &TiltParams,
) -> Result<Vec<TiltWave>> {
    let amplitudes = generator.amplitudes(grid, angles, params)?;
    let (res, na) = params.normalized(grid);
    let scale = params.medium.n0 / params.medium.wavelength;

    Ok(angles
        .iter()
        .zip(amplitudes)
        .map(|(angle, amplitude)| {
            let (ca, cb) = snapped_direction(angle, grid.shape, res, na, params.mode())
                .map(|s| (s.ca, s.cb))
                .unwrap_or_else(|| angle.direction());
            TiltWave {
                angle: *angle,
                fx: ca * scale,
                fy: cb * scale,
                amplitude,
            }
        })
        .collect())
}
