pub const GAMMA_EPSILON: f64 = 1e-8; // smallest |gamma| divided by when splitting coupled fields
pub const TILT_WORKGROUP_SIZE: u32 = 256; // invocations per workgroup of the tilt kernel
pub const TILT_TOLERANCE: f64 = 1e-5; // accepted deviation between reference and accelerated tilt
pub const TILT_F32_PHASE_SLACK: f64 = 16.0 * std::f64::consts::PI * f32::EPSILON as f64; // extra unsnapped tilt deviation per medium wavelength of half-extent
pub const DEFAULT_NA: f64 = 0.65; // numerical aperture used when none is configured
pub const DEFAULT_RES: [f64; 3] = [0.1, 0.1, 0.1]; // default sampling pitch in wavelengths
