use std::path::Path;

use ssnp::gamma::EvanescentPolicy;
use ssnp::grid::Cutoff;
use ssnp::settings::{self, BackendChoice};
use ssnp::tilt::FallbackPolicy;

const MINIMAL: &str = r#"
    shape = [16, 32]
    res = [0.1, 0.2, 0.5]
    wavelength = 0.5
    n0 = 1.33
    na = 0.8

    [illumination]
    polar_deg = [0.0, 10.0]
    azimuth_deg = [0.0, 90.0, 180.0]

    [sample]
    dn = 0.01
    slices = 3
"#;

#[test]
fn default_config_loads() {
    let settings = settings::load_config_from(Path::new(env!("CARGO_MANIFEST_DIR"))).unwrap();
    let grid = settings.grid().unwrap();
    assert_eq!(grid.shape, (64, 64));
    assert_eq!(grid.res.as_array(), [0.1, 0.1, 1.0]);
    assert!((settings.n0 - 1.33).abs() < 1e-12);
    assert!(!settings.angles().is_empty());
}

#[test]
fn defaults_fill_optional_fields() {
    let settings = settings::parse_config(MINIMAL).unwrap();
    assert!(settings.truncate);
    assert_eq!(settings.evanescent, EvanescentPolicy::Clamp);
    assert_eq!(settings.cutoff, Cutoff::Inclusive);
    assert_eq!(settings.backend, BackendChoice::Host);
    assert_eq!(settings.fallback, FallbackPolicy::Reference);
    assert_eq!(settings.sample.dz, 1.0);
    assert_eq!(settings.grid().unwrap().shape, (16, 32));
}

#[test]
fn angles_are_polar_major_product() {
    let settings = settings::parse_config(MINIMAL).unwrap();
    let angles = settings.angles();
    assert_eq!(angles.len(), 6);
    assert_eq!(angles[0].polar, 0.0);
    assert!((angles[1].azimuth - 90f64.to_radians()).abs() < 1e-12);
    assert!((angles[3].polar - 10f64.to_radians()).abs() < 1e-12);
    assert_eq!(angles[3].azimuth, 0.0);
}

#[test]
fn enums_parse_lowercase() {
    // top-level keys must precede the first table
    let text = format!(
        "evanescent = \"decay\"\ncutoff = \"exclusive\"\nbackend = \"reference\"\nfallback = \"fail\"\n{MINIMAL}"
    );
    let settings = settings::parse_config(&text).unwrap();
    assert_eq!(settings.evanescent, EvanescentPolicy::Decay);
    assert_eq!(settings.cutoff, Cutoff::Exclusive);
    assert_eq!(settings.backend, BackendChoice::Reference);
    assert_eq!(settings.fallback, FallbackPolicy::Fail);
}

#[test]
fn invalid_values_are_rejected() {
    let cases = [
        ("shape = [16, 32]", "shape = [16, 32, 4]"),
        ("res = [0.1, 0.2, 0.5]", "res = [0.1, 0.2]"),
        ("na = 0.8", "na = -0.8"),
        ("wavelength = 0.5", "wavelength = 0.0"),
        ("slices = 3", "slices = 0"),
        ("polar_deg = [0.0, 10.0]", "polar_deg = []"),
    ];
    for (from, to) in cases {
        let text = MINIMAL.replace(from, to);
        assert!(settings::parse_config(&text).is_err(), "accepted {to}");
    }
}
