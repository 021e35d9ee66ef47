use anyhow::Result;
use ssnp::scan::{self, AngleScan};
use ssnp::settings;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = settings::load_config()?;
    info!("{settings}");

    let backend = scan::build_backend(settings.backend);
    let scan = AngleScan::new(settings, backend)?;
    let results = scan.solve()?;
    scan::summarize(&results);
    Ok(())
}
