//! Line Cluster Probe - headless driver for the line cluster engine
//!
//! Loads an entity feed, applies filters, points a camera at it, optionally replays a deep
//! link or a tap, and prints the resulting features, focus and camera commands as JSON.

mod error;
mod probe;
mod settings;

use clap::Parser;
use error::ProbeError;
use settings::Settings;
use std::process::ExitCode;

fn main() -> ExitCode {
    setup_logging();
    let settings = Settings::parse();

    match print_report(&settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_report(settings: &Settings) -> Result<(), ProbeError> {
    let report = probe::execute(settings)?;
    let json = if settings.pretty {
        serde_json::to_string_pretty(&report)?
    } else {
        serde_json::to_string(&report)?
    };
    println!("{json}");
    Ok(())
}

/// Initialize logging to stderr so stdout only carries the report
///
/// Uses RUST_LOG when set, otherwise a default that keeps engine debug output visible in
/// debug builds.
fn setup_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("info,line_cluster_lib=debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
