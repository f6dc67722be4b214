//! The build core facade.
//!
//! Wires the subsystems into a [`Mason`] instance exposing the
//! programmatic API: [`Mason::build`], [`Mason::resume`],
//! [`Mason::clean`] and [`Mason::graph_stats`]. There are no
//! process-wide singletons; every service lives inside the instance
//! and is passed down by reference.
//!
//! ```no_run
//! use mason_build::{BuildConfig, Mason};
//! use mason_exec::HandlerRegistry;
//!
//! # fn main() -> mason_error::Result<()> {
//! let config = BuildConfig::new("/path/to/workspace").from_env();
//! let targets = vec![/* supplied by the workspace loader */];
//! let mason = Mason::new(config, targets, HandlerRegistry::new())?;
//! let report = mason.build(None)?;
//! std::process::exit(mason_build::exit_code(&Ok(report)));
//! # }
//! ```

mod api;
mod config;
mod fingerprints;

pub use api::{exit_code, BuildReport, Mason};
pub use config::BuildConfig;
pub use fingerprints::compute_fingerprints;

/// Install the default tracing subscriber, filtered by `RUST_LOG`.
/// Embedders that bring their own subscriber simply skip this; calling
/// it twice is harmless.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
