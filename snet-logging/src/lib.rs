//! Ambient logging setup (component 4.M), grounded in the `firezone-logging`
//! crate: a global `tracing` subscriber built from `RUST_LOG`, with a fixed
//! prefix of noisy-crate directives so a bare `debug` still produces
//! readable output.
//!
//! The upstream crate also wires a Sentry layer for remote error reporting.
//! This project has no telemetry backend to report to, so that layer is
//! dropped entirely rather than stubbed out — see `DESIGN.md`.

mod dyn_err;

pub use dyn_err::{anyhow_dyn_err, std_dyn_err};

use anyhow::{Context, Result};
use tracing::subscriber::DefaultGuard;
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, util::SubscriberInitExt as _, EnvFilter};

/// Crates whose default verbosity drowns out everything else; prepended to
/// whatever the caller passes so a catch-all directive stays readable.
const IRRELEVANT_CRATES: &str = "rustls=warn,tokio_util=warn";

/// Builds the filter every subscriber in this crate uses: the caller's
/// directives layered over [`IRRELEVANT_CRATES`], so restating a crate in
/// the caller's string (e.g. `rustls=debug`) still overrides the default.
pub fn try_filter(directives: &str) -> Result<EnvFilter, tracing_subscriber::filter::ParseError> {
    if directives.is_empty() {
        return EnvFilter::try_new(IRRELEVANT_CRATES);
    }

    EnvFilter::try_new(format!("{IRRELEVANT_CRATES},{directives}"))
}

/// Registers a global, stdout-writing subscriber built from `RUST_LOG`
/// (or [`IRRELEVANT_CRATES`] alone if unset). Also routes the `log` crate's
/// records through `tracing`, since some dependencies still use it.
pub fn setup_global_subscriber() -> Result<()> {
    let directives = std::env::var("RUST_LOG").unwrap_or_default();
    let filter = try_filter(&directives).context("failed to parse RUST_LOG directives")?;

    fmt()
        .with_env_filter(filter)
        .with_ansi(supports_ansi())
        .finish()
        .try_init()
        .context("could not install global tracing subscriber")?;

    LogTracer::init().context("failed to initialize LogTracer")?;

    Ok(())
}

fn supports_ansi() -> bool {
    std::env::var_os("NO_COLOR").is_none()
}

/// Installs a subscriber scoped to the current thread for the duration of
/// a test; returned guard must be kept alive for the test body.
pub fn test(directives: &str) -> DefaultGuard {
    tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(directives)
        .set_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_directives_still_silence_noisy_crates() {
        let filter = try_filter("").unwrap();
        assert_eq!(filter.to_string(), IRRELEVANT_CRATES);
    }

    #[test]
    fn caller_directives_are_appended() {
        let filter = try_filter("snet_proxy=debug").unwrap();
        assert!(filter.to_string().contains("snet_proxy=debug"));
        assert!(filter.to_string().contains(IRRELEVANT_CRATES));
    }

    #[test]
    fn malformed_directive_is_rejected() {
        assert!(try_filter("not a directive!!").is_err());
    }
}
