//! Logging setup and the crate-wide tracing prelude.
//!
//! Modules pull the macros in with `use crate::tracing::prelude::*;` so the
//! set of levels in use stays consistent across the crate.

use time::macros::format_description;
use tracing_subscriber::fmt::time::LocalTime;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

pub mod prelude {
    pub use ::tracing::{debug, error, info, trace, warn};
}

/// Default filter when `RUST_LOG` is unset.
const DEFAULT_FILTER: &str = "info";

/// Install a global subscriber.
///
/// Logs go to the systemd journal when it is reachable, otherwise to stdout
/// with local timestamps. Safe to call more than once; later calls are
/// ignored.
pub fn init_journald_or_stdout() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match tracing_journald::layer() {
        Ok(journald) => {
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(journald)
                .try_init();
        }
        Err(_) => {
            let timer = LocalTime::new(format_description!(
                "[hour]:[minute]:[second].[subsecond digits:3]"
            ));
            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_timer(timer).with_target(false))
                .try_init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repeated_init_is_harmless() {
        init_journald_or_stdout();
        init_journald_or_stdout();
        prelude::info!("Logging initialised twice");
    }
}
