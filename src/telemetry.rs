//! Tracing bootstrap.

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::{Error, Result};

/// Install the global subscriber: `RUST_LOG` when set, `info` otherwise.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .map_err(|e| Error::Telemetry {
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_fails() {
        let _ = init_tracing();
        assert!(matches!(init_tracing(), Err(Error::Telemetry { .. })));
    }
}
