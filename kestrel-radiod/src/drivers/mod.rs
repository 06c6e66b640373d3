//! Front-end drivers.
//!
//! A driver owns the hardware side of one front end: it parses its device
//! section, opens and programs the device, and delivers sample bursts into
//! the [`Ingest`] sink from its own thread. The core never calls into
//! hardware directly.

use std::path::Path;
use std::sync::Arc;

use kestrel_core::errors::ConfigError;
use kestrel_core::frontend::{Frontend, Ingest};

use crate::config::DeviceConfig;

mod siggen;

pub use siggen::SigGen;

pub trait FrontendDriver: Send {
    /// Parse device options, open the device, program rates and gains, and
    /// fill in the front-end metadata (including the sample rate
    /// handshake). Must not start streaming yet.
    fn setup(
        &mut self,
        fe: &Arc<Frontend>,
        cfg: &DeviceConfig,
        state_dir: &Path,
    ) -> kestrel_core::Result<()>;

    /// Begin streaming into the sink; the driver launches its own threads.
    fn start(&mut self, ingest: Ingest) -> kestrel_core::Result<()>;

    /// Tune the device, returning the frequency actually realized after
    /// calibration.
    fn tune(&mut self, freq: f64) -> kestrel_core::Result<f64>;

    /// Compensation hook for device tuning rounding. Identity until a
    /// device needs better; do not assume identity is correct everywhere.
    fn true_freq(&self, intfreq: i64) -> f64 {
        intfreq as f64
    }

    /// Liveness poll for the monitor loop.
    fn is_streaming(&self) -> bool;

    fn close(&mut self);
}

/// Instantiate a driver by its config name.
pub fn create(name: &str) -> Result<Box<dyn FrontendDriver>, ConfigError> {
    match name.to_ascii_lowercase().as_str() {
        "siggen" => Ok(Box::new(SigGen::new())),
        other => Err(ConfigError::UnknownDevice {
            name: other.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_known_and_unknown() {
        assert!(create("siggen").is_ok());
        assert!(create("SigGen").is_ok());
        assert!(matches!(
            create("rx9999"),
            Err(ConfigError::UnknownDevice { .. })
        ));
    }
}
