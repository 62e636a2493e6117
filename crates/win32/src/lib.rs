pub mod paths;
pub mod simulated;

#[cfg(windows)]
mod topology;
#[cfg(windows)]
pub mod ddc;
#[cfg(windows)]
pub mod registry;

use lumensync_core::{DisplayBackend, OsCorrelation};
use std::sync::Arc;

pub use simulated::{SimulatedBackend, SimulatedMonitor};

/// Display backends and correlation source available on this host.
pub struct Platform {
    pub backends: Vec<Arc<dyn DisplayBackend>>,
    pub correlation: Option<Arc<dyn OsCorrelation>>,
}

#[cfg(windows)]
pub fn platform() -> Platform {
    Platform {
        backends: vec![Arc::new(ddc::Win32DdcBackend::new())],
        correlation: Some(Arc::new(registry::RegistryCorrelation)),
    }
}

#[cfg(not(windows))]
pub fn platform() -> Platform {
    // No DDC/CI access off Windows
    Platform {
        backends: vec![Arc::new(SimulatedBackend::demo())],
        correlation: None,
    }
}
