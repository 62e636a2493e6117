use lumensync_core::edid::{self, EdidIdentity};
use lumensync_core::{DisplayBackend, FeatureValue, HandleToken, HardwareError, PhysicalDisplayHandle, VcpFeature};
use parking_lot::Mutex;
use std::thread;
use std::time::Duration;

/// An in-memory display behind a [`SimulatedBackend`].
#[derive(Debug, Clone)]
pub struct SimulatedMonitor {
    pub edid: Option<Vec<u8>>,
    pub brightness: u32,
    pub contrast: u32,
    pub max_value: u32,
    /// When false every DDC/CI call fails, like a display that was switched
    /// off or whose cable is loose.
    pub responsive: bool,
}

impl SimulatedMonitor {
    pub fn new(manufacturer: &str, product_code: &str, serial: &str, name: &str) -> Self {
        let edid = edid::encode(&EdidIdentity {
            manufacturer_id: Some(manufacturer.to_string()),
            product_code: product_code.to_string(),
            serial_number: None,
            serial: Some(serial.to_string()),
            monitor_name: Some(name.to_string()),
        });
        Self {
            edid: Some(edid),
            brightness: 50,
            contrast: 50,
            max_value: 100,
            responsive: true,
        }
    }
}

/// Display backend without hardware, used on hosts without DDC/CI access.
pub struct SimulatedBackend {
    name: String,
    monitors: Mutex<Vec<SimulatedMonitor>>,
    latency: Duration,
}

impl SimulatedBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            monitors: Mutex::new(Vec::new()),
            latency: Duration::ZERO,
        }
    }

    /// Two displays with distinct serials.
    pub fn demo() -> Self {
        Self::new("simulated")
            .with_monitor(SimulatedMonitor::new("DEL", "4109", "304NTPC4A088", "DELL U2415"))
            .with_monitor(SimulatedMonitor::new("GSM", "5B09", "108NTAB1C221", "LG ULTRAFINE"))
            .with_latency(Duration::from_millis(40))
    }

    pub fn with_monitor(self, monitor: SimulatedMonitor) -> Self {
        self.monitors.lock().push(monitor);
        self
    }

    /// Delay added to every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_responsive(&self, index: usize, responsive: bool) {
        if let Some(monitor) = self.monitors.lock().get_mut(index) {
            monitor.responsive = responsive;
        }
    }

    pub fn value(&self, index: usize, feature: VcpFeature) -> Option<u32> {
        self.monitors.lock().get(index).map(|m| match feature {
            VcpFeature::Brightness => m.brightness,
            VcpFeature::Contrast => m.contrast,
        })
    }

    fn simulate_latency(&self) {
        if !self.latency.is_zero() {
            thread::sleep(self.latency);
        }
    }

    fn with_responsive<T>(
        &self,
        handle: &PhysicalDisplayHandle,
        code: u8,
        op: impl FnOnce(&mut SimulatedMonitor) -> T,
    ) -> Result<T, HardwareError> {
        self.simulate_latency();
        let mut monitors = self.monitors.lock();
        let monitor = handle
            .token
            .and_then(|t| monitors.get_mut(t.0 as usize))
            .ok_or_else(|| HardwareError::UnknownHandle {
                backend: self.name.clone(),
                token: handle.token.map_or(0, |t| t.0),
            })?;
        if !monitor.responsive {
            return Err(HardwareError::Read { code, reason: "no DDC/CI reply".into() });
        }
        Ok(op(monitor))
    }
}

impl DisplayBackend for SimulatedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn provides_identification(&self) -> bool {
        true
    }

    fn enumerate(&self) -> Result<Vec<PhysicalDisplayHandle>, HardwareError> {
        self.simulate_latency();
        let monitors = self.monitors.lock();
        Ok(monitors
            .iter()
            .enumerate()
            .map(|(index, monitor)| PhysicalDisplayHandle {
                token: Some(HandleToken(index as u64)),
                backend: self.name.clone(),
                index,
                edid: monitor.edid.clone(),
                display_id: Some(format!(r"\\.\DISPLAY{}\Monitor0", index + 1)),
                ..PhysicalDisplayHandle::default()
            })
            .collect())
    }

    fn read_feature(&self, handle: &PhysicalDisplayHandle, feature: VcpFeature) -> Result<FeatureValue, HardwareError> {
        self.with_responsive(handle, feature.code(), |m| {
            let current = match feature {
                VcpFeature::Brightness => m.brightness,
                VcpFeature::Contrast => m.contrast,
            };
            FeatureValue::Continuous { current, max: m.max_value }
        })
    }

    fn write_feature(&self, handle: &PhysicalDisplayHandle, feature: VcpFeature, raw_value: u32) -> Result<(), HardwareError> {
        self.with_responsive(handle, feature.code(), |m| {
            let value = raw_value.min(m.max_value);
            match feature {
                VcpFeature::Brightness => m.brightness = value,
                VcpFeature::Contrast => m.contrast = value,
            }
        })
        .map_err(|e| match e {
            HardwareError::Read { code, reason } => HardwareError::Write { code, reason },
            other => other,
        })
    }

    fn read_raw_identification(&self, handle: &PhysicalDisplayHandle) -> Option<Vec<u8>> {
        let index = handle.token?.0 as usize;
        self.monitors.lock().get(index).and_then(|m| m.edid.clone())
    }
}
