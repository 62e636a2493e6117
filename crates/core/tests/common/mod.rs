#![allow(dead_code)]

use lumensync_core::edid::{self, EdidIdentity};
use lumensync_core::{
    DisplayBackend, FeatureValue, HardwareError, OrdinalMapping, OsCorrelation, PhysicalDisplayHandle,
    RegistryEdidEntry, VcpFeature,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

pub fn dell_edid(serial: &str) -> Vec<u8> {
    edid::encode(&EdidIdentity {
        manufacturer_id: Some("DEL".into()),
        product_code: "4109".into(),
        serial_number: None,
        serial: Some(serial.into()),
        monitor_name: Some("DELL U2415".into()),
    })
}

pub fn display(backend: &str, index: usize, serial: &str) -> PhysicalDisplayHandle {
    PhysicalDisplayHandle {
        backend: backend.into(),
        index,
        edid: Some(dell_edid(serial)),
        ..PhysicalDisplayHandle::default()
    }
}

/// Backend whose enumeration and feature answers are set by the test.
pub struct ScriptedBackend {
    name: String,
    displays: Mutex<Vec<PhysicalDisplayHandle>>,
    failing: Mutex<HashSet<usize>>,
    values: Mutex<HashMap<usize, u32>>,
    writes: Mutex<Vec<(usize, VcpFeature, u32)>>,
    enumerate_delay: Mutex<Duration>,
    enumerate_calls: AtomicUsize,
    fail_enumeration: Mutex<bool>,
    identifies: AtomicBool,
    non_continuous: Mutex<HashSet<usize>>,
    maxima: Mutex<HashMap<VcpFeature, u32>>,
}

impl ScriptedBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            displays: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            values: Mutex::new(HashMap::new()),
            writes: Mutex::new(Vec::new()),
            enumerate_delay: Mutex::new(Duration::ZERO),
            enumerate_calls: AtomicUsize::new(0),
            fail_enumeration: Mutex::new(false),
            identifies: AtomicBool::new(true),
            non_continuous: Mutex::new(HashSet::new()),
            maxima: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_displays(&self, displays: Vec<PhysicalDisplayHandle>) {
        *self.displays.lock() = displays;
    }

    /// Makes feature reads of the display at `index` fail (or succeed again).
    pub fn set_failing(&self, index: usize, failing: bool) {
        let mut set = self.failing.lock();
        if failing {
            set.insert(index);
        } else {
            set.remove(&index);
        }
    }

    pub fn set_value(&self, index: usize, value: u32) {
        self.values.lock().insert(index, value);
    }

    pub fn set_enumerate_delay(&self, delay: Duration) {
        *self.enumerate_delay.lock() = delay;
    }

    pub fn set_fail_enumeration(&self, fail: bool) {
        *self.fail_enumeration.lock() = fail;
    }

    /// Must be set before the directory is built, which reads it once.
    pub fn set_provides_identification(&self, identifies: bool) {
        self.identifies.store(identifies, Ordering::SeqCst);
    }

    pub fn set_non_continuous(&self, index: usize) {
        self.non_continuous.lock().insert(index);
    }

    pub fn set_max(&self, feature: VcpFeature, max: u32) {
        self.maxima.lock().insert(feature, max);
    }

    pub fn enumerate_calls(&self) -> usize {
        self.enumerate_calls.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<(usize, VcpFeature, u32)> {
        self.writes.lock().clone()
    }
}

impl DisplayBackend for ScriptedBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn provides_identification(&self) -> bool {
        self.identifies.load(Ordering::SeqCst)
    }

    fn enumerate(&self) -> Result<Vec<PhysicalDisplayHandle>, HardwareError> {
        self.enumerate_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.enumerate_delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if *self.fail_enumeration.lock() {
            return Err(HardwareError::Enumerate { backend: self.name.clone(), reason: "bus error".into() });
        }
        Ok(self.displays.lock().clone())
    }

    fn read_feature(&self, handle: &PhysicalDisplayHandle, feature: VcpFeature) -> Result<FeatureValue, HardwareError> {
        if self.failing.lock().contains(&handle.index) {
            return Err(HardwareError::Read { code: feature.code(), reason: "no reply".into() });
        }
        if self.non_continuous.lock().contains(&handle.index) {
            return Ok(FeatureValue::NonContinuous);
        }
        let current = self.values.lock().get(&handle.index).copied().unwrap_or(50);
        let max = self.maxima.lock().get(&feature).copied().unwrap_or(100);
        Ok(FeatureValue::Continuous { current, max })
    }

    fn write_feature(&self, handle: &PhysicalDisplayHandle, feature: VcpFeature, raw_value: u32) -> Result<(), HardwareError> {
        if self.failing.lock().contains(&handle.index) {
            return Err(HardwareError::Write { code: feature.code(), reason: "no reply".into() });
        }
        self.writes.lock().push((handle.index, feature, raw_value));
        self.values.lock().insert(handle.index, raw_value);
        Ok(())
    }

    fn read_raw_identification(&self, handle: &PhysicalDisplayHandle) -> Option<Vec<u8>> {
        handle.edid.clone()
    }
}

/// OS correlation tables supplied by the test.
#[derive(Default)]
pub struct ScriptedCorrelation {
    ordinals: Mutex<Vec<OrdinalMapping>>,
    registry: Mutex<Vec<RegistryEdidEntry>>,
    failing: AtomicBool,
}

impl ScriptedCorrelation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a monitor at `ordinal` whose registry EDID is `edid`.
    pub fn add(&self, ordinal: usize, instance_path: &str, edid: &[u8]) {
        let parsed = edid::parse(edid).expect("valid EDID");
        let model_code = format!("{}{}", parsed.manufacturer_id.clone().unwrap_or_default(), parsed.product_code);
        self.ordinals.lock().push(OrdinalMapping {
            ordinal_index: ordinal,
            model_code: model_code.clone(),
            instance_path: instance_path.into(),
        });
        self.registry.lock().push(RegistryEdidEntry {
            model_code,
            instance_path: instance_path.into(),
            parsed_serial: parsed.serial,
            parsed_serial_number: parsed.serial_number,
            parsed_friendly_name: parsed.monitor_name,
        });
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl OsCorrelation for ScriptedCorrelation {
    fn physical_monitor_ordinals(&self) -> Result<Vec<OrdinalMapping>, HardwareError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(HardwareError::Correlation("access denied".into()));
        }
        Ok(self.ordinals.lock().clone())
    }

    fn registry_edid_entries(&self) -> Result<Vec<RegistryEdidEntry>, HardwareError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(HardwareError::Correlation("access denied".into()));
        }
        Ok(self.registry.lock().clone())
    }
}
