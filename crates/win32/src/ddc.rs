//! DDC/CI through the Dxva2 monitor configuration API.

use crate::topology;
use lumensync_core::{DisplayBackend, FeatureValue, HandleToken, HardwareError, PhysicalDisplayHandle, VcpFeature};
use parking_lot::Mutex;
use std::collections::HashMap;
use windows::Win32::Devices::Display::{
    DestroyPhysicalMonitor, GetNumberOfPhysicalMonitorsFromHMONITOR, GetPhysicalMonitorsFromHMONITOR,
    GetVCPFeatureAndVCPFeatureReply, SetVCPFeature, MC_MOMENTARY, MC_VCP_CODE_TYPE, PHYSICAL_MONITOR,
};
use windows::Win32::Foundation::HANDLE;

pub const BACKEND_NAME: &str = "win32-ddc";

/// Physical monitor handles from the last enumeration, keyed by token.
/// Stored as raw values since `HANDLE` is not `Send`.
#[derive(Default)]
struct HandleTable {
    next_token: u64,
    handles: HashMap<u64, isize>,
}

/// Dxva2 physical monitors. Handles carry no EDID, so identity comes from
/// the registry correlation, joined by enumeration order.
pub struct Win32DdcBackend {
    table: Mutex<HandleTable>,
}

impl Win32DdcBackend {
    pub fn new() -> Self {
        Self { table: Mutex::new(HandleTable::default()) }
    }

    fn raw_handle(&self, handle: &PhysicalDisplayHandle) -> Result<HANDLE, HardwareError> {
        let token = handle.token.map_or(u64::MAX, |t| t.0);
        self.table
            .lock()
            .handles
            .get(&token)
            .map(|&raw| HANDLE(raw as *mut _))
            .ok_or(HardwareError::UnknownHandle { backend: BACKEND_NAME.into(), token })
    }

    fn release_all(table: &mut HandleTable) {
        for (_, raw) in table.handles.drain() {
            unsafe {
                let _ = DestroyPhysicalMonitor(HANDLE(raw as *mut _));
            }
        }
    }
}

impl Default for Win32DdcBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Win32DdcBackend {
    fn drop(&mut self) {
        Self::release_all(self.table.get_mut());
    }
}

impl DisplayBackend for Win32DdcBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    fn provides_identification(&self) -> bool {
        false
    }

    fn enumerate(&self) -> Result<Vec<PhysicalDisplayHandle>, HardwareError> {
        let mut table = self.table.lock();
        Self::release_all(&mut table);

        let mut result = Vec::new();
        for node in topology::monitors() {
            let mut count = 0u32;
            let physical = unsafe {
                GetNumberOfPhysicalMonitorsFromHMONITOR(node.hmonitor, &mut count).and_then(|_| {
                    let mut monitors = vec![PHYSICAL_MONITOR::default(); count as usize];
                    GetPhysicalMonitorsFromHMONITOR(node.hmonitor, &mut monitors).map(|_| monitors)
                })
            };
            let physical = match physical {
                Ok(monitors) => monitors,
                Err(e) => {
                    lumensync_core::log_warn!("No physical monitors for {}: {}", node.device_name, e);
                    continue;
                }
            };

            for (slot, monitor) in physical.iter().enumerate() {
                let token = table.next_token;
                table.next_token += 1;
                table.handles.insert(token, monitor.hPhysicalMonitor.0 as isize);

                let description = topology::wide_to_string(&monitor.szPhysicalMonitorDescription);
                result.push(PhysicalDisplayHandle {
                    token: Some(HandleToken(token)),
                    backend: BACKEND_NAME.into(),
                    index: result.len(),
                    model_name: (!description.is_empty() && description != "Generic PnP Monitor").then_some(description),
                    display_id: Some(format!("{}\\Monitor{}", node.device_name, slot)),
                    ..PhysicalDisplayHandle::default()
                });
            }
        }

        Ok(result)
    }

    fn read_feature(&self, handle: &PhysicalDisplayHandle, feature: VcpFeature) -> Result<FeatureValue, HardwareError> {
        let raw = self.raw_handle(handle)?;
        let mut kind = MC_VCP_CODE_TYPE::default();
        let mut current = 0u32;
        let mut max = 0u32;

        let ok = unsafe { GetVCPFeatureAndVCPFeatureReply(raw, feature.code(), Some(&mut kind), &mut current, Some(&mut max)) };
        if ok == 0 {
            return Err(HardwareError::Read {
                code: feature.code(),
                reason: windows::core::Error::from_win32().to_string(),
            });
        }
        if kind == MC_MOMENTARY {
            return Ok(FeatureValue::NonContinuous);
        }
        Ok(FeatureValue::Continuous { current, max })
    }

    fn write_feature(&self, handle: &PhysicalDisplayHandle, feature: VcpFeature, raw_value: u32) -> Result<(), HardwareError> {
        let raw = self.raw_handle(handle)?;
        let ok = unsafe { SetVCPFeature(raw, feature.code(), raw_value) };
        if ok == 0 {
            return Err(HardwareError::Write {
                code: feature.code(),
                reason: windows::core::Error::from_win32().to_string(),
            });
        }
        Ok(())
    }

    fn read_raw_identification(&self, _handle: &PhysicalDisplayHandle) -> Option<Vec<u8>> {
        None
    }
}
