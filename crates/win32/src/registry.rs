//! OS correlation tables: physical-monitor ordering and registry EDIDs.

use crate::paths::{parse_interface_path, registry_instance_key};
use crate::topology;
use lumensync_core::edid;
use lumensync_core::{HardwareError, OrdinalMapping, OsCorrelation, RegistryEdidEntry};
use windows::core::{HSTRING, PWSTR};
use windows::Win32::Devices::Display::GetNumberOfPhysicalMonitorsFromHMONITOR;
use windows::Win32::Foundation::ERROR_SUCCESS;
use windows::Win32::System::Registry::{
    RegCloseKey, RegEnumKeyExW, RegOpenKeyExW, RegQueryValueExW, HKEY, HKEY_LOCAL_MACHINE, KEY_READ, REG_VALUE_TYPE,
};

const DISPLAY_ENUM_KEY: &str = "SYSTEM\\CurrentControlSet\\Enum\\DISPLAY";

pub struct RegistryCorrelation;

impl OsCorrelation for RegistryCorrelation {
    /// Walks monitors in the same order as the DDC backend, pairing every
    /// physical monitor slot with the interface path of the same position.
    fn physical_monitor_ordinals(&self) -> Result<Vec<OrdinalMapping>, HardwareError> {
        let mut ordinals = Vec::new();
        let mut ordinal_index = 0;

        for node in topology::monitors() {
            let mut count = 0u32;
            if unsafe { GetNumberOfPhysicalMonitorsFromHMONITOR(node.hmonitor, &mut count) }.is_err() {
                continue;
            }
            for slot in 0..count as usize {
                if let Some((model_code, instance_path)) =
                    node.interface_paths.get(slot).and_then(|p| parse_interface_path(p))
                {
                    ordinals.push(OrdinalMapping { ordinal_index, model_code, instance_path });
                }
                ordinal_index += 1;
            }
        }

        Ok(ordinals)
    }

    fn registry_edid_entries(&self) -> Result<Vec<RegistryEdidEntry>, HardwareError> {
        let root = RegKey::open(HKEY_LOCAL_MACHINE, DISPLAY_ENUM_KEY)
            .ok_or_else(|| HardwareError::Correlation(format!("cannot open HKLM\\{}", DISPLAY_ENUM_KEY)))?;

        let mut entries = Vec::new();
        for model_code in root.subkeys() {
            let Some(model_key) = root.child(&model_code) else { continue };
            for instance_path in model_key.subkeys() {
                let key = registry_instance_key(&model_code, &instance_path);
                let Some(blob) = RegKey::open(HKEY_LOCAL_MACHINE, &key).and_then(|k| k.binary_value("EDID")) else {
                    continue;
                };
                let Some(parsed) = edid::parse(&blob) else { continue };

                entries.push(RegistryEdidEntry {
                    model_code: model_code.to_ascii_uppercase(),
                    instance_path,
                    parsed_serial: parsed.serial.clone(),
                    parsed_serial_number: parsed.serial_number,
                    parsed_friendly_name: parsed.monitor_name.clone(),
                });
            }
        }

        Ok(entries)
    }
}

/// Read-only registry key closed on drop.
struct RegKey {
    hkey: HKEY,
}

impl RegKey {
    fn open(parent: HKEY, path: &str) -> Option<Self> {
        let subkey = HSTRING::from(path);
        let mut hkey = HKEY::default();
        let result = unsafe { RegOpenKeyExW(parent, &subkey, None, KEY_READ, &mut hkey) };
        (result == ERROR_SUCCESS).then_some(Self { hkey })
    }

    fn child(&self, name: &str) -> Option<Self> {
        Self::open(self.hkey, name)
    }

    fn subkeys(&self) -> Vec<String> {
        let mut names = Vec::new();
        for index in 0.. {
            let mut buffer = [0u16; 256];
            let mut len = buffer.len() as u32;
            let result = unsafe {
                RegEnumKeyExW(
                    self.hkey,
                    index,
                    Some(PWSTR(buffer.as_mut_ptr())),
                    &mut len,
                    None,
                    None,
                    None,
                    None,
                )
            };
            if result != ERROR_SUCCESS {
                break;
            }
            names.push(String::from_utf16_lossy(&buffer[..len as usize]));
        }
        names
    }

    fn binary_value(&self, name: &str) -> Option<Vec<u8>> {
        let value_name = HSTRING::from(name);
        let mut value_type = REG_VALUE_TYPE::default();
        let mut buffer = vec![0u8; 512];
        let mut size = buffer.len() as u32;

        let result = unsafe {
            RegQueryValueExW(
                self.hkey,
                &value_name,
                None,
                Some(&mut value_type),
                Some(buffer.as_mut_ptr()),
                Some(&mut size),
            )
        };
        if result != ERROR_SUCCESS {
            return None;
        }
        buffer.truncate(size as usize);
        Some(buffer)
    }
}

impl Drop for RegKey {
    fn drop(&mut self) {
        unsafe {
            let _ = RegCloseKey(self.hkey);
        }
    }
}
