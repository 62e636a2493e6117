//! GDI monitor enumeration shared by the DDC backend and the registry
//! correlation, so both see displays in the same order.

use windows::{
    core::{BOOL, PCWSTR},
    Win32::Foundation::{LPARAM, RECT},
    Win32::Graphics::Gdi::{
        EnumDisplayDevicesW, EnumDisplayMonitors, GetMonitorInfoW, DISPLAY_DEVICEW, HDC, HMONITOR, MONITORINFOEXW,
    },
};

/// Asks `EnumDisplayDevicesW` for device interface paths instead of
/// registry-style device ids.
const EDD_GET_DEVICE_INTERFACE_NAME: u32 = 0x0000_0001;

/// One GDI monitor and the monitor devices attached to it.
pub struct MonitorNode {
    pub hmonitor: HMONITOR,
    /// GDI device name such as `\\.\DISPLAY1`.
    pub device_name: String,
    /// Interface paths of the attached monitors, in adapter order.
    pub interface_paths: Vec<String>,
}

pub fn monitors() -> Vec<MonitorNode> {
    let mut handles: Vec<HMONITOR> = Vec::new();

    unsafe {
        let _ = EnumDisplayMonitors(
            None,
            None,
            Some(monitor_enum_proc),
            LPARAM(&mut handles as *mut Vec<HMONITOR> as isize),
        );
    }

    handles
        .into_iter()
        .filter_map(|hmonitor| {
            let device_name = device_name(hmonitor)?;
            let interface_paths = interface_paths(&device_name);
            Some(MonitorNode { hmonitor, device_name, interface_paths })
        })
        .collect()
}

unsafe extern "system" fn monitor_enum_proc(hmonitor: HMONITOR, _hdc: HDC, _rect: *mut RECT, lparam: LPARAM) -> BOOL {
    let handles = &mut *(lparam.0 as *mut Vec<HMONITOR>);
    handles.push(hmonitor);
    true.into()
}

fn device_name(hmonitor: HMONITOR) -> Option<String> {
    unsafe {
        let mut info: MONITORINFOEXW = std::mem::zeroed();
        info.monitorInfo.cbSize = std::mem::size_of::<MONITORINFOEXW>() as u32;
        if !GetMonitorInfoW(hmonitor, &mut info as *mut _ as *mut _).as_bool() {
            return None;
        }
        Some(wide_to_string(&info.szDevice))
    }
}

fn interface_paths(device_name: &str) -> Vec<String> {
    let wide: Vec<u16> = device_name.encode_utf16().chain(std::iter::once(0)).collect();
    let mut paths = Vec::new();

    for index in 0.. {
        let mut device: DISPLAY_DEVICEW = unsafe { std::mem::zeroed() };
        device.cb = std::mem::size_of::<DISPLAY_DEVICEW>() as u32;
        let found = unsafe {
            EnumDisplayDevicesW(PCWSTR(wide.as_ptr()), index, &mut device, EDD_GET_DEVICE_INTERFACE_NAME).as_bool()
        };
        if !found {
            break;
        }
        paths.push(wide_to_string(&device.DeviceID));
    }

    paths
}

pub fn wide_to_string(wide: &[u16]) -> String {
    let len = wide.iter().position(|&c| c == 0).unwrap_or(wide.len());
    String::from_utf16_lossy(&wide[..len])
}
