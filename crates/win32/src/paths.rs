//! Parsing of Windows monitor device paths.

/// Splits a monitor device interface path such as
/// `\\?\DISPLAY#DEL4109#5&2b4c1f8&0&UID4352#{e6f07b5f-...}` into its PnP
/// model code and instance path.
pub fn parse_interface_path(path: &str) -> Option<(String, String)> {
    let mut parts = path.trim().split('#');
    let bus = parts.next()?;
    if !bus.to_ascii_uppercase().ends_with("DISPLAY") {
        return None;
    }
    let model = parts.next().filter(|m| !m.is_empty())?;
    let instance = parts.next().filter(|i| !i.is_empty())?;
    Some((model.to_ascii_uppercase(), instance.to_string()))
}

/// Registry key of a monitor instance, relative to `HKLM`.
pub fn registry_instance_key(model_code: &str, instance_path: &str) -> String {
    format!(
        "SYSTEM\\CurrentControlSet\\Enum\\DISPLAY\\{}\\{}\\Device Parameters",
        model_code, instance_path
    )
}
