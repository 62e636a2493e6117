//! Stable identity for physical displays.
//!
//! Backends hand out handles whose enumeration order changes with every
//! reboot or replug, and the same panel can show up through more than one
//! backend. The resolver turns each handle into an id derived from the
//! strongest identity signal available, in this order:
//!
//! 1. a platform identifier matching a known persistent pattern,
//! 2. manufacturer + model + serial string,
//! 3. manufacturer + model + numeric serial, or the single registry
//!    instance registered for that model,
//! 4. a hash over the leading bytes of the raw identification blob,
//! 5. backend + platform identifier + enumeration index (unstable).
//!
//! Handles from backends without native identification are matched against
//! the OS physical-monitor ordering and registry EDID entries instead, which
//! yields ids from the same family as 2 and 3 so a panel seen through two
//! backends collapses into one entry.

use crate::edid;
use crate::hardware::{CorrelationData, OrdinalMapping, PhysicalDisplayHandle, RegistryEdidEntry};
use crate::log_warn;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

/// Number of leading identification bytes hashed for path 4. Ten bytes end
/// at the manufacturer id, so different models of one vendor would collide.
/// Sixteen cover the header, manufacturer, product code and numeric serial.
pub const IDENTIFICATION_PREFIX_LEN: usize = 16;

const STABLE_PREFIXES: &[&str] = &[r"\\?\display#", r"display\", r"monitor\"];

const UNSTABLE_MARKERS: &[&str] = &[
    r"\\.\display",
    "default_monitor",
    "generic pnp",
    "generic non-pnp",
    "uid0#",
];

const PLACEHOLDER_SERIAL_NUMBERS: &[u32] = &[0, 0x0101_0101, 0xFFFF_FFFF];

/// Which signal produced a stable id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentitySource {
    PlatformId,
    SerialString,
    NumericSerial,
    RegistryCorrelation,
    IdentificationHash,
    Unstable,
}

impl IdentitySource {
    pub fn is_stable(self) -> bool {
        self != IdentitySource::Unstable
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedMonitor {
    pub stable_id: String,
    pub display_name: String,
    pub handle: PhysicalDisplayHandle,
    pub backend: String,
    pub serial_number: Option<String>,
    pub model_name: Option<String>,
    pub manufacturer_id: Option<String>,
    pub source: IdentitySource,
}

impl ResolvedMonitor {
    pub fn has_identification_blob(&self) -> bool {
        self.handle.edid.as_ref().map_or(false, |b| !b.is_empty())
    }
}

/// A resolved monitor together with the outcome of its feature test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestedMonitor {
    pub monitor: ResolvedMonitor,
    pub feature_supported: bool,
}

/// Identity attributes merged from the handle and its EDID.
#[derive(Debug, Default)]
struct Signals {
    manufacturer_id: Option<String>,
    model_id: Option<String>,
    serial: Option<String>,
    serial_number: Option<u32>,
    name: Option<String>,
}

impl Signals {
    fn gather(handle: &PhysicalDisplayHandle) -> Self {
        let parsed = handle.edid.as_deref().and_then(edid::parse);

        let manufacturer_id = handle
            .manufacturer_id
            .as_deref()
            .and_then(clean_token)
            .or_else(|| parsed.as_ref().and_then(|p| p.manufacturer_id.clone()));

        let model_id = handle
            .model_id
            .as_deref()
            .and_then(clean_token)
            .map(|m| strip_manufacturer(&m, manufacturer_id.as_deref()))
            .or_else(|| parsed.as_ref().map(|p| p.product_code.clone()));

        let serial = handle
            .serial
            .as_deref()
            .and_then(clean_serial)
            .or_else(|| parsed.as_ref().and_then(|p| p.serial.as_deref().and_then(clean_serial)));

        let serial_number = handle
            .serial_number
            .or_else(|| parsed.as_ref().and_then(|p| p.serial_number))
            .filter(|n| !PLACEHOLDER_SERIAL_NUMBERS.contains(n));

        let name = handle
            .model_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .or_else(|| parsed.as_ref().and_then(|p| p.monitor_name.clone()));

        Self { manufacturer_id, model_id, serial, serial_number, name }
    }

    fn model_code(&self) -> Option<String> {
        match (&self.manufacturer_id, &self.model_id) {
            (Some(mfg), Some(model)) => Some(format!("{}{}", mfg, model)),
            (None, Some(model)) => Some(model.clone()),
            (Some(mfg), None) => Some(mfg.clone()),
            (None, None) => None,
        }
    }
}

/// Resolves handles into [`ResolvedMonitor`]s. Cheap to construct; the
/// directory builds one per refresh from its backends' capabilities.
#[derive(Debug, Clone, Default)]
pub struct IdentityResolver {
    correlated_backends: HashSet<String>,
}

impl IdentityResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a backend as lacking native identification, so its handles are
    /// identified through OS correlation data.
    pub fn with_correlated_backend(mut self, backend: impl Into<String>) -> Self {
        self.correlated_backends.insert(backend.into());
        self
    }

    /// Resolves every handle. Duplicates across backends are kept.
    pub fn resolve(&self, handles: &[PhysicalDisplayHandle], correlation: &CorrelationData) -> Vec<ResolvedMonitor> {
        handles.iter().map(|h| self.resolve_one(h, correlation)).collect()
    }

    pub fn resolve_one(&self, handle: &PhysicalDisplayHandle, correlation: &CorrelationData) -> ResolvedMonitor {
        let signals = Signals::gather(handle);

        if let Some(id) = handle.display_id.as_deref().and_then(stable_platform_id) {
            return self.build(handle, &signals, id, IdentitySource::PlatformId, None);
        }

        let needs_correlation = self.correlated_backends.contains(&handle.backend)
            && !handle.edid.as_ref().map_or(false, |b| !b.is_empty());
        if needs_correlation {
            if let Some((id, entry)) = correlate_by_ordinal(handle.index, correlation) {
                return self.build(handle, &signals, id, IdentitySource::RegistryCorrelation, Some(entry));
            }
        }

        let model_code = signals.model_code();

        if let (Some(code), Some(serial)) = (&model_code, &signals.serial) {
            let id = serial_id(code, serial);
            return self.build(handle, &signals, id, IdentitySource::SerialString, None);
        }

        if let Some(code) = &model_code {
            if let Some(number) = signals.serial_number {
                let id = format!("sn:{}:#{}", code, number);
                return self.build(handle, &signals, id, IdentitySource::NumericSerial, None);
            }
            if let Some((id, entry)) = correlate_by_model(code, &correlation.registry) {
                return self.build(handle, &signals, id, IdentitySource::RegistryCorrelation, Some(entry));
            }
        }

        if let Some(blob) = handle.edid.as_deref().filter(|b| !b.is_empty()) {
            let prefix = &blob[..blob.len().min(IDENTIFICATION_PREFIX_LEN)];
            let id = format!("raw:{:016x}", fnv1a(prefix));
            return self.build(handle, &signals, id, IdentitySource::IdentificationHash, None);
        }

        let id = format!(
            "unstable:{}:{}:{}",
            handle.backend,
            handle.display_id.as_deref().unwrap_or("-"),
            handle.index
        );
        log_warn!(
            "No persistent identity for display #{} on {}; using unstable id {}",
            handle.index,
            handle.backend,
            id
        );
        self.build(handle, &signals, id, IdentitySource::Unstable, None)
    }

    fn build(
        &self,
        handle: &PhysicalDisplayHandle,
        signals: &Signals,
        stable_id: String,
        source: IdentitySource,
        registry: Option<&RegistryEdidEntry>,
    ) -> ResolvedMonitor {
        let registry_name = registry.and_then(|e| e.parsed_friendly_name.clone());
        let registry_serial = registry.and_then(|e| {
            e.parsed_serial
                .as_deref()
                .and_then(clean_serial)
                .or_else(|| registry_serial_number(e).map(|n| n.to_string()))
        });
        let registry_split = registry.and_then(|e| edid::split_model_code(&e.model_code));

        let manufacturer_id = signals
            .manufacturer_id
            .clone()
            .or_else(|| registry_split.as_ref().map(|(mfg, _)| mfg.clone()));

        let display_name = signals
            .name
            .clone()
            .or_else(|| registry_name.clone())
            .or_else(|| match (&manufacturer_id, &signals.model_id) {
                (Some(mfg), Some(model)) => Some(format!("{} {}", mfg, model)),
                _ => None,
            })
            .unwrap_or_else(|| format!("Display {}", handle.index + 1));

        let serial_number = signals
            .serial
            .clone()
            .or_else(|| signals.serial_number.map(|n| n.to_string()))
            .or(registry_serial);

        ResolvedMonitor {
            stable_id,
            display_name,
            handle: handle.clone(),
            backend: handle.backend.clone(),
            serial_number,
            model_name: signals.name.clone().or(registry_name),
            manufacturer_id,
            source,
        }
    }
}

/// Groups tested monitors by stable id and keeps one per id: a monitor whose
/// feature test succeeded beats one that failed, and among successes one
/// carrying a raw identification blob beats one without. Otherwise the first
/// seen wins.
pub fn deduplicate(tested: Vec<TestedMonitor>) -> BTreeMap<String, TestedMonitor> {
    let mut winners: BTreeMap<String, TestedMonitor> = BTreeMap::new();
    for candidate in tested {
        let replace = winners
            .get(&candidate.monitor.stable_id)
            .map_or(true, |current| preferred_over(&candidate, current));
        if replace {
            winners.insert(candidate.monitor.stable_id.clone(), candidate);
        }
    }
    winners
}

fn preferred_over(candidate: &TestedMonitor, current: &TestedMonitor) -> bool {
    if candidate.feature_supported != current.feature_supported {
        return candidate.feature_supported;
    }
    candidate.feature_supported
        && candidate.monitor.has_identification_blob()
        && !current.monitor.has_identification_blob()
}

/// Returns the normalised id when `raw` looks like a persistent OS identifier.
pub fn stable_platform_id(raw: &str) -> Option<String> {
    let lowered = raw.trim().to_ascii_lowercase();
    if lowered.is_empty() || is_unstable_platform_id(&lowered) {
        return None;
    }
    STABLE_PREFIXES
        .iter()
        .any(|p| lowered.starts_with(p))
        .then(|| format!("pnp:{}", lowered))
}

fn is_unstable_platform_id(lowered: &str) -> bool {
    if UNSTABLE_MARKERS.iter().any(|m| lowered.contains(m)) {
        return true;
    }
    // Bare index tokens such as "display3", "monitor_1" or "2"
    let stripped = lowered
        .trim_start_matches("display")
        .trim_start_matches("monitor")
        .trim_start_matches(|c: char| c == '_' || c == '-' || c == '#' || c == ' ');
    !stripped.is_empty() && stripped.chars().all(|c| c.is_ascii_digit())
}

fn correlate_by_ordinal<'a>(index: usize, correlation: &'a CorrelationData) -> Option<(String, &'a RegistryEdidEntry)> {
    let mut mappings = correlation.ordinals.iter().filter(|m| m.ordinal_index == index);
    let mapping: &OrdinalMapping = mappings.next()?;
    if mappings.next().is_some() {
        return None;
    }
    let entry = correlation.registry.iter().find(|e| {
        e.model_code.eq_ignore_ascii_case(&mapping.model_code)
            && e.instance_path.eq_ignore_ascii_case(&mapping.instance_path)
    })?;
    Some((registry_id(entry), entry))
}

fn correlate_by_model<'a>(model_code: &str, registry: &'a [RegistryEdidEntry]) -> Option<(String, &'a RegistryEdidEntry)> {
    let mut matches = registry.iter().filter(|e| e.model_code.eq_ignore_ascii_case(model_code));
    let entry = matches.next()?;
    if matches.next().is_some() {
        return None;
    }
    Some((registry_id(entry), entry))
}

fn registry_id(entry: &RegistryEdidEntry) -> String {
    let code = normalise_model_code(&entry.model_code);
    if let Some(serial) = entry.parsed_serial.as_deref().and_then(clean_serial) {
        return serial_id(&code, &serial);
    }
    match registry_serial_number(entry) {
        Some(number) => format!("sn:{}:#{}", code, number),
        None => format!("inst:{}:{}", code, entry.instance_path.trim().to_ascii_lowercase()),
    }
}

fn registry_serial_number(entry: &RegistryEdidEntry) -> Option<u32> {
    entry.parsed_serial_number.filter(|n| !PLACEHOLDER_SERIAL_NUMBERS.contains(n))
}

fn serial_id(model_code: &str, serial: &str) -> String {
    format!("sn:{}:{}", model_code, serial)
}

fn normalise_model_code(code: &str) -> String {
    match edid::split_model_code(code) {
        Some((mfg, product)) => format!("{}{}", mfg, product),
        None => code.trim().to_ascii_uppercase(),
    }
}

fn clean_token(raw: &str) -> Option<String> {
    let token: String = raw.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    (!token.is_empty()).then(|| token.to_ascii_uppercase())
}

fn clean_serial(raw: &str) -> Option<String> {
    let serial: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect::<String>()
        .to_ascii_uppercase();
    if serial.is_empty() || serial.chars().all(|c| c == '0') {
        return None;
    }
    Some(serial)
}

fn strip_manufacturer(model: &str, manufacturer: Option<&str>) -> String {
    match manufacturer {
        Some(mfg) if model.len() > mfg.len() && model.starts_with(mfg) => model[mfg.len()..].to_string(),
        _ => model.to_string(),
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    bytes.iter().fold(OFFSET, |hash, b| (hash ^ *b as u64).wrapping_mul(PRIME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edid::EdidIdentity;

    fn dell_edid(serial: Option<&str>) -> Vec<u8> {
        edid::encode(&EdidIdentity {
            manufacturer_id: Some("DEL".into()),
            product_code: "4109".into(),
            serial_number: Some(0x3141_5926),
            serial: serial.map(str::to_string),
            monitor_name: Some("DELL U2415".into()),
        })
    }

    fn handle(backend: &str, index: usize) -> PhysicalDisplayHandle {
        PhysicalDisplayHandle {
            backend: backend.into(),
            index,
            ..Default::default()
        }
    }

    fn tested(monitor: ResolvedMonitor, ok: bool) -> TestedMonitor {
        TestedMonitor { monitor, feature_supported: ok }
    }

    #[test]
    fn resolution_is_deterministic() {
        let resolver = IdentityResolver::new();
        let mut h = handle("ddc", 0);
        h.edid = Some(dell_edid(Some("304NTPC4A088")));
        let none = CorrelationData::default();

        let first = resolver.resolve_one(&h, &none);
        let second = resolver.resolve_one(&h, &none);
        assert_eq!(first.stable_id, second.stable_id);
        assert_eq!(first.stable_id, "sn:DEL4109:304NTPC4A088");
        assert_eq!(first.display_name, "DELL U2415");
        assert_eq!(first.source, IdentitySource::SerialString);
    }

    #[test]
    fn same_serial_through_different_backends_shares_an_id() {
        let resolver = IdentityResolver::new();
        let none = CorrelationData::default();

        let mut via_edid = handle("backend-a", 0);
        via_edid.edid = Some(dell_edid(Some("304NTPC4A088")));

        let mut via_fields = handle("backend-b", 3);
        via_fields.manufacturer_id = Some("DEL".into());
        via_fields.model_id = Some("DEL4109".into());
        via_fields.serial = Some(" 304ntpc4a088 ".into());

        assert_eq!(
            resolver.resolve_one(&via_edid, &none).stable_id,
            resolver.resolve_one(&via_fields, &none).stable_id
        );
    }

    #[test]
    fn stable_platform_id_wins_over_serial() {
        let resolver = IdentityResolver::new();
        let mut h = handle("ddc", 2);
        h.edid = Some(dell_edid(Some("304NTPC4A088")));
        h.display_id = Some(r"\\?\DISPLAY#DEL4109#5&2b4c1f8&0&UID4352#{e6f07b5f-ee97-4a90-b076-33f57bf4eaa7}".into());

        let resolved = resolver.resolve_one(&h, &CorrelationData::default());
        assert_eq!(resolved.source, IdentitySource::PlatformId);
        assert!(resolved.stable_id.starts_with(r"pnp:\\?\display#del4109#"));
    }

    #[test]
    fn unstable_platform_ids_are_ignored() {
        assert_eq!(stable_platform_id(r"\\.\DISPLAY1\Monitor0"), None);
        assert_eq!(stable_platform_id("Default_Monitor"), None);
        assert_eq!(stable_platform_id("display2"), None);
        assert_eq!(stable_platform_id("3"), None);
        assert_eq!(stable_platform_id(r"MONITOR\Default_Monitor\{4d36e96e}\0001"), None);
        assert!(stable_platform_id(r"MONITOR\GSM5B09\{4d36e96e-e325-11ce-bfc1-08002be10318}\0002").is_some());
    }

    #[test]
    fn numeric_serial_used_without_serial_string() {
        let resolver = IdentityResolver::new();
        let mut h = handle("ddc", 0);
        h.edid = Some(dell_edid(None));
        let resolved = resolver.resolve_one(&h, &CorrelationData::default());
        assert_eq!(resolved.stable_id, format!("sn:DEL4109:#{}", 0x3141_5926u32));
        assert_eq!(resolved.source, IdentitySource::NumericSerial);
    }

    #[test]
    fn single_registry_instance_resolves_model_without_serials() {
        let resolver = IdentityResolver::new();
        let mut h = handle("wmi", 0);
        h.manufacturer_id = Some("GSM".into());
        h.model_id = Some("5B09".into());
        let correlation = CorrelationData {
            ordinals: vec![],
            registry: vec![RegistryEdidEntry {
                model_code: "GSM5B09".into(),
                instance_path: "5&1a2b3c&0&UID256".into(),
                parsed_serial: None,
                parsed_serial_number: None,
                parsed_friendly_name: Some("LG ULTRAFINE".into()),
            }],
        };
        let resolved = resolver.resolve_one(&h, &correlation);
        assert_eq!(resolved.stable_id, "inst:GSM5B09:5&1a2b3c&0&uid256");
        assert_eq!(resolved.display_name, "LG ULTRAFINE");
    }

    #[test]
    fn ambiguous_registry_instances_fall_through() {
        let resolver = IdentityResolver::new();
        let mut h = handle("wmi", 0);
        h.manufacturer_id = Some("GSM".into());
        h.model_id = Some("5B09".into());
        let entry = |inst: &str| RegistryEdidEntry {
            model_code: "GSM5B09".into(),
            instance_path: inst.into(),
            parsed_serial: None,
            parsed_serial_number: None,
            parsed_friendly_name: None,
        };
        let correlation = CorrelationData { ordinals: vec![], registry: vec![entry("a"), entry("b")] };
        let resolved = resolver.resolve_one(&h, &correlation);
        assert_eq!(resolved.source, IdentitySource::Unstable);
        assert_eq!(resolved.stable_id, "unstable:wmi:-:0");
    }

    #[test]
    fn registry_correlation_matches_edid_backed_id() {
        let resolver = IdentityResolver::new().with_correlated_backend("win32");
        let mut bare = handle("win32", 1);
        bare.display_id = Some(r"\\.\DISPLAY2\Monitor0".into());
        let correlation = CorrelationData {
            ordinals: vec![
                OrdinalMapping { ordinal_index: 0, model_code: "GSM5B09".into(), instance_path: "x".into() },
                OrdinalMapping { ordinal_index: 1, model_code: "DEL4109".into(), instance_path: "5&2b4c1f8&0&UID4352".into() },
            ],
            registry: vec![RegistryEdidEntry {
                model_code: "DEL4109".into(),
                instance_path: "5&2B4C1F8&0&UID4352".into(),
                parsed_serial: Some("304NTPC4A088".into()),
                parsed_serial_number: Some(0x3141_5926),
                parsed_friendly_name: Some("DELL U2415".into()),
            }],
        };
        let correlated = resolver.resolve_one(&bare, &correlation);
        assert_eq!(correlated.source, IdentitySource::RegistryCorrelation);
        assert_eq!(correlated.display_name, "DELL U2415");
        assert_eq!(correlated.manufacturer_id.as_deref(), Some("DEL"));

        let mut rich = handle("edid-backend", 0);
        rich.edid = Some(dell_edid(Some("304NTPC4A088")));
        assert_eq!(correlated.stable_id, resolver.resolve_one(&rich, &correlation).stable_id);
    }

    fn lg_edid(serial_number: u32) -> Vec<u8> {
        edid::encode(&EdidIdentity {
            manufacturer_id: Some("GSM".into()),
            product_code: "5B09".into(),
            serial_number: Some(serial_number),
            serial: None,
            monitor_name: Some("LG ULTRAFINE".into()),
        })
    }

    fn registry_entry_from(blob: &[u8], instance_path: &str) -> RegistryEdidEntry {
        let parsed = edid::parse(blob).unwrap();
        RegistryEdidEntry {
            model_code: "GSM5B09".into(),
            instance_path: instance_path.into(),
            parsed_serial: parsed.serial.clone(),
            parsed_serial_number: parsed.serial_number,
            parsed_friendly_name: parsed.monitor_name.clone(),
        }
    }

    fn twin_correlation(blob: &[u8]) -> CorrelationData {
        CorrelationData {
            ordinals: vec![
                OrdinalMapping { ordinal_index: 0, model_code: "GSM5B09".into(), instance_path: "5&aa&0&UID1".into() },
                OrdinalMapping { ordinal_index: 1, model_code: "GSM5B09".into(), instance_path: "5&bb&0&UID2".into() },
            ],
            registry: vec![registry_entry_from(blob, "5&aa&0&UID1"), registry_entry_from(blob, "5&bb&0&UID2")],
        }
    }

    #[test]
    fn twins_with_placeholder_serial_stay_separate() {
        let resolver = IdentityResolver::new().with_correlated_backend("win32");
        let correlation = twin_correlation(&lg_edid(0x0101_0101));

        let first = resolver.resolve_one(&handle("win32", 0), &correlation);
        let second = resolver.resolve_one(&handle("win32", 1), &correlation);
        assert_eq!(first.stable_id, "inst:GSM5B09:5&aa&0&uid1");
        assert_eq!(second.stable_id, "inst:GSM5B09:5&bb&0&uid2");
        assert_eq!(first.serial_number, None);

        let kept = deduplicate(vec![tested(first, true), tested(second, true)]);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn numeric_serial_through_registry_matches_edid_id() {
        let resolver = IdentityResolver::new().with_correlated_backend("win32");
        let blob = lg_edid(12345);
        let correlation = twin_correlation(&blob);

        let correlated = resolver.resolve_one(&handle("win32", 0), &correlation);
        let mut rich = handle("edid-backend", 0);
        rich.edid = Some(blob);
        let direct = resolver.resolve_one(&rich, &CorrelationData::default());

        assert_eq!(direct.stable_id, "sn:GSM5B09:#12345");
        assert_eq!(correlated.stable_id, direct.stable_id);
        assert_eq!(correlated.serial_number.as_deref(), Some("12345"));
    }

    #[test]
    fn headerless_blob_falls_back_to_hash() {
        let resolver = IdentityResolver::new();
        let mut h = handle("ddc", 4);
        h.edid = Some(b"(prot(monitor)type(lcd)model(X1))".to_vec());
        let a = resolver.resolve_one(&h, &CorrelationData::default());
        h.index = 0;
        let b = resolver.resolve_one(&h, &CorrelationData::default());
        assert_eq!(a.source, IdentitySource::IdentificationHash);
        assert_eq!(a.stable_id, b.stable_id);
    }

    #[test]
    fn hash_prefix_separates_models_of_one_vendor() {
        let resolver = IdentityResolver::new();
        let blob = |product: &str| {
            edid::encode(&EdidIdentity {
                manufacturer_id: Some("DEL".into()),
                product_code: product.into(),
                serial_number: None,
                serial: None,
                monitor_name: None,
            })
        };
        let mut first = handle("ddc", 0);
        first.edid = Some(blob("4109"));
        let mut second = handle("ddc", 1);
        second.edid = Some(blob("A0C1"));

        let a = resolver.resolve_one(&first, &CorrelationData::default());
        let b = resolver.resolve_one(&second, &CorrelationData::default());
        assert_eq!(a.source, IdentitySource::IdentificationHash);
        assert_ne!(a.stable_id, b.stable_id);
    }

    #[test]
    fn fallback_is_flagged_unstable() {
        let resolver = IdentityResolver::new();
        let mut h = handle("ddc", 2);
        h.display_id = Some(r"\\.\DISPLAY3".into());
        let resolved = resolver.resolve_one(&h, &CorrelationData::default());
        assert!(!resolved.source.is_stable());
        assert_eq!(resolved.stable_id, r"unstable:ddc:\\.\DISPLAY3:2");
        assert_eq!(resolved.display_name, "Display 3");
    }

    #[test]
    fn dedup_prefers_supported_then_blob() {
        let resolver = IdentityResolver::new();
        let none = CorrelationData::default();

        let mut with_blob = handle("a", 0);
        with_blob.edid = Some(dell_edid(Some("304NTPC4A088")));
        let mut without_blob = handle("b", 1);
        without_blob.manufacturer_id = Some("DEL".into());
        without_blob.model_id = Some("4109".into());
        without_blob.serial = Some("304NTPC4A088".into());

        let rich = resolver.resolve_one(&with_blob, &none);
        let bare = resolver.resolve_one(&without_blob, &none);
        assert_eq!(rich.stable_id, bare.stable_id);

        let out = deduplicate(vec![tested(rich.clone(), false), tested(bare.clone(), true)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[&bare.stable_id].monitor.backend, "b");

        let out = deduplicate(vec![tested(bare.clone(), true), tested(rich.clone(), true)]);
        assert_eq!(out[&rich.stable_id].monitor.backend, "a");

        let out = deduplicate(vec![tested(rich.clone(), true), tested(bare, true)]);
        assert_eq!(out[&rich.stable_id].monitor.backend, "a");
    }
}
