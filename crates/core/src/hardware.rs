//! Narrow interface to the platform: display enumeration, VCP feature
//! access, and the optional OS correlation tables used for identity.

use crate::error::HardwareError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A continuous VCP feature the engine keeps in sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VcpFeature {
    Brightness,
    Contrast,
}

impl VcpFeature {
    pub fn code(self) -> u8 {
        match self {
            VcpFeature::Brightness => 0x10,
            VcpFeature::Contrast => 0x12,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            VcpFeature::Brightness => "brightness",
            VcpFeature::Contrast => "contrast",
        }
    }
}

impl fmt::Display for VcpFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (0x{:02X})", self.name(), self.code())
    }
}

/// Opaque reference into a backend's own handle table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleToken(pub u64);

/// One display as surfaced by one backend during one enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PhysicalDisplayHandle {
    pub token: Option<HandleToken>,
    pub backend: String,
    /// Position in this backend's enumeration. Not stable across reboots.
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex_bytes")]
    pub edid: Option<Vec<u8>>,
    pub manufacturer_id: Option<String>,
    pub model_id: Option<String>,
    pub model_name: Option<String>,
    pub serial: Option<String>,
    pub serial_number: Option<u32>,
    /// Raw platform identifier, e.g. a device interface path.
    pub display_id: Option<String>,
}

/// Result of reading a VCP feature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeatureValue {
    Continuous { current: u32, max: u32 },
    NonContinuous,
}

impl FeatureValue {
    pub fn continuous(self) -> Option<(u32, u32)> {
        match self {
            FeatureValue::Continuous { current, max } => Some((current, max)),
            FeatureValue::NonContinuous => None,
        }
    }
}

/// Hardware collaborator. Calls may take tens of milliseconds and may fail.
pub trait DisplayBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Whether handles from this backend carry their own identification
    /// (EDID, serials). When false, identity is resolved via OS correlation.
    fn provides_identification(&self) -> bool;

    fn enumerate(&self) -> Result<Vec<PhysicalDisplayHandle>, HardwareError>;

    fn read_feature(&self, handle: &PhysicalDisplayHandle, feature: VcpFeature) -> Result<FeatureValue, HardwareError>;

    fn write_feature(&self, handle: &PhysicalDisplayHandle, feature: VcpFeature, raw_value: u32) -> Result<(), HardwareError>;

    fn read_raw_identification(&self, handle: &PhysicalDisplayHandle) -> Option<Vec<u8>>;
}

/// Position of a display in the OS physical-monitor ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrdinalMapping {
    pub ordinal_index: usize,
    /// PnP model code such as `DEL4109`.
    pub model_code: String,
    pub instance_path: String,
}

/// Registry EDID entry under a (model code, instance path) key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEdidEntry {
    pub model_code: String,
    pub instance_path: String,
    pub parsed_serial: Option<String>,
    /// Numeric serial from the EDID header, kept apart from the descriptor
    /// string so ids match those built from the EDID directly.
    pub parsed_serial_number: Option<u32>,
    pub parsed_friendly_name: Option<String>,
}

/// OS-level tables joined by index to identify displays from backends that
/// cannot identify them natively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CorrelationData {
    pub ordinals: Vec<OrdinalMapping>,
    pub registry: Vec<RegistryEdidEntry>,
}

impl CorrelationData {
    pub fn is_empty(&self) -> bool {
        self.ordinals.is_empty() && self.registry.is_empty()
    }
}

pub trait OsCorrelation: Send + Sync {
    fn physical_monitor_ordinals(&self) -> Result<Vec<OrdinalMapping>, HardwareError>;

    fn registry_edid_entries(&self) -> Result<Vec<RegistryEdidEntry>, HardwareError>;
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => serializer.serialize_str(&b.iter().map(|x| format!("{:02X}", x)).collect::<String>()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error> {
        let text: Option<String> = Option::deserialize(deserializer)?;
        let Some(text) = text else { return Ok(None) };
        if text.len() % 2 != 0 || !text.is_ascii() {
            return Err(serde::de::Error::custom("malformed hex string"));
        }
        (0..text.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&text[i..i + 2], 16).map_err(serde::de::Error::custom))
            .collect::<Result<Vec<u8>, D::Error>>()
            .map(Some)
    }
}
