//! Minimal EDID 1.x decoding: just the identity fields.

const HEADER: [u8; 8] = [0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00];
const BASE_BLOCK_LEN: usize = 128;
const DESCRIPTOR_START: usize = 54;
const DESCRIPTOR_LEN: usize = 18;
const DESCRIPTOR_END: usize = 126;

const TAG_SERIAL: u8 = 0xFF;
const TAG_MONITOR_NAME: u8 = 0xFC;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EdidIdentity {
    /// Three-letter PnP manufacturer id, e.g. `DEL`.
    pub manufacturer_id: Option<String>,
    /// Product code as four upper-case hex digits, e.g. `4109`.
    pub product_code: String,
    /// Numeric serial from the base block; zero is reported as absent.
    pub serial_number: Option<u32>,
    /// Serial string descriptor (0xFF).
    pub serial: Option<String>,
    /// Monitor name descriptor (0xFC).
    pub monitor_name: Option<String>,
}

impl EdidIdentity {
    /// PnP model code as used by the registry, e.g. `DEL4109`.
    pub fn model_code(&self) -> Option<String> {
        self.manufacturer_id
            .as_ref()
            .map(|mfg| format!("{}{}", mfg, self.product_code))
    }
}

pub fn has_header(edid: &[u8]) -> bool {
    edid.len() >= HEADER.len() && edid[..HEADER.len()] == HEADER
}

/// Decodes the identity fields of a base EDID block. Returns `None` when the
/// blob is too short or lacks the fixed header.
pub fn parse(edid: &[u8]) -> Option<EdidIdentity> {
    if edid.len() < BASE_BLOCK_LEN || !has_header(edid) {
        return None;
    }

    let product = u16::from_le_bytes([edid[10], edid[11]]);
    let serial_number = u32::from_le_bytes([edid[12], edid[13], edid[14], edid[15]]);

    let mut identity = EdidIdentity {
        manufacturer_id: decode_manufacturer(edid[8], edid[9]),
        product_code: format!("{:04X}", product),
        serial_number: (serial_number != 0).then_some(serial_number),
        serial: None,
        monitor_name: None,
    };

    let mut offset = DESCRIPTOR_START;
    while offset + DESCRIPTOR_LEN <= DESCRIPTOR_END {
        let block = &edid[offset..offset + DESCRIPTOR_LEN];
        offset += DESCRIPTOR_LEN;

        // Display descriptors start with a zero pixel clock
        if block[0] != 0 || block[1] != 0 {
            continue;
        }
        let text = descriptor_text(&block[5..]);
        if text.is_empty() {
            continue;
        }
        match block[3] {
            TAG_SERIAL => identity.serial = Some(text),
            TAG_MONITOR_NAME => identity.monitor_name = Some(text),
            _ => {}
        }
    }

    Some(identity)
}

/// Splits a PnP model code (`DEL4109`) into manufacturer and product parts.
pub fn split_model_code(model_code: &str) -> Option<(String, String)> {
    let code = model_code.trim();
    if code.len() < 4 || !code.is_ascii() {
        return None;
    }
    let (mfg, product) = code.split_at(3);
    if !mfg.chars().all(|c| c.is_ascii_alphabetic()) {
        return None;
    }
    Some((mfg.to_ascii_uppercase(), product.to_ascii_uppercase()))
}

fn decode_manufacturer(hi: u8, lo: u8) -> Option<String> {
    let packed = u16::from_be_bytes([hi, lo]);
    let letters = [(packed >> 10) & 0x1F, (packed >> 5) & 0x1F, packed & 0x1F];
    if letters.iter().any(|&l| l == 0 || l > 26) {
        return None;
    }
    Some(letters.iter().map(|&l| (b'A' + l as u8 - 1) as char).collect())
}

fn descriptor_text(bytes: &[u8]) -> String {
    let raw: Vec<u8> = bytes
        .iter()
        .copied()
        .take_while(|&b| b != 0x0A && b != 0x00)
        .collect();
    String::from_utf8_lossy(&raw).trim().to_string()
}

/// Encodes identity fields into a base EDID block with a valid checksum.
/// Used by simulated backends; timing data is left zeroed.
pub fn encode(identity: &EdidIdentity) -> Vec<u8> {
    let mut edid = vec![0u8; BASE_BLOCK_LEN];
    edid[..HEADER.len()].copy_from_slice(&HEADER);

    if let Some(letters) = identity.manufacturer_id.as_deref().and_then(encode_manufacturer) {
        edid[8..10].copy_from_slice(&letters.to_be_bytes());
    }
    let product = u16::from_str_radix(&identity.product_code, 16).unwrap_or(0);
    edid[10..12].copy_from_slice(&product.to_le_bytes());
    edid[12..16].copy_from_slice(&identity.serial_number.unwrap_or(0).to_le_bytes());
    edid[18] = 1;
    edid[19] = 4;

    // Slot 0 holds a detailed timing, so its pixel clock is non-zero
    edid[DESCRIPTOR_START] = 0x01;
    let mut slot = 1;
    for (tag, text) in [(TAG_SERIAL, &identity.serial), (TAG_MONITOR_NAME, &identity.monitor_name)] {
        let Some(text) = text else { continue };
        let start = DESCRIPTOR_START + slot * DESCRIPTOR_LEN;
        edid[start + 3] = tag;
        let mut body = [0x20u8; DESCRIPTOR_LEN - 5];
        let bytes = text.as_bytes();
        let len = bytes.len().min(body.len());
        body[..len].copy_from_slice(&bytes[..len]);
        if len < body.len() {
            body[len] = 0x0A;
        }
        edid[start + 5..start + DESCRIPTOR_LEN].copy_from_slice(&body);
        slot += 1;
    }

    let sum = edid[..BASE_BLOCK_LEN - 1].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    edid[BASE_BLOCK_LEN - 1] = 0u8.wrapping_sub(sum);
    edid
}

fn encode_manufacturer(mfg: &str) -> Option<u16> {
    let bytes = mfg.as_bytes();
    if bytes.len() != 3 || !bytes.iter().all(|b| b.is_ascii_uppercase()) {
        return None;
    }
    let l = |b: u8| (b - b'A' + 1) as u16;
    Some((l(bytes[0]) << 10) | (l(bytes[1]) << 5) | l(bytes[2]))
}
