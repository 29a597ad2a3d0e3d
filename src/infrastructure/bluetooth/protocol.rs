//! GATT UUID Conventions
//!
//! Canonical UUID form used as map keys throughout the entity model, and the
//! Bluetooth SIG assigned-number names for the services and characteristics
//! a central is most likely to meet.

use crate::error::{Error, Result};

/// Trailing 96 bits of the Bluetooth base UUID `0000xxxx-0000-1000-8000-00805f9b34fb`
pub const BASE_UUID_SUFFIX: &str = "00001000800000805f9b34fb";

/// Characteristic User Description descriptor
pub const USER_DESCRIPTION_UUID: &str = "0x2901";

/// Normalize a raw UUID into its canonical `0x`-prefixed lowercase form.
///
/// 128-bit UUIDs built on the Bluetooth base UUID collapse to their 16-bit
/// (or 32-bit) short form; anything else keeps all 32 hex digits. Hyphens
/// and an existing `0x` prefix are accepted, so normalizing a canonical
/// UUID returns it unchanged.
///
/// ```text
/// "180F"                                 -> "0x180f"
/// "0000180f-0000-1000-8000-00805f9b34fb" -> "0x180f"
/// "4f63756c-7573-2054-6872-65656d6f7465" -> "0x4f63756c75732054687265656d6f7465"
/// ```
pub fn normalize_uuid(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let hex: String = body
        .chars()
        .filter(|c| *c != '-')
        .map(|c| c.to_ascii_lowercase())
        .collect();

    if hex.is_empty() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(Error::invalid(format!("malformed UUID: {:?}", raw)));
    }

    let short = match hex.len() {
        4 => hex.as_str(),
        8 => hex.strip_prefix("0000").unwrap_or(&hex),
        32 if hex.ends_with(BASE_UUID_SUFFIX) => {
            let head = &hex[..8];
            head.strip_prefix("0000").unwrap_or(head)
        }
        32 => hex.as_str(),
        n => {
            return Err(Error::invalid(format!(
                "UUID {:?} has {} hex digits (expected 4, 8 or 32)",
                raw, n
            )))
        }
    };

    Ok(format!("0x{}", short))
}

/// Validate a caller-supplied UUID that must already carry the `0x` prefix,
/// returning its canonical spelling.
pub fn canonical_uuid(uuid: &str) -> Result<String> {
    if !uuid.starts_with("0x") {
        return Err(Error::invalid(format!(
            "UUID {:?} must be a string starting with 0x",
            uuid
        )));
    }
    normalize_uuid(uuid)
}

/// 16-bit assigned number of a canonical short UUID.
pub fn short_uuid(canonical: &str) -> Option<u16> {
    let hex = canonical.strip_prefix("0x")?;
    if hex.len() != 4 {
        return None;
    }
    u16::from_str_radix(hex, 16).ok()
}

/// SIG name of a service, if the UUID is an assigned number we know.
pub fn service_name(canonical: &str) -> Option<&'static str> {
    let name = match short_uuid(canonical)? {
        0x1800 => "genericAccess",
        0x1801 => "genericAttribute",
        0x1802 => "immediateAlert",
        0x1803 => "linkLoss",
        0x1804 => "txPower",
        0x1805 => "currentTime",
        0x1809 => "healthThermometer",
        0x180a => "deviceInformation",
        0x180d => "heartRate",
        0x180f => "battery",
        0x1810 => "bloodPressure",
        0x1812 => "humanInterfaceDevice",
        0x1816 => "cyclingSpeedAndCadence",
        0x181a => "environmentalSensing",
        _ => return None,
    };
    Some(name)
}

/// SIG name of a characteristic, if the UUID is an assigned number we know.
pub fn characteristic_name(canonical: &str) -> Option<&'static str> {
    let name = match short_uuid(canonical)? {
        0x2a00 => "deviceName",
        0x2a01 => "appearance",
        0x2a04 => "peripheralPreferredConnectionParameters",
        0x2a05 => "serviceChanged",
        0x2a06 => "alertLevel",
        0x2a07 => "txPowerLevel",
        0x2a19 => "batteryLevel",
        0x2a1c => "temperatureMeasurement",
        0x2a24 => "modelNumberString",
        0x2a25 => "serialNumberString",
        0x2a26 => "firmwareRevisionString",
        0x2a27 => "hardwareRevisionString",
        0x2a28 => "softwareRevisionString",
        0x2a29 => "manufacturerNameString",
        0x2a2b => "currentTime",
        0x2a37 => "heartRateMeasurement",
        0x2a38 => "bodySensorLocation",
        0x2a6d => "pressure",
        0x2a6e => "temperature",
        0x2a6f => "humidity",
        _ => return None,
    };
    Some(name)
}
