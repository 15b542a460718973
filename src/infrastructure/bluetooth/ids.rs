//! Identifier formats shared by the platform backends
//!
//! Devices are identified by their MAC address (`D4:36:39:6F:A1:02`),
//! services and characteristics by lowercase hyphenated 128-bit UUIDs.

use crate::domain::models::DeviceId;
use crate::infrastructure::bluetooth::error::BleError;

/// Bluetooth base UUID, used to expand 16- and 32-bit short forms.
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Format a 48-bit Bluetooth address as a device identifier.
pub fn format_address(address: u64) -> DeviceId {
    let bytes = address.to_be_bytes();
    let text = bytes[2..]
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":");
    DeviceId::new(text)
}

/// Inverse of [`format_address`]. Separators are optional.
pub fn parse_address(id: &DeviceId) -> Result<u64, BleError> {
    let hex: String = id
        .as_str()
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .collect();
    if hex.len() != 12 {
        return Err(BleError::InvalidDeviceId);
    }
    u64::from_str_radix(&hex, 16).map_err(|_| BleError::InvalidDeviceId)
}

/// Parse a UUID in full, 16-bit or 32-bit form.
pub fn parse_uuid(text: &str) -> Option<u128> {
    let hex = text.trim().replace('-', "");
    match hex.len() {
        4 | 8 => u32::from_str_radix(&hex, 16)
            .ok()
            .map(|short| BASE_UUID | (u128::from(short) << 96)),
        32 => u128::from_str_radix(&hex, 16).ok(),
        _ => None,
    }
}

pub fn format_uuid(uuid: u128) -> String {
    let hex = format!("{:032x}", uuid);
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_round_trip() {
        let id = format_address(0xD436_396F_A102);
        assert_eq!(id.as_str(), "D4:36:39:6F:A1:02");
        assert_eq!(parse_address(&id), Ok(0xD436_396F_A102));
    }

    #[test]
    fn test_parse_address_rejects_garbage() {
        assert_eq!(
            parse_address(&DeviceId::new("")),
            Err(BleError::InvalidDeviceId)
        );
        assert_eq!(
            parse_address(&DeviceId::new("ZZ:36:39:6F:A1:02")),
            Err(BleError::InvalidDeviceId)
        );
    }

    #[test]
    fn test_short_uuids_expand_to_base() {
        let battery = parse_uuid("180f").unwrap();
        assert_eq!(format_uuid(battery), "0000180f-0000-1000-8000-00805f9b34fb");
        assert_eq!(
            parse_uuid("0000180F-0000-1000-8000-00805F9B34FB"),
            Some(battery)
        );
    }

    #[test]
    fn test_parse_uuid_rejects_bad_lengths() {
        assert_eq!(parse_uuid("18"), None);
        assert_eq!(parse_uuid("not-a-uuid"), None);
    }
}
