use std::collections::HashMap;
use std::sync::LazyLock;

const BLUETOOTH_BASE_UUID_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";

const UNKNOWN_SERVICE: &str = "Unknown Service";
const UNKNOWN_CHARACTERISTIC: &str = "Unknown Characteristic";

/// Attribute category in GATT.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub(crate) enum AttributeKind {
    Service,
    Characteristic,
}

/// Assigned numbers and vendor UUIDs that get a readable name.
const KNOWN_ATTRIBUTES: &[(AttributeKind, &str, &str)] = &[
    (AttributeKind::Service, "1800", "Generic Access"),
    (AttributeKind::Service, "1801", "Generic Attribute"),
    (AttributeKind::Service, "1805", "Current Time Service"),
    (AttributeKind::Service, "1809", "Health Thermometer"),
    (AttributeKind::Service, "180a", "Device Information"),
    (AttributeKind::Service, "180d", "Heart Rate"),
    (AttributeKind::Service, "180f", "Battery Service"),
    (AttributeKind::Service, "1816", "Cycling Speed and Cadence"),
    (AttributeKind::Service, "181a", "Environmental Sensing"),
    (
        AttributeKind::Service,
        "6e400001-b5a3-f393-e0a9-e50e24dcca9e",
        "Nordic UART Service",
    ),
    (AttributeKind::Characteristic, "2a00", "Device Name"),
    (AttributeKind::Characteristic, "2a01", "Appearance"),
    (AttributeKind::Characteristic, "2a04", "Peripheral Preferred Connection Parameters"),
    (AttributeKind::Characteristic, "2a05", "Service Changed"),
    (AttributeKind::Characteristic, "2a19", "Battery Level"),
    (AttributeKind::Characteristic, "2a1c", "Temperature Measurement"),
    (AttributeKind::Characteristic, "2a24", "Model Number String"),
    (AttributeKind::Characteristic, "2a25", "Serial Number String"),
    (AttributeKind::Characteristic, "2a26", "Firmware Revision String"),
    (AttributeKind::Characteristic, "2a27", "Hardware Revision String"),
    (AttributeKind::Characteristic, "2a28", "Software Revision String"),
    (AttributeKind::Characteristic, "2a29", "Manufacturer Name String"),
    (AttributeKind::Characteristic, "2a37", "Heart Rate Measurement"),
    (AttributeKind::Characteristic, "2a38", "Body Sensor Location"),
    (AttributeKind::Characteristic, "2a6e", "Temperature"),
    (AttributeKind::Characteristic, "2a6f", "Humidity"),
    (
        AttributeKind::Characteristic,
        "6e400002-b5a3-f393-e0a9-e50e24dcca9e",
        "UART RX",
    ),
    (
        AttributeKind::Characteristic,
        "6e400003-b5a3-f393-e0a9-e50e24dcca9e",
        "UART TX",
    ),
];

static NAMES_BY_UUID: LazyLock<HashMap<(AttributeKind, String), &'static str>> =
    LazyLock::new(|| {
        KNOWN_ATTRIBUTES
            .iter()
            .map(|(kind, uuid, name)| ((*kind, expand_short_uuid(uuid)), *name))
            .collect()
    });

/// Expands 16- and 32-bit SIG UUIDs onto the Bluetooth base UUID.
///
/// Anything that is not a bare 4 or 8 digit hex string is only lower-cased.
pub(crate) fn expand_short_uuid(uuid: &str) -> String {
    let uuid = uuid.trim().to_ascii_lowercase();
    let is_hex = uuid.chars().all(|c| c.is_ascii_hexdigit());
    match uuid.len() {
        4 if is_hex => format!("0000{uuid}{BLUETOOTH_BASE_UUID_SUFFIX}"),
        8 if is_hex => format!("{uuid}{BLUETOOTH_BASE_UUID_SUFFIX}"),
        _ => uuid,
    }
}

/// Returns the display name for a service UUID.
pub(crate) fn service_name(uuid: &str) -> &'static str {
    lookup(AttributeKind::Service, uuid).unwrap_or(UNKNOWN_SERVICE)
}

/// Returns the display name for a characteristic UUID.
pub(crate) fn characteristic_name(uuid: &str) -> &'static str {
    lookup(AttributeKind::Characteristic, uuid).unwrap_or(UNKNOWN_CHARACTERISTIC)
}

fn lookup(kind: AttributeKind, uuid: &str) -> Option<&'static str> {
    NAMES_BY_UUID.get(&(kind, expand_short_uuid(uuid))).copied()
}
