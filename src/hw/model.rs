use std::str::FromStr;

use serde::Serialize;
use serde_with::SerializeDisplay;

use super::gateway::WriteMode;
use crate::error::ParseCharacteristicIdError;
use crate::gatt_names;

/// Backend-specific identifier of a BLE peripheral.
#[derive(
    Debug,
    Clone,
    Eq,
    PartialEq,
    Hash,
    Ord,
    PartialOrd,
    Serialize,
    derive_more::Display,
    derive_more::From,
    derive_more::Into,
)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifies one characteristic by its owning service and its own UUID.
///
/// Characteristic UUIDs are only unique within a service, so both halves are
/// kept. The textual form is `<service-uuid>/<characteristic-uuid>`.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, SerializeDisplay)]
pub struct CharacteristicId {
    service: String,
    characteristic: String,
}

impl CharacteristicId {
    /// Creates an identifier, normalising both UUIDs to lower case.
    pub fn new(service: impl AsRef<str>, characteristic: impl AsRef<str>) -> Self {
        Self {
            service: service.as_ref().to_ascii_lowercase(),
            characteristic: characteristic.as_ref().to_ascii_lowercase(),
        }
    }

    /// Returns the owning service UUID.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Returns the characteristic UUID.
    #[must_use]
    pub fn characteristic(&self) -> &str {
        &self.characteristic
    }
}

impl std::fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

impl FromStr for CharacteristicId {
    type Err = ParseCharacteristicIdError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let Some((service, characteristic)) = value.trim().split_once('/') else {
            return Err(ParseCharacteristicIdError::MissingSeparator {
                value: value.to_string(),
            });
        };
        if service.is_empty() || characteristic.is_empty() {
            return Err(ParseCharacteristicIdError::EmptyComponent {
                value: value.to_string(),
            });
        }

        Ok(Self::new(
            gatt_names::expand_short_uuid(service),
            gatt_names::expand_short_uuid(characteristic),
        ))
    }
}

/// Connection state of a catalogued device.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, derive_more::Display)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[display("disconnected")]
    Disconnected,
    #[display("connecting")]
    Connecting,
    #[display("connected")]
    Connected,
}

/// A BLE peripheral reported by a scan.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct FoundDevice {
    adapter_name: String,
    device_id: DeviceId,
    local_name: Option<String>,
    rssi: Option<i16>,
}

impl FoundDevice {
    /// Creates a new discovered-device record.
    pub fn new(
        adapter_name: impl Into<String>,
        device_id: impl Into<DeviceId>,
        local_name: Option<String>,
        rssi: Option<i16>,
    ) -> Self {
        Self {
            adapter_name: adapter_name.into(),
            device_id: device_id.into(),
            local_name,
            rssi,
        }
    }

    /// Returns the adapter name used to discover this device.
    #[must_use]
    pub fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    /// Returns the backend-specific device identifier.
    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// Returns the advertised local name, if present.
    #[must_use]
    pub fn local_name(&self) -> Option<&str> {
        self.local_name.as_deref()
    }

    /// Returns the latest observed RSSI value, if present.
    #[must_use]
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    /// Returns whether the local name starts with a prefix.
    pub(crate) fn local_name_starts_with(&self, prefix: &str) -> bool {
        self.local_name
            .as_deref()
            .is_some_and(|name| name.starts_with(prefix))
    }

    /// Folds a newer advertisement into this record.
    ///
    /// A later advertisement without a name or RSSI keeps the known values.
    pub(crate) fn refresh_from(&mut self, newer: FoundDevice) {
        if newer.local_name.is_some() {
            self.local_name = newer.local_name;
        }
        if newer.rssi.is_some() {
            self.rssi = newer.rssi;
        }
    }
}

/// Operations a characteristic advertises support for.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize)]
pub struct Capabilities {
    pub readable: bool,
    pub writable: bool,
    pub notifiable: bool,
}

impl Capabilities {
    /// Derives capability flags from lower-case GATT property labels.
    pub(crate) fn from_property_labels(labels: &[String]) -> Self {
        Self {
            readable: has_property(labels, "read"),
            writable: has_property(labels, "write")
                || has_property(labels, "write_without_response"),
            notifiable: has_property(labels, "notify") || has_property(labels, "indicate"),
        }
    }
}

fn has_property(labels: &[String], property: &str) -> bool {
    labels
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(property))
}

/// A GATT service discovered on the connected peripheral.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ServiceInfo {
    uuid: String,
    name: String,
    primary: bool,
}

impl ServiceInfo {
    /// Creates a service description; the display name is resolved from the UUID.
    pub fn new(uuid: impl AsRef<str>, primary: bool) -> Self {
        let uuid = uuid.as_ref().to_ascii_lowercase();
        let name = gatt_names::service_name(&uuid).to_string();
        Self {
            uuid,
            name,
            primary,
        }
    }

    /// Returns the service UUID.
    #[must_use]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    /// Returns the display name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether this is a primary service.
    #[must_use]
    pub fn is_primary(&self) -> bool {
        self.primary
    }
}

/// A characteristic discovered within a service.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct CharacteristicInfo {
    id: CharacteristicId,
    name: String,
    properties: Vec<String>,
    capabilities: Capabilities,
    descriptors: Vec<String>,
}

impl CharacteristicInfo {
    /// Creates a characteristic description from its property labels.
    pub fn new(id: CharacteristicId, properties: Vec<String>) -> Self {
        let name = gatt_names::characteristic_name(id.characteristic()).to_string();
        let capabilities = Capabilities::from_property_labels(&properties);
        Self {
            id,
            name,
            properties,
            capabilities,
            descriptors: Vec::new(),
        }
    }

    /// Attaches descriptor UUIDs.
    #[must_use]
    pub fn with_descriptors(mut self, descriptors: Vec<String>) -> Self {
        self.descriptors = descriptors;
        self
    }

    #[must_use]
    pub fn id(&self) -> &CharacteristicId {
        &self.id
    }

    /// Returns the characteristic UUID.
    #[must_use]
    pub fn uuid(&self) -> &str {
        self.id.characteristic()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns raw property labels for this characteristic.
    #[must_use]
    pub fn properties(&self) -> &[String] {
        &self.properties
    }

    #[must_use]
    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Returns descriptor UUIDs.
    #[must_use]
    pub fn descriptors(&self) -> &[String] {
        &self.descriptors
    }

    /// Picks the write mode: acknowledged when the peripheral supports it.
    pub(crate) fn preferred_write_mode(&self) -> WriteMode {
        if has_property(&self.properties, "write") {
            WriteMode::WithResponse
        } else {
            WriteMode::WithoutResponse
        }
    }
}
