use std::collections::HashMap;

use serde::Serialize;

use crate::error::GattError;
use crate::hw::{
    CharacteristicId, CharacteristicInfo, ConnectionState, DeviceId, FoundDevice, ServiceInfo,
};

/// Identifier of any entity held by the catalog.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum EntityId {
    Device(DeviceId),
    /// Lower-case service UUID on the connected device.
    Service(String),
    Characteristic(CharacteristicId),
}

/// Snapshot of a catalog entity.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Entity {
    Device(CatalogDevice),
    Service(ServiceInfo),
    Characteristic(CharacteristicInfo),
}

/// A discovered device together with its current connection state.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct CatalogDevice {
    #[serde(flatten)]
    device: FoundDevice,
    state: ConnectionState,
}

impl CatalogDevice {
    #[must_use]
    pub fn device(&self) -> &FoundDevice {
        &self.device
    }

    #[must_use]
    pub fn device_id(&self) -> &DeviceId {
        self.device.device_id()
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.state
    }
}

/// In-memory registry of devices, the connected device's services and their characteristics.
///
/// Lists keep discovery order for display; every lookup goes through a hash index.
#[derive(Debug, Default)]
pub struct DiscoveryCatalog {
    devices: Vec<CatalogDevice>,
    device_index: HashMap<DeviceId, usize>,
    services_owner: Option<DeviceId>,
    services: Vec<ServiceInfo>,
    service_index: HashMap<String, usize>,
    characteristics: HashMap<String, Vec<CharacteristicInfo>>,
    characteristic_index: HashMap<CharacteristicId, usize>,
}

impl DiscoveryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a scan result. Returns `true` when the device was not known yet.
    ///
    /// A device seen again keeps its position; its name and RSSI are refreshed.
    pub fn add_device(&mut self, device: FoundDevice) -> bool {
        if let Some(&index) = self.device_index.get(device.device_id()) {
            self.devices[index].device.refresh_from(device);
            return false;
        }

        self.device_index
            .insert(device.device_id().clone(), self.devices.len());
        self.devices.push(CatalogDevice {
            device,
            state: ConnectionState::Disconnected,
        });
        true
    }

    pub(crate) fn set_connection_state(&mut self, device_id: &DeviceId, state: ConnectionState) {
        if let Some(&index) = self.device_index.get(device_id) {
            self.devices[index].state = state;
        }
    }

    /// Replaces the service list of `device_id` wholesale, dropping known characteristics.
    ///
    /// A UUID listed more than once keeps its first entry.
    ///
    /// # Errors
    ///
    /// Returns [`GattError::UnknownDevice`] if the device was never discovered.
    pub fn set_services(
        &mut self,
        device_id: &DeviceId,
        services: Vec<ServiceInfo>,
    ) -> Result<(), GattError> {
        if !self.device_index.contains_key(device_id) {
            return Err(GattError::UnknownDevice {
                device_id: device_id.clone(),
            });
        }

        self.drop_services();
        self.services_owner = Some(device_id.clone());
        for service in services {
            if self.service_index.contains_key(service.uuid()) {
                continue;
            }
            self.service_index
                .insert(service.uuid().to_string(), self.services.len());
            self.services.push(service);
        }
        Ok(())
    }

    /// Replaces the characteristics of one service wholesale.
    ///
    /// Repeated characteristic ids keep their first entry.
    ///
    /// # Errors
    ///
    /// Returns [`GattError::UnknownService`] if the service is not in the catalog.
    pub fn set_characteristics(
        &mut self,
        service: &str,
        characteristics: Vec<CharacteristicInfo>,
    ) -> Result<(), GattError> {
        let service = service.to_ascii_lowercase();
        if !self.service_index.contains_key(&service) {
            return Err(GattError::UnknownService { service });
        }

        if let Some(previous) = self.characteristics.remove(&service) {
            for characteristic in previous {
                self.characteristic_index.remove(characteristic.id());
            }
        }
        let mut unique = Vec::with_capacity(characteristics.len());
        for characteristic in characteristics {
            if self.characteristic_index.contains_key(characteristic.id()) {
                continue;
            }
            self.characteristic_index
                .insert(characteristic.id().clone(), unique.len());
            unique.push(characteristic);
        }
        self.characteristics.insert(service, unique);
        Ok(())
    }

    /// Returns an owned snapshot of the entity, if present.
    #[must_use]
    pub fn lookup(&self, id: &EntityId) -> Option<Entity> {
        match id {
            EntityId::Device(device_id) => self.device(device_id).cloned().map(Entity::Device),
            EntityId::Service(uuid) => self.service(uuid).cloned().map(Entity::Service),
            EntityId::Characteristic(characteristic) => self
                .characteristic(characteristic)
                .cloned()
                .map(Entity::Characteristic),
        }
    }

    #[must_use]
    pub fn device(&self, device_id: &DeviceId) -> Option<&CatalogDevice> {
        self.device_index
            .get(device_id)
            .map(|&index| &self.devices[index])
    }

    #[must_use]
    pub fn service(&self, uuid: &str) -> Option<&ServiceInfo> {
        self.service_index
            .get(&uuid.to_ascii_lowercase())
            .map(|&index| &self.services[index])
    }

    #[must_use]
    pub fn characteristic(&self, id: &CharacteristicId) -> Option<&CharacteristicInfo> {
        let index = *self.characteristic_index.get(id)?;
        self.characteristics
            .get(id.service())
            .and_then(|characteristics| characteristics.get(index))
    }

    #[must_use]
    pub fn devices(&self) -> &[CatalogDevice] {
        &self.devices
    }

    #[must_use]
    pub fn services(&self) -> &[ServiceInfo] {
        &self.services
    }

    /// Returns the characteristics discovered for a service; empty until discovered.
    #[must_use]
    pub fn characteristics(&self, service: &str) -> &[CharacteristicInfo] {
        self.characteristics
            .get(&service.to_ascii_lowercase())
            .map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn device_at(&self, index: usize) -> Option<&CatalogDevice> {
        self.devices.get(index)
    }

    #[must_use]
    pub fn service_at(&self, index: usize) -> Option<&ServiceInfo> {
        self.services.get(index)
    }

    #[must_use]
    pub fn characteristic_at(&self, service: &str, index: usize) -> Option<&CharacteristicInfo> {
        self.characteristics(service).get(index)
    }

    /// Returns the device whose services are currently catalogued.
    #[must_use]
    pub fn services_owner(&self) -> Option<&DeviceId> {
        self.services_owner.as_ref()
    }

    /// Drops the services subtree of `device_id` and marks it disconnected.
    ///
    /// The device record itself stays so a retry can select it again.
    pub fn clear_device(&mut self, device_id: &DeviceId) {
        if self.services_owner.as_ref() == Some(device_id) {
            self.drop_services();
        }
        self.set_connection_state(device_id, ConnectionState::Disconnected);
    }

    /// Forgets every device that is not connected or connecting.
    pub fn clear_scan_results(&mut self) {
        self.devices
            .retain(|device| device.state != ConnectionState::Disconnected);
        self.device_index = self
            .devices
            .iter()
            .enumerate()
            .map(|(index, device)| (device.device_id().clone(), index))
            .collect();
    }

    fn drop_services(&mut self) {
        self.services_owner = None;
        self.services.clear();
        self.service_index.clear();
        self.characteristics.clear();
        self.characteristic_index.clear();
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::{fixture, rstest};

    use super::*;

    const BATTERY: &str = "0000180f-0000-1000-8000-00805f9b34fb";
    const LEVEL: &str = "00002a19-0000-1000-8000-00805f9b34fb";

    fn device(id: &str, name: Option<&str>, rssi: Option<i16>) -> FoundDevice {
        FoundDevice::new("hci0", id, name.map(str::to_string), rssi)
    }

    #[fixture]
    fn populated() -> DiscoveryCatalog {
        let mut catalog = DiscoveryCatalog::new();
        catalog.add_device(device("D1", Some("Sensor"), Some(-60)));
        catalog.add_device(device("D2", None, None));
        catalog
            .set_services(&DeviceId::from("D1"), vec![ServiceInfo::new(BATTERY, true)])
            .expect("D1 should be known");
        catalog
            .set_characteristics(
                BATTERY,
                vec![CharacteristicInfo::new(
                    CharacteristicId::new(BATTERY, LEVEL),
                    vec!["read".to_string(), "notify".to_string()],
                )],
            )
            .expect("battery service should be known");
        catalog
    }

    #[test]
    fn add_device_deduplicates_and_keeps_position() {
        let mut catalog = DiscoveryCatalog::new();
        assert!(catalog.add_device(device("D1", Some("Sensor"), Some(-80))));
        assert!(catalog.add_device(device("D2", Some("Other"), None)));
        assert!(!catalog.add_device(device("D1", None, Some(-40))));

        assert_eq!(2, catalog.devices().len());
        let first = catalog.device_at(0).expect("first device");
        assert_eq!("D1", first.device_id().as_str());
        assert_eq!(Some("Sensor"), first.device().local_name());
        assert_eq!(Some(-40), first.device().rssi());
    }

    #[rstest]
    fn lookup_finds_every_entity_kind(populated: DiscoveryCatalog) {
        assert_matches!(
            populated.lookup(&EntityId::Device(DeviceId::from("D2"))),
            Some(Entity::Device(device)) if device.device().local_name().is_none()
        );
        assert_matches!(
            populated.lookup(&EntityId::Service(BATTERY.to_uppercase())),
            Some(Entity::Service(service)) if service.name() == "Battery Service"
        );
        assert_matches!(
            populated.lookup(&EntityId::Characteristic(CharacteristicId::new(BATTERY, LEVEL))),
            Some(Entity::Characteristic(characteristic)) if characteristic.capabilities().readable
        );
        assert_eq!(
            None,
            populated.lookup(&EntityId::Service("1234".to_string()))
        );
    }

    #[rstest]
    fn set_services_replaces_wholesale(mut populated: DiscoveryCatalog) {
        populated
            .set_services(&DeviceId::from("D1"), vec![ServiceInfo::new("1800", true)])
            .expect("D1 should be known");

        assert_eq!(1, populated.services().len());
        assert!(populated.characteristics(BATTERY).is_empty());
        assert_eq!(
            None,
            populated.characteristic(&CharacteristicId::new(BATTERY, LEVEL))
        );
    }

    #[rstest]
    fn repeated_services_and_characteristics_keep_first_entry(mut populated: DiscoveryCatalog) {
        populated
            .set_services(
                &DeviceId::from("D1"),
                vec![
                    ServiceInfo::new(BATTERY, true),
                    ServiceInfo::new("1800", true),
                    ServiceInfo::new(BATTERY.to_uppercase(), false),
                ],
            )
            .expect("D1 should be known");
        let level = CharacteristicId::new(BATTERY, LEVEL);
        populated
            .set_characteristics(
                BATTERY,
                vec![
                    CharacteristicInfo::new(level.clone(), vec!["read".to_string()]),
                    CharacteristicInfo::new(level.clone(), vec!["notify".to_string()]),
                ],
            )
            .expect("battery service should be known");

        assert_eq!(2, populated.services().len());
        assert_eq!(
            Some(true),
            populated.service(BATTERY).map(ServiceInfo::is_primary)
        );
        assert_eq!(1, populated.characteristics(BATTERY).len());
        let kept = populated.characteristic(&level).expect("level is catalogued");
        assert!(kept.capabilities().readable);
        assert!(!kept.capabilities().notifiable);
    }

    #[rstest]
    fn set_characteristics_rejects_unknown_service(mut populated: DiscoveryCatalog) {
        assert_matches!(
            populated.set_characteristics("1805", Vec::new()),
            Err(GattError::UnknownService { service }) if service == "1805"
        );
    }

    #[test]
    fn set_services_rejects_unknown_device() {
        let mut catalog = DiscoveryCatalog::new();
        assert_matches!(
            catalog.set_services(&DeviceId::from("ghost"), Vec::new()),
            Err(GattError::UnknownDevice { .. })
        );
    }

    #[rstest]
    fn clear_device_drops_subtree_but_keeps_record(mut populated: DiscoveryCatalog) {
        let d1 = DeviceId::from("D1");
        populated.set_connection_state(&d1, ConnectionState::Connected);

        populated.clear_device(&d1);

        assert!(populated.services().is_empty());
        assert_eq!(None, populated.services_owner());
        assert_eq!(
            Some(ConnectionState::Disconnected),
            populated.device(&d1).map(CatalogDevice::state)
        );
    }

    #[rstest]
    fn clear_scan_results_keeps_connected_devices(mut populated: DiscoveryCatalog) {
        populated.set_connection_state(&DeviceId::from("D2"), ConnectionState::Connected);

        populated.clear_scan_results();

        let remaining: Vec<&str> = populated
            .devices()
            .iter()
            .map(|device| device.device_id().as_str())
            .collect();
        assert_eq!(vec!["D2"], remaining);
        assert!(populated.device(&DeviceId::from("D2")).is_some());
        assert!(populated.device(&DeviceId::from("D1")).is_none());
    }

    #[rstest]
    fn index_queries_follow_discovery_order(populated: DiscoveryCatalog) {
        assert_eq!(
            Some(BATTERY),
            populated.service_at(0).map(ServiceInfo::uuid)
        );
        assert_eq!(
            Some(LEVEL),
            populated.characteristic_at(BATTERY, 0).map(CharacteristicInfo::uuid)
        );
        assert!(populated.characteristic_at(BATTERY, 1).is_none());
        assert!(populated.device_at(5).is_none());
    }
}
