use std::fmt::{self, Display, Formatter};

use serde::Serialize;

use crate::catalog::CatalogDevice;
use crate::hw::{CharacteristicInfo, ServiceInfo};
use crate::utils::join_or_dash;

use super::painter::Painter;
use super::table::Table;

/// A connected device with its discovered GATT table.
#[derive(Debug, Serialize)]
pub(crate) struct CatalogReport {
    pub(crate) device: CatalogDevice,
    pub(crate) services: Vec<ServiceReport>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ServiceReport {
    #[serde(flatten)]
    pub(crate) service: ServiceInfo,
    pub(crate) characteristics: Vec<CharacteristicInfo>,
}

/// Renders a [`CatalogReport`] as one table per service.
pub(crate) struct CatalogView<'a> {
    report: &'a CatalogReport,
    painter: &'a Painter,
}

impl<'a> CatalogView<'a> {
    pub(crate) fn new(report: &'a CatalogReport, painter: &'a Painter) -> Self {
        Self { report, painter }
    }
}

impl Display for CatalogView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let device = self.report.device.device();
        writeln!(
            f,
            "{} {} ({})",
            self.painter.done("Connected to"),
            self.painter
                .payload(device.local_name().unwrap_or("<unknown>")),
            device.device_id()
        )?;

        if self.report.services.is_empty() {
            return write!(f, "{}", self.painter.empty("No services discovered."));
        }

        for service in &self.report.services {
            writeln!(f)?;
            let kind = if service.service.is_primary() {
                "primary"
            } else {
                "secondary"
            };
            writeln!(
                f,
                "{}, {} {}",
                self.painter.title(service.service.name()),
                service.service.uuid(),
                self.painter.detail(format!("[{kind}]"))
            )?;

            if service.characteristics.is_empty() {
                writeln!(f, "{}", self.painter.detail("  no characteristics"))?;
                continue;
            }

            let rows = service
                .characteristics
                .iter()
                .enumerate()
                .map(|(index, characteristic)| {
                    vec![
                        index.to_string(),
                        characteristic.name().to_string(),
                        characteristic.uuid().to_string(),
                        join_or_dash(characteristic.properties()),
                        join_or_dash(characteristic.descriptors()),
                    ]
                })
                .collect();
            writeln!(
                f,
                "{}",
                Table::grid(
                    ["#", "characteristic", "uuid", "properties", "descriptors"],
                    rows
                )
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{DiscoveryCatalog, Entity, EntityId};
    use crate::hw::{CharacteristicId, ConnectionState, DeviceId, FoundDevice};

    fn report() -> CatalogReport {
        let mut catalog = DiscoveryCatalog::new();
        let device_id = DeviceId::from("AA:BB");
        catalog.add_device(FoundDevice::new(
            "hci0",
            device_id.clone(),
            Some("UART-Dev".to_string()),
            None,
        ));
        catalog.set_connection_state(&device_id, ConnectionState::Connected);
        let Some(Entity::Device(device)) = catalog.lookup(&EntityId::Device(device_id)) else {
            panic!("device should be catalogued");
        };

        let battery = ServiceInfo::new("0000180f-0000-1000-8000-00805f9b34fb", true);
        let level = CharacteristicInfo::new(
            CharacteristicId::new(battery.uuid(), "00002a19-0000-1000-8000-00805f9b34fb"),
            vec!["read".to_string(), "notify".to_string()],
        )
        .with_descriptors(vec!["00002902-0000-1000-8000-00805f9b34fb".to_string()]);

        CatalogReport {
            device,
            services: vec![
                ServiceReport {
                    service: battery,
                    characteristics: vec![level],
                },
                ServiceReport {
                    service: ServiceInfo::new("1801", false),
                    characteristics: Vec::new(),
                },
            ],
        }
    }

    #[test]
    fn catalog_view_lists_services_and_characteristics() {
        let painter = Painter::new(false);
        let rendered = CatalogView::new(&report(), &painter).to_string();

        assert!(rendered.starts_with("Connected to UART-Dev (AA:BB)"));
        assert!(rendered.contains("Battery Service, 0000180f-0000-1000-8000-00805f9b34fb [primary]"));
        assert!(rendered.contains("Battery Level"));
        assert!(rendered.contains("read, notify"));
        assert!(rendered.contains("00002902-0000-1000-8000-00805f9b34fb"));
        assert!(rendered.contains("Generic Attribute, 1801 [secondary]"));
        assert!(rendered.contains("no characteristics"));
    }

    #[test]
    fn catalog_report_serialises_flattened_services() -> anyhow::Result<()> {
        let json = serde_json::to_value(report())?;

        assert_eq!("AA:BB", json["device"]["device_id"]);
        assert_eq!("connected", json["device"]["state"]);
        assert_eq!("Battery Service", json["services"][0]["name"]);
        assert_eq!(
            true,
            json["services"][0]["characteristics"][0]["capabilities"]["notifiable"]
        );
        Ok(())
    }
}
