use std::fmt::{self, Display, Formatter};

use crate::catalog::CatalogDevice;

use super::painter::Painter;
use super::table::Table;

/// Renders scan results as a numbered grid.
pub(crate) struct DeviceListView<'a> {
    devices: &'a [CatalogDevice],
    painter: &'a Painter,
}

impl<'a> DeviceListView<'a> {
    pub(crate) fn new(devices: &'a [CatalogDevice], painter: &'a Painter) -> Self {
        Self { devices, painter }
    }
}

impl Display for DeviceListView<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.devices.is_empty() {
            return write!(f, "{}", self.painter.empty("No devices found."));
        }

        let rows = self
            .devices
            .iter()
            .enumerate()
            .map(|(index, entry)| {
                let device = entry.device();
                vec![
                    index.to_string(),
                    self.painter.address(device.device_id().as_str()),
                    device
                        .local_name()
                        .map_or_else(|| self.painter.detail("<unknown>"), str::to_string),
                    self.painter.rssi(device.rssi()),
                    device.adapter_name().to_string(),
                ]
            })
            .collect();

        writeln!(
            f,
            "{}",
            self.painter
                .title(format!("Found {} device(s)", self.devices.len()))
        )?;
        write!(
            f,
            "{}",
            Table::grid(["#", "device", "name", "rssi", "adapter"], rows)
        )
    }
}
