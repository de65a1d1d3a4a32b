use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::Stream;
use tracing::info;

use super::btleplug_backend::BtleplugBackend;
use super::fake_backend::{FakeGateway, FakeGatewayConfig};
use super::model::{CharacteristicId, CharacteristicInfo, DeviceId, FoundDevice, ServiceInfo};
use crate::error::GattError;

/// Live scan results produced by a gateway.
pub type DeviceStream = Pin<Box<dyn Stream<Item = FoundDevice> + Send>>;

/// Callback invoked by a gateway for every value pushed by the peripheral.
pub type ValueCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Write acknowledgement mode.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, derive_more::Display)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    #[display("with_response")]
    WithResponse,
    #[display("without_response")]
    WithoutResponse,
}

/// Events reported by the adapter about established links.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum LinkEvent {
    /// The peripheral dropped the connection without being asked to.
    Lost(DeviceId),
}

/// Token identifying one notification registration made through a gateway.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    device: DeviceId,
    characteristic: CharacteristicId,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: u64, device: DeviceId, characteristic: CharacteristicId) -> Self {
        Self {
            id,
            device,
            characteristic,
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn device(&self) -> &DeviceId {
        &self.device
    }

    #[must_use]
    pub fn characteristic(&self) -> &CharacteristicId {
        &self.characteristic
    }
}

/// Boundary to the platform BLE capability.
///
/// Every call may suspend while the radio or OS answers, and every call may
/// fail on its own: a failed discovery leaves an open connection intact.
#[async_trait]
pub trait AdapterGateway: Send + Sync + fmt::Debug {
    /// Starts scanning and streams devices until `timeout` elapses or
    /// [`AdapterGateway::stop_scan`] is called.
    async fn scan(&self, timeout: Duration) -> Result<DeviceStream, GattError>;

    /// Stops an active scan. Stopping when no scan runs is not an error.
    async fn stop_scan(&self) -> Result<(), GattError>;

    async fn connect(&self, device: &DeviceId) -> Result<(), GattError>;

    async fn disconnect(&self, device: &DeviceId) -> Result<(), GattError>;

    /// Discovers the primary and secondary services of a connected device.
    async fn discover_services(&self, device: &DeviceId) -> Result<Vec<ServiceInfo>, GattError>;

    /// Discovers the characteristics of one service.
    async fn discover_characteristics(
        &self,
        device: &DeviceId,
        service: &str,
    ) -> Result<Vec<CharacteristicInfo>, GattError>;

    async fn read(
        &self,
        device: &DeviceId,
        characteristic: &CharacteristicId,
    ) -> Result<Vec<u8>, GattError>;

    async fn write(
        &self,
        device: &DeviceId,
        characteristic: &CharacteristicId,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), GattError>;

    /// Enables notifications and routes every pushed value to `on_value`.
    async fn subscribe(
        &self,
        device: &DeviceId,
        characteristic: &CharacteristicId,
        on_value: ValueCallback,
    ) -> Result<SubscriptionHandle, GattError>;

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), GattError>;

    /// Subscribes to link events such as unexpected disconnects.
    fn link_events(&self) -> broadcast::Receiver<LinkEvent>;
}

/// Host permission check that gates scanning.
#[async_trait]
pub trait PermissionGate: Send + Sync + fmt::Debug {
    async fn has_permission(&self) -> bool;

    /// Asks the host for permission; returns whether it was granted.
    async fn request_permission(&self) -> bool;
}

/// Permission gate for hosts that do not prompt before scanning.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysGranted;

#[async_trait]
impl PermissionGate for AlwaysGranted {
    async fn has_permission(&self) -> bool {
        true
    }

    async fn request_permission(&self) -> bool {
        true
    }
}

/// Runtime BLE backend selection.
#[derive(Debug)]
pub enum GatewayBackend {
    Real,
    Fake(FakeGatewayConfig),
}

/// Gateway plus the permission gate that belongs to the same backend.
#[derive(Debug, Clone)]
pub struct ConnectedGateway {
    pub gateway: Arc<dyn AdapterGateway>,
    pub permissions: Arc<dyn PermissionGate>,
}

/// Builds an injected gateway for the selected runtime backend.
///
/// # Errors
///
/// Returns an error if the platform BLE manager or adapter cannot be opened.
pub async fn gateway_from_backend(backend: GatewayBackend) -> Result<ConnectedGateway, GattError> {
    let connected = match backend {
        GatewayBackend::Real => ConnectedGateway {
            gateway: Arc::new(BtleplugBackend::new().await?),
            permissions: Arc::new(AlwaysGranted),
        },
        GatewayBackend::Fake(config) => {
            info!("using fake BLE backend");
            let gateway = FakeGateway::new(config);
            let permissions = gateway.permissions();
            ConnectedGateway {
                gateway: Arc::new(gateway),
                permissions: Arc::new(permissions),
            }
        }
    };

    Ok(connected)
}
