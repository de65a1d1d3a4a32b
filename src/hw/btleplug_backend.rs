use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, instrument, trace, warn};

use super::gateway::{
    AdapterGateway, DeviceStream, LinkEvent, SubscriptionHandle, ValueCallback, WriteMode,
};
use super::model::{CharacteristicId, CharacteristicInfo, DeviceId, FoundDevice, ServiceInfo};
use crate::error::GattError;

const SCAN_CHANNEL_CAPACITY: usize = 64;
const LINK_EVENT_CAPACITY: usize = 16;

/// Gateway backed by the platform BLE stack through `btleplug`.
#[derive(Debug)]
pub(crate) struct BtleplugBackend {
    // Dropping the manager tears down the platform session on some hosts.
    _manager: Manager,
    adapter: Adapter,
    adapter_name: String,
    peripherals: Arc<Mutex<HashMap<DeviceId, Peripheral>>>,
    connected: Arc<Mutex<HashSet<DeviceId>>>,
    subscriptions: Mutex<HashMap<u64, ActiveSubscription>>,
    next_handle: AtomicU64,
    link_events: broadcast::Sender<LinkEvent>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug)]
struct ActiveSubscription {
    device: DeviceId,
    characteristic: Characteristic,
    forwarder: JoinHandle<()>,
}

impl BtleplugBackend {
    /// Opens the first BLE adapter and starts watching for link loss.
    #[instrument(level = "debug")]
    pub(crate) async fn new() -> Result<Self, GattError> {
        let manager = Manager::new().await?;
        let Some(adapter) = manager.adapters().await?.into_iter().next() else {
            return Err(GattError::NoAdapters);
        };
        let adapter_name = adapter.adapter_info().await?;
        info!(adapter = %adapter_name, "opened BLE adapter");

        let (link_events, _receiver) = broadcast::channel(LINK_EVENT_CAPACITY);
        let connected = Arc::new(Mutex::new(HashSet::new()));
        spawn_link_watcher(&adapter, Arc::clone(&connected), link_events.clone()).await?;

        Ok(Self {
            _manager: manager,
            adapter,
            adapter_name,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            connected,
            subscriptions: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            link_events,
            scan_task: Mutex::new(None),
        })
    }

    fn peripheral(&self, device: &DeviceId) -> Option<Peripheral> {
        lock(&self.peripherals).get(device).cloned()
    }

    fn connected_peripheral(
        &self,
        device: &DeviceId,
        characteristic: &CharacteristicId,
    ) -> Result<Peripheral, GattError> {
        self.peripheral(device)
            .ok_or_else(|| operation_error(characteristic, "device is not connected"))
    }

    fn find_characteristic(
        peripheral: &Peripheral,
        characteristic: &CharacteristicId,
    ) -> Result<Characteristic, GattError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|candidate| {
                candidate
                    .service_uuid
                    .to_string()
                    .eq_ignore_ascii_case(characteristic.service())
                    && candidate
                        .uuid
                        .to_string()
                        .eq_ignore_ascii_case(characteristic.characteristic())
            })
            .ok_or_else(|| operation_error(characteristic, "characteristic not found"))
    }
}

#[async_trait]
impl AdapterGateway for BtleplugBackend {
    #[instrument(skip(self), level = "debug", fields(adapter = %self.adapter_name))]
    async fn scan(&self, timeout: Duration) -> Result<DeviceStream, GattError> {
        let mut events = self.adapter.events().await.map_err(scan_error)?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(scan_error)?;

        let (sender, receiver) = mpsc::channel(SCAN_CHANNEL_CAPACITY);
        let adapter = self.adapter.clone();
        let adapter_name = self.adapter_name.clone();
        let peripherals = Arc::clone(&self.peripherals);

        let task = tokio::spawn(async move {
            let deadline = sleep(timeout);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    () = &mut deadline => break,
                    event = events.next() => match event {
                        Some(CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id)) => {
                            let Some(device) =
                                found_device(&adapter, &adapter_name, &id, &peripherals).await
                            else {
                                continue;
                            };
                            if sender.send(device).await.is_err() {
                                break;
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                }
            }

            if let Err(error) = adapter.stop_scan().await {
                debug!(?error, "failed to stop adapter scan cleanly");
            }
        });

        if let Some(previous) = lock(&self.scan_task).replace(task) {
            previous.abort();
        }
        Ok(Box::pin(ReceiverStream::new(receiver)))
    }

    #[instrument(skip(self), level = "debug")]
    async fn stop_scan(&self) -> Result<(), GattError> {
        if let Some(task) = lock(&self.scan_task).take() {
            task.abort();
        }
        self.adapter.stop_scan().await.map_err(scan_error)
    }

    #[instrument(skip(self), level = "debug", fields(%device))]
    async fn connect(&self, device: &DeviceId) -> Result<(), GattError> {
        let connect_error = |reason: String| GattError::Connect {
            device_id: device.clone(),
            reason,
        };
        let peripheral = self
            .peripheral(device)
            .ok_or_else(|| connect_error("device was not seen by the last scan".to_string()))?;

        let already_connected = peripheral
            .is_connected()
            .await
            .map_err(|error| connect_error(error.to_string()))?;
        if !already_connected {
            peripheral
                .connect()
                .await
                .map_err(|error| connect_error(error.to_string()))?;
        }

        lock(&self.connected).insert(device.clone());
        info!("connected to peripheral");
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(%device))]
    async fn disconnect(&self, device: &DeviceId) -> Result<(), GattError> {
        lock(&self.connected).remove(device);
        let orphaned: Vec<ActiveSubscription> = {
            let mut subscriptions = lock(&self.subscriptions);
            let ids: Vec<u64> = subscriptions
                .iter()
                .filter(|(_, subscription)| &subscription.device == device)
                .map(|(id, _)| *id)
                .collect();
            ids.iter()
                .filter_map(|id| subscriptions.remove(id))
                .collect()
        };
        for subscription in orphaned {
            subscription.forwarder.abort();
        }

        let Some(peripheral) = self.peripheral(device) else {
            return Ok(());
        };
        let disconnect_error = |error: btleplug::Error| GattError::Disconnect {
            device_id: device.clone(),
            reason: error.to_string(),
        };
        if peripheral.is_connected().await.map_err(disconnect_error)? {
            peripheral.disconnect().await.map_err(disconnect_error)?;
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(%device))]
    async fn discover_services(&self, device: &DeviceId) -> Result<Vec<ServiceInfo>, GattError> {
        let discover_error = |reason: String| GattError::Discover { reason };
        let peripheral = self
            .peripheral(device)
            .ok_or_else(|| discover_error("device is not connected".to_string()))?;
        peripheral
            .discover_services()
            .await
            .map_err(|error| discover_error(error.to_string()))?;

        let mut services: Vec<ServiceInfo> = peripheral
            .services()
            .iter()
            .map(|service| ServiceInfo::new(service.uuid.to_string(), service.primary))
            .collect();
        services.sort_by(|left, right| left.uuid().cmp(right.uuid()));
        Ok(services)
    }

    #[instrument(skip(self), level = "debug", fields(%device))]
    async fn discover_characteristics(
        &self,
        device: &DeviceId,
        service: &str,
    ) -> Result<Vec<CharacteristicInfo>, GattError> {
        let peripheral = self.peripheral(device).ok_or_else(|| GattError::Discover {
            reason: "device is not connected".to_string(),
        })?;

        let Some(service) = peripheral
            .services()
            .into_iter()
            .find(|candidate| candidate.uuid.to_string().eq_ignore_ascii_case(service))
        else {
            return Err(GattError::Discover {
                reason: format!("service `{service}` not found"),
            });
        };

        Ok(collect_characteristics(&service.uuid.to_string(), &service.characteristics))
    }

    #[instrument(skip(self), level = "debug", fields(%device, %characteristic))]
    async fn read(
        &self,
        device: &DeviceId,
        characteristic: &CharacteristicId,
    ) -> Result<Vec<u8>, GattError> {
        let peripheral = self.connected_peripheral(device, characteristic)?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;
        let payload = peripheral
            .read(&target)
            .await
            .map_err(|error| operation_error(characteristic, &error.to_string()))?;
        trace!(len = payload.len(), "read characteristic value");
        Ok(payload)
    }

    #[instrument(skip(self, payload), level = "debug", fields(%device, %characteristic, len = payload.len(), %mode))]
    async fn write(
        &self,
        device: &DeviceId,
        characteristic: &CharacteristicId,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), GattError> {
        let peripheral = self.connected_peripheral(device, characteristic)?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;
        peripheral
            .write(&target, payload, write_type(mode))
            .await
            .map_err(|error| operation_error(characteristic, &error.to_string()))
    }

    #[instrument(skip(self, on_value), level = "debug", fields(%device, %characteristic))]
    async fn subscribe(
        &self,
        device: &DeviceId,
        characteristic: &CharacteristicId,
        on_value: ValueCallback,
    ) -> Result<SubscriptionHandle, GattError> {
        let peripheral = self.connected_peripheral(device, characteristic)?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;
        let to_operation_error =
            |error: btleplug::Error| operation_error(characteristic, &error.to_string());

        let mut notifications = peripheral.notifications().await.map_err(to_operation_error)?;
        peripheral
            .subscribe(&target)
            .await
            .map_err(to_operation_error)?;

        let expected_uuid = target.uuid;
        let forwarder = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == expected_uuid {
                    on_value(notification.value);
                }
            }
            trace!("notification stream closed");
        });

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        lock(&self.subscriptions).insert(
            id,
            ActiveSubscription {
                device: device.clone(),
                characteristic: target,
                forwarder,
            },
        );
        Ok(SubscriptionHandle::new(
            id,
            device.clone(),
            characteristic.clone(),
        ))
    }

    #[instrument(skip(self), level = "debug", fields(characteristic = %handle.characteristic()))]
    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), GattError> {
        let Some(subscription) = lock(&self.subscriptions).remove(&handle.id()) else {
            return Ok(());
        };
        subscription.forwarder.abort();

        let Some(peripheral) = self.peripheral(&subscription.device) else {
            return Ok(());
        };
        peripheral
            .unsubscribe(&subscription.characteristic)
            .await
            .map_err(|error| operation_error(handle.characteristic(), &error.to_string()))
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_events.subscribe()
    }
}

async fn spawn_link_watcher(
    adapter: &Adapter,
    connected: Arc<Mutex<HashSet<DeviceId>>>,
    link_events: broadcast::Sender<LinkEvent>,
) -> Result<(), GattError> {
    let mut events = adapter.events().await?;
    tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let CentralEvent::DeviceDisconnected(id) = event else {
                continue;
            };
            let device = device_id(&id);
            if !lock(&connected).remove(&device) {
                continue;
            }

            warn!(%device, "peripheral dropped the connection");
            if link_events.send(LinkEvent::Lost(device)).is_err() {
                debug!("no link-event listeners");
            }
        }
    });
    Ok(())
}

async fn found_device(
    adapter: &Adapter,
    adapter_name: &str,
    id: &PeripheralId,
    peripherals: &Mutex<HashMap<DeviceId, Peripheral>>,
) -> Option<FoundDevice> {
    let peripheral = match adapter.peripheral(id).await {
        Ok(peripheral) => peripheral,
        Err(error) => {
            debug!(?error, "discovered peripheral vanished before lookup");
            return None;
        }
    };
    let properties = match peripheral.properties().await {
        Ok(properties) => properties,
        Err(error) => {
            debug!(?error, "failed to read advertisement properties");
            None
        }
    };

    let device = device_id(id);
    lock(peripherals).insert(device.clone(), peripheral);
    let (local_name, rssi) = properties
        .map(|properties| (properties.local_name, properties.rssi))
        .unwrap_or_default();
    Some(FoundDevice::new(adapter_name, device, local_name, rssi))
}

fn collect_characteristics(
    service_uuid: &str,
    characteristics: &std::collections::BTreeSet<Characteristic>,
) -> Vec<CharacteristicInfo> {
    let mut collected: Vec<CharacteristicInfo> = characteristics
        .iter()
        .map(|characteristic| {
            let descriptors = characteristic
                .descriptors
                .iter()
                .map(|descriptor| descriptor.uuid.to_string().to_lowercase())
                .collect();
            CharacteristicInfo::new(
                CharacteristicId::new(service_uuid, characteristic.uuid.to_string()),
                property_labels(characteristic.properties),
            )
            .with_descriptors(descriptors)
        })
        .collect();
    collected.sort_by(|left, right| left.uuid().cmp(right.uuid()));
    collected
}

fn property_labels(flags: CharPropFlags) -> Vec<String> {
    let labels: Vec<String> = flags
        .iter_names()
        .map(|(name, _)| name.to_lowercase())
        .collect();
    if labels.is_empty() {
        vec!["none".to_string()]
    } else {
        labels
    }
}

fn write_type(mode: WriteMode) -> WriteType {
    match mode {
        WriteMode::WithResponse => WriteType::WithResponse,
        WriteMode::WithoutResponse => WriteType::WithoutResponse,
    }
}

fn device_id(id: &PeripheralId) -> DeviceId {
    DeviceId::from(id.to_string())
}

fn scan_error(error: btleplug::Error) -> GattError {
    GattError::Scan {
        reason: error.to_string(),
    }
}

fn operation_error(characteristic: &CharacteristicId, reason: &str) -> GattError {
    GattError::Operation {
        characteristic: characteristic.clone(),
        reason: reason.to_string(),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(CharPropFlags::READ | CharPropFlags::NOTIFY, vec!["read", "notify"])]
    #[case(
        CharPropFlags::WRITE | CharPropFlags::WRITE_WITHOUT_RESPONSE,
        vec!["write_without_response", "write"]
    )]
    #[case(CharPropFlags::empty(), vec!["none"])]
    fn property_labels_lowercase_flag_names(
        #[case] flags: CharPropFlags,
        #[case] expected: Vec<&str>,
    ) {
        assert_eq!(expected, property_labels(flags));
    }

    #[test]
    fn runtime_scan_failures_are_not_reported_as_initialisation_errors() {
        let error = scan_error(btleplug::Error::RuntimeError(
            "adapter powered off".to_string(),
        ));

        let message = error.to_string();
        assert!(message.starts_with("BLE scan failed: "), "{message}");
        assert!(message.contains("adapter powered off"), "{message}");
    }

    #[test]
    fn property_labels_feed_capabilities() {
        let characteristic = CharacteristicInfo::new(
            CharacteristicId::new("180f", "2a19"),
            property_labels(CharPropFlags::INDICATE | CharPropFlags::WRITE_WITHOUT_RESPONSE),
        );

        let capabilities = characteristic.capabilities();
        assert!(!capabilities.readable);
        assert!(capabilities.writable);
        assert!(capabilities.notifiable);
    }

    #[rstest]
    #[case(WriteMode::WithResponse, WriteType::WithResponse)]
    #[case(WriteMode::WithoutResponse, WriteType::WithoutResponse)]
    fn write_type_maps_modes(#[case] mode: WriteMode, #[case] expected: WriteType) {
        assert_eq!(expected, write_type(mode));
    }
}
