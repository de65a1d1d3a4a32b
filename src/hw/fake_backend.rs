use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use tokio::sync::{broadcast, mpsc};
use tokio::time::sleep;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, instrument};

use super::gateway::{
    AdapterGateway, DeviceStream, LinkEvent, PermissionGate, SubscriptionHandle, ValueCallback,
    WriteMode,
};
use super::model::{CharacteristicId, CharacteristicInfo, DeviceId, FoundDevice, ServiceInfo};
use crate::error::{FixtureError, GattError};

const DEFAULT_READ_PAYLOAD: [u8; 1] = [0x64];
const DEFAULT_GATT_FIXTURE: &str = "180f/2a19=read+notify;\
    6e400001-b5a3-f393-e0a9-e50e24dcca9e/6e400002-b5a3-f393-e0a9-e50e24dcca9e=write+write_without_response;\
    6e400001-b5a3-f393-e0a9-e50e24dcca9e/6e400003-b5a3-f393-e0a9-e50e24dcca9e=notify";
const KNOWN_PROPERTIES: [&str; 5] = [
    "read",
    "write",
    "write_without_response",
    "notify",
    "indicate",
];
const LINK_EVENT_CAPACITY: usize = 16;

/// Parsed fake scan fixture records.
#[derive(Debug, Clone, derive_more::Into)]
pub struct ScanFixture {
    devices: Vec<FoundDevice>,
}

impl FromStr for ScanFixture {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let devices = parse_scan_fixture(value)?;
        Ok(Self { devices })
    }
}

/// Parsed fake GATT table: services in first-seen order with their characteristics.
#[derive(Debug, Clone)]
pub struct GattFixture {
    services: Vec<(ServiceInfo, Vec<CharacteristicInfo>)>,
}

impl FromStr for GattFixture {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let services = parse_gatt_fixture(value)?;
        Ok(Self { services })
    }
}

/// Parsed fake hex payload.
#[derive(Debug, Clone, derive_more::Into)]
pub struct HexPayload {
    payload: Vec<u8>,
}

impl HexPayload {
    #[must_use]
    pub fn from_bytes(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.payload
    }
}

impl FromStr for HexPayload {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let payload = parse_hex(value)?;
        Ok(Self { payload })
    }
}

/// Parsed fake notification payload fixtures.
#[derive(Debug, Clone, derive_more::Into)]
pub struct NotificationPayloads {
    payloads: Vec<Vec<u8>>,
}

impl FromStr for NotificationPayloads {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let payloads = parse_notifications(value)?;
        Ok(Self { payloads })
    }
}

/// Settings for constructing a fake gateway.
#[derive(Debug, Builder)]
pub struct FakeGatewayConfig {
    scan_fixture: ScanFixture,
    gatt_fixture: Option<GattFixture>,
    read_payload: Option<HexPayload>,
    /// Payloads pushed to every new subscription right after it is registered.
    notifications: Option<NotificationPayloads>,
    #[builder(default)]
    discovery_delay: Duration,
    /// Delay applied to reads and writes.
    #[builder(default)]
    response_delay: Duration,
    /// Time a connect attempt takes before it resolves.
    #[builder(default)]
    connect_delay: Duration,
    #[builder(default)]
    stop_scan_delay: Duration,
    /// Number of connect attempts that fail before connects succeed.
    #[builder(default)]
    connect_failures: u32,
    /// Makes service discovery fail on every connected device.
    #[builder(default)]
    fail_discovery: bool,
    /// Makes `disconnect` and `unsubscribe` hang, as some stacks do right
    /// after the link died.
    #[builder(default)]
    stall_teardown: bool,
    #[builder(default = true)]
    permission_granted: bool,
    #[builder(default = true)]
    grant_on_request: bool,
}

/// Gateway operations recorded by the fake backend.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum FakeCall {
    Scan,
    StopScan,
    Connect,
    Disconnect,
    DiscoverServices,
    DiscoverCharacteristics,
    Read,
    Write,
    Subscribe,
    Unsubscribe,
}

/// In-memory gateway used by tests and hardware-free CLI runs.
#[derive(Debug, Clone)]
pub struct FakeGateway {
    state: Arc<FakeState>,
}

#[derive(Debug)]
struct FakeState {
    devices: Vec<FoundDevice>,
    services: Vec<(ServiceInfo, Vec<CharacteristicInfo>)>,
    read_payload: Vec<u8>,
    notifications: Vec<Vec<u8>>,
    discovery_delay: Duration,
    response_delay: Duration,
    connect_delay: Duration,
    stop_scan_delay: Duration,
    stall_teardown: bool,
    fail_discovery: bool,
    connect_failures_remaining: AtomicU32,
    permissions: FakePermissions,
    next_handle: AtomicU64,
    link_events: broadcast::Sender<LinkEvent>,
    runtime: Mutex<FakeRuntime>,
}

#[derive(Debug, Default)]
struct FakeRuntime {
    connected: HashSet<DeviceId>,
    subscriptions: HashMap<u64, FakeSubscription>,
    calls: HashMap<FakeCall, usize>,
    writes: Vec<(CharacteristicId, Vec<u8>, WriteMode)>,
}

struct FakeSubscription {
    device: DeviceId,
    characteristic: CharacteristicId,
    callback: ValueCallback,
}

impl fmt::Debug for FakeSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FakeSubscription")
            .field("device", &self.device)
            .field("characteristic", &self.characteristic)
            .finish_non_exhaustive()
    }
}

impl FakeGateway {
    /// Creates a fake gateway from explicit settings.
    pub fn new(config: FakeGatewayConfig) -> Self {
        let services = match config.gatt_fixture {
            Some(fixture) => fixture.services,
            None => parse_gatt_fixture(DEFAULT_GATT_FIXTURE).unwrap_or_default(),
        };
        let read_payload = config
            .read_payload
            .map_or_else(|| DEFAULT_READ_PAYLOAD.to_vec(), Into::into);
        let notifications = config.notifications.map(Into::into).unwrap_or_default();
        let (link_events, _receiver) = broadcast::channel(LINK_EVENT_CAPACITY);

        Self {
            state: Arc::new(FakeState {
                devices: config.scan_fixture.into(),
                services,
                read_payload,
                notifications,
                discovery_delay: config.discovery_delay,
                response_delay: config.response_delay,
                connect_delay: config.connect_delay,
                stop_scan_delay: config.stop_scan_delay,
                stall_teardown: config.stall_teardown,
                fail_discovery: config.fail_discovery,
                connect_failures_remaining: AtomicU32::new(config.connect_failures),
                permissions: FakePermissions::new(
                    config.permission_granted,
                    config.grant_on_request,
                ),
                next_handle: AtomicU64::new(1),
                link_events,
                runtime: Mutex::new(FakeRuntime::default()),
            }),
        }
    }

    /// Returns the permission gate paired with this gateway.
    #[must_use]
    pub fn permissions(&self) -> FakePermissions {
        self.state.permissions.clone()
    }

    /// Returns a handle for driving the fake peripheral from tests.
    #[must_use]
    pub fn controller(&self) -> FakeController {
        FakeController {
            state: Arc::clone(&self.state),
        }
    }

    fn record(&self, call: FakeCall) {
        *self.state.runtime().calls.entry(call).or_default() += 1;
    }

    fn ensure_connected(&self, device: &DeviceId) -> bool {
        self.state.runtime().connected.contains(device)
    }

    fn service(&self, uuid: &str) -> Option<&(ServiceInfo, Vec<CharacteristicInfo>)> {
        self.state
            .services
            .iter()
            .find(|(service, _)| service.uuid().eq_ignore_ascii_case(uuid))
    }

    fn characteristic_exists(&self, characteristic: &CharacteristicId) -> bool {
        self.service(characteristic.service())
            .is_some_and(|(_, characteristics)| {
                characteristics
                    .iter()
                    .any(|candidate| candidate.id() == characteristic)
            })
    }

    async fn respond(&self) {
        delay(self.state.response_delay).await;
    }

    async fn stall_if_configured(&self) {
        if self.state.stall_teardown {
            std::future::pending::<()>().await;
        }
    }

    fn operation_error(characteristic: &CharacteristicId, reason: &str) -> GattError {
        GattError::Operation {
            characteristic: characteristic.clone(),
            reason: reason.to_string(),
        }
    }

    fn check_operation(
        &self,
        device: &DeviceId,
        characteristic: &CharacteristicId,
    ) -> Result<(), GattError> {
        if !self.ensure_connected(device) {
            return Err(Self::operation_error(
                characteristic,
                "device is not connected",
            ));
        }
        if !self.characteristic_exists(characteristic) {
            return Err(Self::operation_error(
                characteristic,
                "characteristic not found",
            ));
        }
        Ok(())
    }
}

impl FakeState {
    fn runtime(&self) -> MutexGuard<'_, FakeRuntime> {
        self.runtime
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl AdapterGateway for FakeGateway {
    #[instrument(skip(self), level = "debug")]
    async fn scan(&self, _timeout: Duration) -> Result<DeviceStream, GattError> {
        self.record(FakeCall::Scan);
        let devices = self.state.devices.clone();
        let discovery_delay = self.state.discovery_delay;
        let (sender, receiver) = mpsc::channel(devices.len().max(1));

        tokio::spawn(async move {
            delay(discovery_delay).await;
            for device in devices {
                if sender.send(device).await.is_err() {
                    break;
                }
            }
        });

        Ok(Box::pin(ReceiverStream::new(receiver)))
    }

    async fn stop_scan(&self) -> Result<(), GattError> {
        self.record(FakeCall::StopScan);
        delay(self.state.stop_scan_delay).await;
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(%device))]
    async fn connect(&self, device: &DeviceId) -> Result<(), GattError> {
        self.record(FakeCall::Connect);
        if !self
            .state
            .devices
            .iter()
            .any(|candidate| candidate.device_id() == device)
        {
            return Err(GattError::Connect {
                device_id: device.clone(),
                reason: "device is out of range".to_string(),
            });
        }

        delay(self.state.connect_delay).await;
        let failed = self
            .state
            .connect_failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if failed {
            return Err(GattError::Connect {
                device_id: device.clone(),
                reason: "fake connect failure".to_string(),
            });
        }

        self.state.runtime().connected.insert(device.clone());
        Ok(())
    }

    async fn disconnect(&self, device: &DeviceId) -> Result<(), GattError> {
        self.record(FakeCall::Disconnect);
        self.stall_if_configured().await;
        let mut runtime = self.state.runtime();
        runtime.connected.remove(device);
        runtime
            .subscriptions
            .retain(|_, subscription| &subscription.device != device);
        Ok(())
    }

    async fn discover_services(&self, device: &DeviceId) -> Result<Vec<ServiceInfo>, GattError> {
        self.record(FakeCall::DiscoverServices);
        if !self.ensure_connected(device) {
            return Err(GattError::Discover {
                reason: "device is not connected".to_string(),
            });
        }
        if self.state.fail_discovery {
            return Err(GattError::Discover {
                reason: "fake discovery failure".to_string(),
            });
        }

        Ok(self
            .state
            .services
            .iter()
            .map(|(service, _)| service.clone())
            .collect())
    }

    async fn discover_characteristics(
        &self,
        device: &DeviceId,
        service: &str,
    ) -> Result<Vec<CharacteristicInfo>, GattError> {
        self.record(FakeCall::DiscoverCharacteristics);
        if !self.ensure_connected(device) {
            return Err(GattError::Discover {
                reason: "device is not connected".to_string(),
            });
        }

        self.service(service)
            .map(|(_, characteristics)| characteristics.clone())
            .ok_or_else(|| GattError::Discover {
                reason: format!("service `{service}` not found"),
            })
    }

    async fn read(
        &self,
        device: &DeviceId,
        characteristic: &CharacteristicId,
    ) -> Result<Vec<u8>, GattError> {
        self.record(FakeCall::Read);
        self.check_operation(device, characteristic)?;
        self.respond().await;
        Ok(self.state.read_payload.clone())
    }

    async fn write(
        &self,
        device: &DeviceId,
        characteristic: &CharacteristicId,
        payload: &[u8],
        mode: WriteMode,
    ) -> Result<(), GattError> {
        self.record(FakeCall::Write);
        self.check_operation(device, characteristic)?;
        self.respond().await;
        self.state
            .runtime()
            .writes
            .push((characteristic.clone(), payload.to_vec(), mode));
        Ok(())
    }

    async fn subscribe(
        &self,
        device: &DeviceId,
        characteristic: &CharacteristicId,
        on_value: ValueCallback,
    ) -> Result<SubscriptionHandle, GattError> {
        self.record(FakeCall::Subscribe);
        self.check_operation(device, characteristic)?;

        let id = self.state.next_handle.fetch_add(1, Ordering::Relaxed);
        self.state.runtime().subscriptions.insert(
            id,
            FakeSubscription {
                device: device.clone(),
                characteristic: characteristic.clone(),
                callback: Arc::clone(&on_value),
            },
        );

        if !self.state.notifications.is_empty() {
            let payloads = self.state.notifications.clone();
            tokio::spawn(async move {
                for payload in payloads {
                    tokio::task::yield_now().await;
                    on_value(payload);
                }
            });
        }

        Ok(SubscriptionHandle::new(
            id,
            device.clone(),
            characteristic.clone(),
        ))
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), GattError> {
        self.record(FakeCall::Unsubscribe);
        self.stall_if_configured().await;
        self.state.runtime().subscriptions.remove(&handle.id());
        Ok(())
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.state.link_events.subscribe()
    }
}

/// Test handle that plays the peripheral's side of a fake gateway.
#[derive(Debug, Clone)]
pub struct FakeController {
    state: Arc<FakeState>,
}

impl FakeController {
    /// Pushes a value to every registration on `characteristic`; returns how many received it.
    pub fn notify(&self, characteristic: &CharacteristicId, payload: &[u8]) -> usize {
        let callbacks: Vec<ValueCallback> = self
            .state
            .runtime()
            .subscriptions
            .values()
            .filter(|subscription| &subscription.characteristic == characteristic)
            .map(|subscription| Arc::clone(&subscription.callback))
            .collect();

        for callback in &callbacks {
            callback(payload.to_vec());
        }
        callbacks.len()
    }

    /// Simulates the peripheral going out of range.
    pub fn drop_link(&self, device: &DeviceId) {
        {
            let mut runtime = self.state.runtime();
            runtime.connected.remove(device);
            runtime
                .subscriptions
                .retain(|_, subscription| &subscription.device != device);
        }
        if self
            .state
            .link_events
            .send(LinkEvent::Lost(device.clone()))
            .is_err()
        {
            debug!("no link-event listeners for fake link loss");
        }
    }

    /// Returns how many times a gateway operation was invoked.
    #[must_use]
    pub fn call_count(&self, call: FakeCall) -> usize {
        self.state
            .runtime()
            .calls
            .get(&call)
            .copied()
            .unwrap_or_default()
    }

    /// Returns the number of live notification registrations.
    #[must_use]
    pub fn active_subscriptions(&self) -> usize {
        self.state.runtime().subscriptions.len()
    }

    /// Returns every payload written so far.
    #[must_use]
    pub fn writes(&self) -> Vec<(CharacteristicId, Vec<u8>, WriteMode)> {
        self.state.runtime().writes.clone()
    }

    #[must_use]
    pub fn is_connected(&self, device: &DeviceId) -> bool {
        self.state.runtime().connected.contains(device)
    }
}

/// Permission gate whose answers come from the fake configuration.
#[derive(Debug, Clone)]
pub struct FakePermissions {
    granted: Arc<AtomicBool>,
    grant_on_request: bool,
}

impl FakePermissions {
    fn new(granted: bool, grant_on_request: bool) -> Self {
        Self {
            granted: Arc::new(AtomicBool::new(granted)),
            grant_on_request,
        }
    }
}

#[async_trait]
impl PermissionGate for FakePermissions {
    async fn has_permission(&self) -> bool {
        self.granted.load(Ordering::SeqCst)
    }

    async fn request_permission(&self) -> bool {
        if self.grant_on_request {
            self.granted.store(true, Ordering::SeqCst);
        }
        self.granted.load(Ordering::SeqCst)
    }
}

async fn delay(duration: Duration) {
    if !duration.is_zero() {
        sleep(duration).await;
    }
}

fn parse_scan_fixture(raw_fixture: &str) -> Result<Vec<FoundDevice>, FixtureError> {
    if raw_fixture.trim().is_empty() {
        return Err(FixtureError::EmptyFixture);
    }

    raw_fixture
        .split(';')
        .map(parse_scan_record)
        .collect::<Result<Vec<_>, _>>()
}

fn parse_scan_record(raw_record: &str) -> Result<FoundDevice, FixtureError> {
    let fields: Vec<&str> = raw_record.split('|').map(str::trim).collect();
    let [adapter, device_id, local_name, rssi] = fields.as_slice() else {
        return Err(FixtureError::InvalidRecordFieldCount);
    };
    if [adapter, device_id, local_name, rssi]
        .iter()
        .any(|field| field.is_empty())
    {
        return Err(FixtureError::EmptyRecordField);
    }

    let local_name = (*local_name != "-").then(|| (*local_name).to_string());
    let rssi = if *rssi == "-" {
        None
    } else {
        Some(rssi.parse::<i16>()?)
    };

    Ok(FoundDevice::new(*adapter, *device_id, local_name, rssi))
}

fn parse_gatt_fixture(
    raw_fixture: &str,
) -> Result<Vec<(ServiceInfo, Vec<CharacteristicInfo>)>, FixtureError> {
    let mut services: Vec<(ServiceInfo, Vec<CharacteristicInfo>)> = Vec::new();

    for record in raw_fixture.split(';').map(str::trim) {
        if record.is_empty() {
            continue;
        }
        let Some((path, properties)) = record.split_once('=') else {
            return Err(FixtureError::InvalidGattRecord {
                record: record.to_string(),
            });
        };
        let id: CharacteristicId = path.parse()?;
        let properties = parse_properties(properties)?;
        let characteristic = CharacteristicInfo::new(id.clone(), properties);

        match services
            .iter_mut()
            .find(|(service, _)| service.uuid() == id.service())
        {
            Some((_, characteristics)) => characteristics.push(characteristic),
            None => services.push((ServiceInfo::new(id.service(), true), vec![characteristic])),
        }
    }

    if services.is_empty() {
        return Err(FixtureError::EmptyFixture);
    }
    Ok(services)
}

fn parse_properties(raw_properties: &str) -> Result<Vec<String>, FixtureError> {
    raw_properties
        .split('+')
        .map(|property| property.trim().to_ascii_lowercase())
        .filter(|property| !property.is_empty())
        .map(|property| {
            if KNOWN_PROPERTIES.contains(&property.as_str()) {
                Ok(property)
            } else {
                Err(FixtureError::UnknownProperty { value: property })
            }
        })
        .collect()
}

fn parse_notifications(raw_value: &str) -> Result<Vec<Vec<u8>>, FixtureError> {
    if raw_value.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw_value.split(',').map(parse_hex).collect()
}

fn parse_hex(raw_value: &str) -> Result<Vec<u8>, FixtureError> {
    let cleaned: String = raw_value
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect();
    hex::decode(&cleaned).map_err(|error| match error {
        hex::FromHexError::InvalidHexCharacter { c, .. } => FixtureError::InvalidHexByte { value: c },
        hex::FromHexError::OddLength | hex::FromHexError::InvalidStringLength => {
            FixtureError::InvalidHexLength
        }
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("hci0|AA:BB|UART-Dev|-43", 1)]
    #[case("hci0|AA:BB|UART-Dev|-43;hci1|CC:DD|-|-", 2)]
    fn parse_scan_fixture_parses_records(#[case] fixture: &str, #[case] expected_count: usize) {
        let devices = parse_scan_fixture(fixture).expect("fixture should parse");
        assert_eq!(expected_count, devices.len());
    }

    #[test]
    fn parse_scan_fixture_keeps_missing_name_absent() {
        let devices = parse_scan_fixture("hci0|AA:BB|-|-").expect("fixture should parse");
        assert_eq!(None, devices[0].local_name());
        assert_eq!(None, devices[0].rssi());
    }

    #[test]
    fn parse_scan_fixture_rejects_invalid_field_count() {
        let result = parse_scan_fixture("hci0|AA:BB|UART-Dev");
        assert_matches!(result, Err(FixtureError::InvalidRecordFieldCount));
    }

    #[rstest]
    #[case("A", "odd")]
    #[case("0G", "char")]
    fn parse_hex_rejects_malformed_payloads(#[case] value: &str, #[case] kind: &str) {
        let result = parse_hex(value);
        match kind {
            "odd" => assert_matches!(result, Err(FixtureError::InvalidHexLength)),
            _ => assert_matches!(result, Err(FixtureError::InvalidHexByte { value: 'G' })),
        }
    }

    #[test]
    fn parse_hex_accepts_dashed_pairs() {
        assert_eq!(vec![0x01, 0x02, 0xAB], parse_hex("01-02 ab").expect("hex"));
    }

    #[test]
    fn parse_gatt_fixture_groups_characteristics_by_service() {
        let services = parse_gatt_fixture(DEFAULT_GATT_FIXTURE).expect("default fixture parses");

        let shape: Vec<(&str, usize)> = services
            .iter()
            .map(|(service, characteristics)| (service.name(), characteristics.len()))
            .collect();
        assert_eq!(
            vec![("Battery Service", 1), ("Nordic UART Service", 2)],
            shape
        );
    }

    #[test]
    fn parse_gatt_fixture_rejects_unknown_property() {
        let result = parse_gatt_fixture("180f/2a19=read+teleport");
        assert_matches!(
            result,
            Err(FixtureError::UnknownProperty { value }) if value == "teleport"
        );
    }

    #[tokio::test]
    async fn connect_failures_are_consumed_before_success() {
        let gateway = FakeGateway::new(
            FakeGatewayConfig::builder()
                .scan_fixture("hci0|AA:BB|UART-Dev|-43".parse().expect("fixture"))
                .connect_failures(1)
                .build(),
        );
        let device = DeviceId::from("AA:BB");

        assert_matches!(
            gateway.connect(&device).await,
            Err(GattError::Connect { .. })
        );
        assert_matches!(gateway.connect(&device).await, Ok(()));
        assert!(gateway.controller().is_connected(&device));
    }
}
