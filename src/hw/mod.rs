mod btleplug_backend;
mod fake_backend;
mod gateway;
mod model;

pub use self::fake_backend::{
    FakeCall, FakeController, FakeGateway, FakeGatewayConfig, FakePermissions, GattFixture,
    HexPayload, NotificationPayloads, ScanFixture,
};
pub use self::gateway::{
    AdapterGateway, AlwaysGranted, ConnectedGateway, DeviceStream, GatewayBackend, LinkEvent,
    PermissionGate, SubscriptionHandle, ValueCallback, WriteMode, gateway_from_backend,
};
pub use self::model::{
    Capabilities, CharacteristicId, CharacteristicInfo, ConnectionState, DeviceId, FoundDevice,
    ServiceInfo,
};
