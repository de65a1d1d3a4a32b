mod app;
mod catalog;
mod cli;
mod codec;
mod error;
mod gatt_names;
mod hub;
mod hw;
mod session;
mod telemetry;
mod terminal;
mod utils;

pub use app::{
    DeviceSelector, RunSettings, SessionHandler, fake_backend, real_backend, run,
    run_with_clients, run_with_log_level,
};
pub use catalog::{CatalogDevice, DiscoveryCatalog, Entity, EntityId};
pub use cli::{
    Args, Command, FakeArgs, ListenArgs, LogLevel, OutputFormat, ReadArgs, ScanArgs, TargetArgs,
    WriteArgs, WritePayload,
};
pub use codec::{DecodedValue, decode_display, encode_utf8};
pub use error::{FixtureError, GattError, ParseCharacteristicIdError};
pub use hub::{ValueEvent, ValueObserver};
pub use hw::{
    AdapterGateway, AlwaysGranted, Capabilities, CharacteristicId, CharacteristicInfo,
    ConnectedGateway, ConnectionState, DeviceId, DeviceStream, FakeCall, FakeController,
    FakeGateway, FakeGatewayConfig, FakePermissions, FoundDevice, GattFixture, GatewayBackend,
    HexPayload, LinkEvent, NotificationPayloads, PermissionGate, ScanFixture, ServiceInfo,
    SubscriptionHandle, ValueCallback, WriteMode, gateway_from_backend,
};
pub use session::{
    GattSession, ScanResults, SessionConfig, SessionEvent, SessionState, SessionStateMachine,
    Transition,
};
pub use terminal::{SystemTerminalClient, TerminalClient};
