use std::time::Duration;

use thiserror::Error;

use crate::hw::{CharacteristicId, DeviceId};

/// Errors returned by GATT session and adapter operations.
#[derive(Debug, Error)]
pub enum GattError {
    #[error("BLE adapter initialisation failed: {0}")]
    Ble(#[from] btleplug::Error),
    #[error("no BLE adapters were found")]
    NoAdapters,
    #[error("permission to scan for BLE devices was denied")]
    PermissionDenied,
    #[error("BLE scan failed: {reason}")]
    Scan { reason: String },
    #[error("failed to connect to `{device_id}`: {reason}")]
    Connect { device_id: DeviceId, reason: String },
    #[error("failed to disconnect from `{device_id}`: {reason}")]
    Disconnect { device_id: DeviceId, reason: String },
    #[error("GATT discovery failed: {reason}")]
    Discover { reason: String },
    #[error("GATT operation on `{characteristic}` failed: {reason}")]
    Operation {
        characteristic: CharacteristicId,
        reason: String,
    },
    #[error("characteristic `{characteristic}` does not support read")]
    NotReadable { characteristic: CharacteristicId },
    #[error("characteristic `{characteristic}` does not support write")]
    NotWritable { characteristic: CharacteristicId },
    #[error("characteristic `{characteristic}` does not support notify")]
    NotNotifiable { characteristic: CharacteristicId },
    #[error("no device is connected")]
    NotConnected,
    #[error("already connected to `{device_id}`; disconnect first")]
    AlreadyConnected { device_id: DeviceId },
    #[error(
        "{operation} did not complete within {limit}",
        limit = humantime::format_duration(*timeout)
    )]
    OperationTimeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("the connection to the device was lost")]
    ConnectionLost,
    #[error("device `{device_id}` has not been discovered")]
    UnknownDevice { device_id: DeviceId },
    #[error("service `{service}` has not been discovered on the connected device")]
    UnknownService { service: String },
    #[error("characteristic `{characteristic}` has not been discovered on the connected device")]
    UnknownCharacteristic { characteristic: CharacteristicId },
    #[error("characteristic `{characteristic}` has no active subscription")]
    NotSubscribed { characteristic: CharacteristicId },
    #[error("cannot {event} while the session is {state}")]
    InvalidTransition { state: String, event: String },
    #[error("no device matching {selector} was found before the scan ended")]
    NoMatchingDevice { selector: String },
    #[error("failed while waiting for Ctrl+C")]
    CtrlC { source: std::io::Error },
    #[error(transparent)]
    Fixture(#[from] FixtureError),
}

/// Errors returned when parsing a textual characteristic identifier.
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ParseCharacteristicIdError {
    #[error("`{value}` is not in the form `<service>/<characteristic>`")]
    MissingSeparator { value: String },
    #[error("`{value}` has an empty service or characteristic UUID")]
    EmptyComponent { value: String },
}

/// Errors returned when parsing fake gateway fixtures.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("the fake discovery fixture is empty")]
    EmptyFixture,
    #[error("fixture records must contain four pipe-delimited fields")]
    InvalidRecordFieldCount,
    #[error("fixture records cannot contain empty mandatory fields")]
    EmptyRecordField,
    #[error("failed to parse RSSI value")]
    InvalidRssi(#[from] std::num::ParseIntError),
    #[error("hex payload length must be even")]
    InvalidHexLength,
    #[error("hex payload contains invalid character `{value}`")]
    InvalidHexByte { value: char },
    #[error("GATT fixture record `{record}` must look like `service/characteristic=props`")]
    InvalidGattRecord { record: String },
    #[error("unknown characteristic property `{value}`")]
    UnknownProperty { value: String },
    #[error(transparent)]
    InvalidCharacteristicId(#[from] ParseCharacteristicIdError),
}

/// Errors returned when validating runtime backend options.
#[derive(Debug, Error)]
pub(crate) enum CliConfigError {
    #[error("missing fake scan fixture while fake mode is enabled")]
    MissingFakeScanFixture,
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub(crate) enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}
