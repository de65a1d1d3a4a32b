use serde::Serialize;

use crate::error::GattError;
use crate::hw::DeviceId;

/// Lifecycle of a GATT session.
#[derive(Debug, Clone, Default, Eq, PartialEq, Serialize, derive_more::Display)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    #[display("idle")]
    Idle,
    #[display("scanning")]
    Scanning,
    #[display("connecting to {_0}")]
    Connecting(DeviceId),
    #[display("connected to {_0}")]
    Connected(DeviceId),
    #[display("failed ({_0})")]
    Failed(String),
    #[display("disconnected")]
    Disconnected,
}

impl SessionState {
    /// Returns the device the session is bound to, if any.
    #[must_use]
    pub fn device(&self) -> Option<&DeviceId> {
        match self {
            Self::Connecting(device) | Self::Connected(device) => Some(device),
            _ => None,
        }
    }

    /// Returns the connected device, if the session is connected.
    #[must_use]
    pub fn connected_device(&self) -> Option<&DeviceId> {
        match self {
            Self::Connected(device) => Some(device),
            _ => None,
        }
    }
}

/// Inputs that drive [`SessionStateMachine`].
#[derive(Debug, Clone, Eq, PartialEq, derive_more::Display)]
pub enum SessionEvent {
    #[display("start a scan")]
    StartScan,
    #[display("stop the scan")]
    StopScan,
    #[display("finish the scan")]
    ScanEnded,
    #[display("select {_0}")]
    SelectDevice(DeviceId),
    #[display("complete the connection")]
    ConnectSucceeded,
    #[display("fail the connection")]
    ConnectFailed(String),
    #[display("disconnect")]
    Disconnect,
    #[display("handle a lost link")]
    LinkLost,
}

/// Result of applying an event.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Transition {
    /// The state changed from `from` to the machine's current state.
    Moved { from: SessionState },
    /// The event was accepted but the state is unchanged.
    Unchanged,
}

/// Pure transition table for the session lifecycle.
#[derive(Debug, Clone, Default)]
pub struct SessionStateMachine {
    state: SessionState,
}

impl SessionStateMachine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Applies `event`, leaving the state untouched when it is rejected.
    ///
    /// # Errors
    ///
    /// Returns [`GattError::AlreadyConnected`] when selecting a second device
    /// while bound to one, and [`GattError::NotConnected`] when disconnecting
    /// an unbound session. Every other illegal event yields
    /// [`GattError::InvalidTransition`].
    pub fn apply(&mut self, event: SessionEvent) -> Result<Transition, GattError> {
        use SessionState as S;

        let next = match (&self.state, &event) {
            (S::Idle | S::Failed(_) | S::Disconnected, SessionEvent::StartScan) => S::Scanning,
            (S::Scanning, SessionEvent::StopScan | SessionEvent::ScanEnded) => S::Idle,
            (
                S::Idle | S::Scanning | S::Failed(_) | S::Disconnected,
                SessionEvent::SelectDevice(device),
            ) => S::Connecting(device.clone()),
            (S::Connected(current), SessionEvent::SelectDevice(device)) if current == device => {
                return Ok(Transition::Unchanged);
            }
            (S::Connecting(current) | S::Connected(current), SessionEvent::SelectDevice(device))
                if current != device =>
            {
                return Err(GattError::AlreadyConnected {
                    device_id: current.clone(),
                });
            }
            (S::Connecting(device), SessionEvent::ConnectSucceeded) => S::Connected(device.clone()),
            (S::Connecting(_), SessionEvent::ConnectFailed(reason)) => S::Failed(reason.clone()),
            (S::Connecting(_) | S::Connected(_), SessionEvent::Disconnect | SessionEvent::LinkLost) => {
                S::Disconnected
            }
            (_, SessionEvent::Disconnect) => return Err(GattError::NotConnected),
            (state, event) => {
                return Err(GattError::InvalidTransition {
                    state: state.to_string(),
                    event: event.to_string(),
                });
            }
        };

        let from = std::mem::replace(&mut self.state, next);
        Ok(Transition::Moved { from })
    }
}
