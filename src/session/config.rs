use std::time::Duration;

use bon::Builder;

const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Tunables for a [`super::GattSession`].
#[derive(Debug, Clone, Copy, Builder)]
pub struct SessionConfig {
    /// Upper bound for every gateway call other than connect.
    #[builder(default = DEFAULT_OPERATION_TIMEOUT)]
    pub operation_timeout: Duration,
    #[builder(default = DEFAULT_CONNECT_TIMEOUT)]
    pub connect_timeout: Duration,
    /// How long a scan runs before the gateway ends it.
    #[builder(default = DEFAULT_SCAN_TIMEOUT)]
    pub scan_timeout: Duration,
    /// Buffered notifications per broadcast subscriber before it starts lagging.
    #[builder(default = DEFAULT_EVENT_CAPACITY)]
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
