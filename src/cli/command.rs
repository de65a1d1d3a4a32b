use std::time::Duration;

use bon::Builder;
use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use tracing_subscriber::filter::LevelFilter;

use crate::error::{CliConfigError, FixtureError};
use crate::hw::{
    CharacteristicId, DeviceId, FakeGatewayConfig, GattFixture, HexPayload, NotificationPayloads,
    ScanFixture,
};
use crate::session::SessionConfig;

/// Command-line options for the GATT explorer.
#[derive(Debug, Parser)]
#[command(
    name = "gattwalk",
    about = "Scan for BLE peripherals, browse their GATT tables and exchange values."
)]
pub struct Args {
    /// Overrides `RUST_LOG` with a single level.
    #[arg(long, global = true, value_enum)]
    log_level: Option<LogLevel>,
    /// Output format. Defaults to `pretty` on a terminal and `json` otherwise.
    #[arg(long, global = true, value_enum)]
    output: Option<OutputFormat>,
    /// Upper bound for each gateway call other than connect (e.g. `5s`).
    #[arg(long, global = true, value_parser = parse_duration)]
    operation_timeout: Option<Duration>,
    /// Upper bound for establishing a connection.
    #[arg(long, global = true, value_parser = parse_duration)]
    connect_timeout: Option<Duration>,
    /// How long a scan runs.
    #[arg(long, global = true, value_parser = parse_duration)]
    scan_timeout: Option<Duration>,
    /// Uses the fake BLE backend with fixture-driven discovery and payloads.
    #[arg(long, global = true)]
    fake: bool,
    /// Fake scan fixtures in the form `adapter|device_id|local_name|rssi;...`.
    #[arg(long, global = true, requires = "fake", required_if_eq("fake", "true"))]
    fake_scan: Option<ScanFixture>,
    /// Fake GATT table in the form `service/characteristic=prop+prop;...`.
    #[arg(long, global = true, requires = "fake")]
    fake_gatt: Option<GattFixture>,
    /// Fake value returned by every read, as hexadecimal bytes.
    #[arg(long, global = true, requires = "fake")]
    fake_read: Option<HexPayload>,
    /// Fake notification payloads as comma-separated hexadecimal payloads.
    #[arg(long, global = true, requires = "fake")]
    fake_notifications: Option<NotificationPayloads>,
    /// Artificial fake scan delay (e.g. `250ms`, `2s`).
    #[arg(long, global = true, requires = "fake", value_parser = parse_duration)]
    fake_discovery_delay: Option<Duration>,
    /// Artificial fake read and write delay.
    #[arg(long, global = true, requires = "fake", value_parser = parse_duration)]
    fake_response_delay: Option<Duration>,
    /// Artificial fake connect delay.
    #[arg(long, global = true, requires = "fake", value_parser = parse_duration)]
    fake_connect_delay: Option<Duration>,
    /// Number of fake connect attempts that fail before one succeeds.
    #[arg(long, global = true, requires = "fake")]
    fake_connect_failures: Option<u32>,
    /// Makes the fake host refuse scan permission.
    #[arg(long, global = true, requires = "fake")]
    fake_deny_permission: bool,
    #[command(subcommand)]
    command: Command,
}

impl Args {
    /// Creates argument values directly without CLI parsing.
    ///
    /// ```
    /// use gattwalk::{Args, Command, ScanArgs};
    ///
    /// let scan = Args::new(Command::Scan(ScanArgs::default()));
    /// let _ = scan;
    /// ```
    #[must_use]
    pub fn new(command: Command) -> Self {
        Self {
            log_level: None,
            output: None,
            operation_timeout: None,
            connect_timeout: None,
            scan_timeout: None,
            fake: false,
            fake_scan: None,
            fake_gatt: None,
            fake_read: None,
            fake_notifications: None,
            fake_discovery_delay: None,
            fake_response_delay: None,
            fake_connect_delay: None,
            fake_connect_failures: None,
            fake_deny_permission: false,
            command,
        }
    }

    /// Enables fake backend mode with pre-parsed fake configuration.
    #[must_use]
    pub fn with_fake(mut self, fake: FakeArgs) -> Self {
        let FakeArgs {
            scan_fixture,
            gatt,
            initial_read,
            notifications,
            discovery_delay,
            response_delay,
            connect_delay,
            connect_failures,
            deny_permission,
        } = fake;

        self.fake = true;
        self.fake_scan = Some(scan_fixture);
        self.fake_gatt = gatt;
        self.fake_read = initial_read;
        self.fake_notifications = notifications;
        self.fake_discovery_delay = Some(discovery_delay);
        self.fake_response_delay = Some(response_delay);
        self.fake_connect_delay = Some(connect_delay);
        self.fake_connect_failures = Some(connect_failures);
        self.fake_deny_permission = deny_permission;
        self
    }

    #[must_use]
    pub fn log_level(&self) -> Option<LogLevel> {
        self.log_level
    }

    #[must_use]
    pub fn output_format(&self) -> Option<OutputFormat> {
        self.output
    }

    /// Builds session tunables from the timeout flags.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        let defaults = SessionConfig::default();
        SessionConfig::builder()
            .operation_timeout(self.operation_timeout.unwrap_or(defaults.operation_timeout))
            .connect_timeout(self.connect_timeout.unwrap_or(defaults.connect_timeout))
            .scan_timeout(self.scan_timeout.unwrap_or(defaults.scan_timeout))
            .build()
    }

    /// Splits parsed CLI arguments into command and optional fake-gateway settings.
    ///
    /// # Errors
    ///
    /// Returns an error if CLI backend configuration is invalid.
    pub fn into_command_and_fake_args(self) -> anyhow::Result<(Command, Option<FakeArgs>)> {
        let Args {
            fake,
            fake_scan,
            fake_gatt,
            fake_read,
            fake_notifications,
            fake_discovery_delay,
            fake_response_delay,
            fake_connect_delay,
            fake_connect_failures,
            fake_deny_permission,
            command,
            ..
        } = self;

        let fake_args = if fake {
            let Some(scan_fixture) = fake_scan else {
                return Err(CliConfigError::MissingFakeScanFixture.into());
            };
            Some(FakeArgs {
                scan_fixture,
                gatt: fake_gatt,
                initial_read: fake_read,
                notifications: fake_notifications,
                discovery_delay: fake_discovery_delay.unwrap_or(Duration::ZERO),
                response_delay: fake_response_delay.unwrap_or(Duration::ZERO),
                connect_delay: fake_connect_delay.unwrap_or(Duration::ZERO),
                connect_failures: fake_connect_failures.unwrap_or_default(),
                deny_permission: fake_deny_permission,
            })
        } else {
            None
        };

        Ok((command, fake_args))
    }
}

/// Fake backend arguments for programmatic runs.
#[derive(Debug, Builder)]
#[builder(derive(Debug))]
pub struct FakeArgs {
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    scan_fixture: ScanFixture,
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    gatt: Option<GattFixture>,
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    initial_read: Option<HexPayload>,
    #[builder(with = |value: &str| -> std::result::Result<_, FixtureError> { value.parse() })]
    notifications: Option<NotificationPayloads>,
    #[builder(default)]
    discovery_delay: Duration,
    #[builder(default)]
    response_delay: Duration,
    #[builder(default)]
    connect_delay: Duration,
    #[builder(default)]
    connect_failures: u32,
    #[builder(default)]
    deny_permission: bool,
}

impl FakeArgs {
    pub(crate) fn into_gateway_config(self) -> FakeGatewayConfig {
        let Self {
            scan_fixture,
            gatt,
            initial_read,
            notifications,
            discovery_delay,
            response_delay,
            connect_delay,
            connect_failures,
            deny_permission,
        } = self;

        FakeGatewayConfig::builder()
            .scan_fixture(scan_fixture)
            .maybe_gatt_fixture(gatt)
            .maybe_read_payload(initial_read)
            .maybe_notifications(notifications)
            .discovery_delay(discovery_delay)
            .response_delay(response_delay)
            .connect_delay(connect_delay)
            .connect_failures(connect_failures)
            .permission_granted(!deny_permission)
            .grant_on_request(!deny_permission)
            .build()
    }
}

/// Log level accepted by `--log-level`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub(crate) fn as_level_filter(self) -> LevelFilter {
        match self {
            Self::Error => LevelFilter::ERROR,
            Self::Warn => LevelFilter::WARN,
            Self::Info => LevelFilter::INFO,
            Self::Debug => LevelFilter::DEBUG,
            Self::Trace => LevelFilter::TRACE,
        }
    }
}

/// Rendering used for command results.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    /// Coloured tables for people.
    #[default]
    Pretty,
    /// JSON documents for scripts.
    Json,
}

/// Supported CLI commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Scan for nearby peripherals and list them.
    Scan(ScanArgs),
    /// Connect to a peripheral and print its services, characteristics and descriptors.
    Inspect(TargetArgs),
    /// Connect to a peripheral and read one characteristic.
    Read(ReadArgs),
    /// Connect to a peripheral and write one characteristic.
    Write(WriteArgs),
    /// Connect to a peripheral and print notifications from one characteristic.
    Listen(ListenArgs),
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Scan(_) => "scan",
            Self::Inspect(_) => "inspect",
            Self::Read(_) => "read",
            Self::Write(_) => "write",
            Self::Listen(_) => "listen",
        }
    }
}

/// Arguments for the `scan` command.
#[derive(Debug, Default, clap::Args)]
pub struct ScanArgs {
    /// Only list devices whose advertised name starts with this prefix.
    #[arg(long)]
    name_prefix: Option<String>,
}

impl ScanArgs {
    #[must_use]
    pub fn with_name_prefix(name_prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: Some(name_prefix.into()),
        }
    }

    pub(crate) fn name_prefix(&self) -> Option<&str> {
        self.name_prefix.as_deref()
    }
}

/// Selects the peripheral a command connects to.
///
/// Without `--device` or `--name-prefix` the first discovered device is used.
#[derive(Debug, Clone, Default, clap::Args)]
#[command(group(ArgGroup::new("target").args(["device", "name_prefix"])))]
pub struct TargetArgs {
    /// Backend-specific device identifier as printed by `scan`.
    #[arg(long)]
    device: Option<DeviceId>,
    /// Connects to the first device whose advertised name starts with this prefix.
    #[arg(long)]
    name_prefix: Option<String>,
    /// Extra connect attempts after a failed or timed-out connect.
    #[arg(long, default_value_t = 0)]
    connect_retries: u32,
}

impl TargetArgs {
    #[must_use]
    pub fn device(device: impl Into<DeviceId>) -> Self {
        Self {
            device: Some(device.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn name_prefix(name_prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: Some(name_prefix.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_connect_retries(mut self, connect_retries: u32) -> Self {
        self.connect_retries = connect_retries;
        self
    }

    pub(crate) fn selected_device(&self) -> Option<&DeviceId> {
        self.device.as_ref()
    }

    pub(crate) fn selected_name_prefix(&self) -> Option<&str> {
        self.name_prefix.as_deref()
    }

    pub(crate) fn connect_retries(&self) -> u32 {
        self.connect_retries
    }
}

/// Arguments for the `read` command.
#[derive(Debug, clap::Args)]
pub struct ReadArgs {
    #[command(flatten)]
    target: TargetArgs,
    /// Characteristic as `<service-uuid>/<characteristic-uuid>`; 16-bit UUIDs are expanded.
    #[arg(long)]
    characteristic: CharacteristicId,
}

impl ReadArgs {
    #[must_use]
    pub fn new(target: TargetArgs, characteristic: CharacteristicId) -> Self {
        Self {
            target,
            characteristic,
        }
    }

    pub(crate) fn target(&self) -> &TargetArgs {
        &self.target
    }

    pub(crate) fn characteristic(&self) -> &CharacteristicId {
        &self.characteristic
    }
}

/// Payload for the `write` command.
#[derive(Debug, Clone)]
pub enum WritePayload {
    Text(String),
    Bytes(Vec<u8>),
}

/// Arguments for the `write` command.
#[derive(Debug, clap::Args)]
#[command(group(ArgGroup::new("payload").required(true).args(["text", "hex"])))]
pub struct WriteArgs {
    #[command(flatten)]
    target: TargetArgs,
    #[arg(long)]
    characteristic: CharacteristicId,
    /// Text sent as UTF-8.
    #[arg(long)]
    text: Option<String>,
    /// Raw bytes as hexadecimal, e.g. `01-02` or `0102`.
    #[arg(long)]
    hex: Option<HexPayload>,
}

impl WriteArgs {
    #[must_use]
    pub fn new(target: TargetArgs, characteristic: CharacteristicId, payload: WritePayload) -> Self {
        let (text, hex) = match payload {
            WritePayload::Text(text) => (Some(text), None),
            WritePayload::Bytes(bytes) => (None, Some(HexPayload::from_bytes(bytes))),
        };
        Self {
            target,
            characteristic,
            text,
            hex,
        }
    }

    pub(crate) fn target(&self) -> &TargetArgs {
        &self.target
    }

    pub(crate) fn characteristic(&self) -> &CharacteristicId {
        &self.characteristic
    }

    pub(crate) fn payload(&self) -> WritePayload {
        match (&self.text, &self.hex) {
            (Some(text), _) => WritePayload::Text(text.clone()),
            (None, Some(hex)) => WritePayload::Bytes(hex.bytes().to_vec()),
            (None, None) => WritePayload::Bytes(Vec::new()),
        }
    }
}

/// Arguments for the `listen` command.
#[derive(Debug, clap::Args)]
pub struct ListenArgs {
    #[command(flatten)]
    target: TargetArgs,
    #[arg(long)]
    characteristic: CharacteristicId,
    /// Stop after this many notifications. If omitted, listen until Ctrl+C.
    #[arg(long)]
    max_notifications: Option<usize>,
}

impl ListenArgs {
    #[must_use]
    pub fn new(
        target: TargetArgs,
        characteristic: CharacteristicId,
        max_notifications: Option<usize>,
    ) -> Self {
        Self {
            target,
            characteristic,
            max_notifications,
        }
    }

    pub(crate) fn target(&self) -> &TargetArgs {
        &self.target
    }

    pub(crate) fn characteristic(&self) -> &CharacteristicId {
        &self.characteristic
    }

    pub(crate) fn max_notifications(&self) -> Option<usize> {
        self.max_notifications
    }
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|error| error.to_string())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use clap::error::ErrorKind;
    use pretty_assertions::assert_eq;

    use super::*;

    const SCAN: &str = "hci0|AA:BB:CC|UART-Dev|-43";

    #[test]
    fn fake_mode_requires_scan_fixture() {
        let result = Args::try_parse_from(["gattwalk", "--fake", "scan"]);

        let error = result.expect_err("missing --fake-scan should fail argument parsing");
        assert_eq!(ErrorKind::MissingRequiredArgument, error.kind());
    }

    #[test]
    fn fake_fixture_flags_require_fake_mode() {
        let result = Args::try_parse_from(["gattwalk", "--fake-read", "DEADBEEF", "scan"]);

        let error = result.expect_err("fake payload flags should require --fake");
        assert_eq!(ErrorKind::MissingRequiredArgument, error.kind());
    }

    #[test]
    fn fake_mode_builds_fake_settings() {
        let cli = Args::try_parse_from([
            "gattwalk",
            "--fake",
            "--fake-scan",
            SCAN,
            "--fake-connect-failures",
            "2",
            "inspect",
            "--name-prefix",
            "UART",
        ])
        .expect("valid fake arguments should parse");

        let (command, fake_args) = cli
            .into_command_and_fake_args()
            .expect("valid fake arguments should resolve fake settings");
        assert_matches!(command, Command::Inspect(target) if target.selected_name_prefix() == Some("UART"));
        assert_matches!(fake_args, Some(FakeArgs { connect_failures: 2, .. }));
    }

    #[test]
    fn device_and_name_prefix_are_mutually_exclusive() {
        let result = Args::try_parse_from([
            "gattwalk",
            "inspect",
            "--device",
            "AA:BB:CC",
            "--name-prefix",
            "UART",
        ]);

        let error = result.expect_err("two selectors should conflict");
        assert_eq!(ErrorKind::ArgumentConflict, error.kind());
    }

    #[test]
    fn write_requires_a_payload() {
        let result = Args::try_parse_from([
            "gattwalk",
            "write",
            "--characteristic",
            "180f/2a19",
        ]);

        let error = result.expect_err("write without payload should fail");
        assert_eq!(ErrorKind::MissingRequiredArgument, error.kind());
    }

    #[test]
    fn characteristic_flag_expands_short_uuids() {
        let cli = Args::try_parse_from([
            "gattwalk",
            "read",
            "--characteristic",
            "180F/2A19",
        ])
        .expect("read arguments should parse");

        let (command, _) = cli
            .into_command_and_fake_args()
            .expect("real backend needs no fake settings");
        let Command::Read(args) = command else {
            panic!("expected read command");
        };
        assert_eq!(
            "0000180f-0000-1000-8000-00805f9b34fb/00002a19-0000-1000-8000-00805f9b34fb",
            args.characteristic().to_string()
        );
    }

    #[test]
    fn timeout_flags_feed_session_config() {
        let cli = Args::try_parse_from([
            "gattwalk",
            "--operation-timeout",
            "250ms",
            "--connect-timeout",
            "2s",
            "scan",
        ])
        .expect("timeouts should parse");

        let config = cli.session_config();
        assert_eq!(Duration::from_millis(250), config.operation_timeout);
        assert_eq!(Duration::from_secs(2), config.connect_timeout);
        assert_eq!(SessionConfig::default().scan_timeout, config.scan_timeout);
    }
}
