use std::fmt;
use std::io;
use std::sync::Arc;

use anyhow::Result;
use bon::Builder;
use owo_colors::OwoColorize;
use tokio_stream::StreamExt;
use tracing::{debug, info, instrument, warn};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cli::ui::Painter;
use crate::cli::{Command, FakeArgs, LogLevel, OutputFormat, TargetArgs};
use crate::error::GattError;
use crate::hw::{DeviceId, FoundDevice, GatewayBackend, gateway_from_backend};
use crate::session::{GattSession, SessionConfig};
use crate::telemetry;
use crate::terminal::{SystemTerminalClient, TerminalClient};

/// Selects the real BLE backend.
#[must_use]
pub fn real_backend() -> GatewayBackend {
    GatewayBackend::Real
}

/// Selects the fixture-driven fake BLE backend.
#[must_use]
pub fn fake_backend(fake_args: FakeArgs) -> GatewayBackend {
    GatewayBackend::Fake(fake_args.into_gateway_config())
}

/// Which scanned device a [`SessionHandler`] connects to.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub enum DeviceSelector {
    /// The first device the scan reports.
    #[default]
    FirstFound,
    Id(DeviceId),
    NamePrefix(String),
}

impl DeviceSelector {
    fn matches(&self, device: &FoundDevice) -> bool {
        match self {
            Self::FirstFound => true,
            Self::Id(device_id) => device.device_id() == device_id,
            Self::NamePrefix(prefix) => device.local_name_starts_with(prefix),
        }
    }
}

impl fmt::Display for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FirstFound => write!(f, "any device"),
            Self::Id(device_id) => write!(f, "id `{device_id}`"),
            Self::NamePrefix(prefix) => write!(f, "name prefix `{prefix}`"),
        }
    }
}

/// Session-level app helper for acquiring a connected, fully discovered peripheral.
#[derive(Debug)]
pub struct SessionHandler {
    session: Arc<GattSession>,
    selector: DeviceSelector,
    connect_retries: u32,
}

impl SessionHandler {
    /// Creates a handler that connects to the first device found.
    ///
    /// ```
    /// use std::sync::Arc;
    ///
    /// use gattwalk::{FakeGateway, FakeGatewayConfig, GattSession, SessionConfig, SessionHandler};
    ///
    /// let gateway = FakeGateway::new(
    ///     FakeGatewayConfig::builder()
    ///         .scan_fixture("hci0|AA:BB|UART-Dev|-43".parse().unwrap())
    ///         .build(),
    /// );
    /// let session = Arc::new(GattSession::new(Arc::new(gateway), SessionConfig::default()));
    /// let handler = SessionHandler::new(session).with_name_prefix("UART");
    /// let _ = handler;
    /// ```
    #[must_use]
    pub fn new(session: Arc<GattSession>) -> Self {
        Self {
            session,
            selector: DeviceSelector::FirstFound,
            connect_retries: 0,
        }
    }

    /// Connects to the device with this identifier.
    #[must_use]
    pub fn with_device(mut self, device_id: impl Into<DeviceId>) -> Self {
        self.selector = DeviceSelector::Id(device_id.into());
        self
    }

    /// Connects to the first device whose advertised name starts with `name_prefix`.
    #[must_use]
    pub fn with_name_prefix(mut self, name_prefix: impl Into<String>) -> Self {
        self.selector = DeviceSelector::NamePrefix(name_prefix.into());
        self
    }

    /// Retries a failed or timed-out connect up to `connect_retries` more times.
    #[must_use]
    pub fn with_connect_retries(mut self, connect_retries: u32) -> Self {
        self.connect_retries = connect_retries;
        self
    }

    pub(crate) fn from_target(session: Arc<GattSession>, target: &TargetArgs) -> Self {
        let handler = Self::new(session).with_connect_retries(target.connect_retries());
        match (target.selected_device(), target.selected_name_prefix()) {
            (Some(device_id), _) => handler.with_device(device_id.clone()),
            (None, Some(prefix)) => handler.with_name_prefix(prefix),
            (None, None) => handler,
        }
    }

    /// Scans for the selected device, connects and discovers its whole GATT table.
    ///
    /// # Errors
    ///
    /// Returns [`GattError::NoMatchingDevice`] when the scan ends without a
    /// match, the last connect error once retries are exhausted, or the first
    /// discovery error.
    #[instrument(skip(self), level = "info", fields(selector = %self.selector))]
    pub async fn connect(self) -> Result<Arc<GattSession>, GattError> {
        let span = tracing::Span::current();
        span.pb_set_message(&format!("Scanning for {}", self.selector));

        match self.connect_inner().await {
            Ok(session) => {
                span.pb_set_finish_message(&format!("{} Connected", "✓".green()));
                Ok(session)
            }
            Err(error) => {
                span.pb_set_finish_message(&format!("{} Connection failed", "✗".red()));
                Err(error)
            }
        }
    }

    async fn connect_inner(self) -> Result<Arc<GattSession>, GattError> {
        let Self {
            session,
            selector,
            connect_retries,
        } = self;

        let mut scan = session.start_scan().await?;
        let mut target = None;
        while let Some(device) = scan.next().await {
            if selector.matches(&device) {
                target = Some(device.device_id().clone());
                break;
            }
        }
        drop(scan);

        let Some(target) = target else {
            return Err(GattError::NoMatchingDevice {
                selector: selector.to_string(),
            });
        };

        let mut attempt = 0;
        loop {
            match session.select_device(&target).await {
                Ok(()) => break,
                Err(error @ (GattError::Connect { .. } | GattError::OperationTimeout { .. }))
                    if attempt < connect_retries =>
                {
                    attempt += 1;
                    warn!(attempt, %error, "connect failed; retrying");
                }
                Err(error) => return Err(error),
            }
        }

        if let Err(error) = session.discover_all().await {
            if let Err(disconnect_error) = session.disconnect().await {
                debug!(%disconnect_error, "failed to disconnect after discovery failed");
            }
            return Err(error);
        }
        info!(device = %target, "connected and discovered GATT table");
        Ok(session)
    }
}

/// Settings shared by every command run.
#[derive(Debug, Clone, Copy, Default, Builder)]
pub struct RunSettings {
    log_level: Option<LogLevel>,
    #[builder(default)]
    output_format: OutputFormat,
    #[builder(default)]
    session_config: SessionConfig,
}

/// Runs the CLI command against the selected backend with default settings.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// let args = gattwalk::Args::try_parse_from([
///     "gattwalk",
///     "--fake",
///     "--fake-scan",
///     "hci0|AA:BB:CC|UART-Dev|-43",
///     "scan",
/// ])?;
/// let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
/// let backend = match maybe_fake_args {
///     Some(fake_args) => gattwalk::fake_backend(fake_args),
///     None => gattwalk::real_backend(),
/// };
/// let mut out = Vec::new();
/// gattwalk::run(command, &mut out, backend).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction fails, or
/// output writing fails.
pub async fn run<W>(command: Command, out: &mut W, backend: GatewayBackend) -> Result<()>
where
    W: io::Write,
{
    run_with_clients(
        command,
        out,
        &SystemTerminalClient,
        backend,
        RunSettings::default(),
    )
    .await
}

/// Runs the CLI command with an explicit log level and output format.
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction fails, or
/// output writing fails.
pub async fn run_with_log_level<W>(
    command: Command,
    out: &mut W,
    backend: GatewayBackend,
    log_level: Option<LogLevel>,
    output_format: OutputFormat,
) -> Result<()>
where
    W: io::Write,
{
    let settings = RunSettings::builder()
        .maybe_log_level(log_level)
        .output_format(output_format)
        .build();
    run_with_clients(command, out, &SystemTerminalClient, backend, settings).await
}

/// Runs the CLI command with injected clients and explicit settings.
///
/// ```
/// # async fn run() -> anyhow::Result<()> {
/// use clap::Parser;
///
/// struct FakeTerminal;
/// impl gattwalk::TerminalClient for FakeTerminal {
///     fn stdout_is_terminal(&self) -> bool { false }
///     fn stderr_is_terminal(&self) -> bool { false }
/// }
///
/// let args = gattwalk::Args::try_parse_from([
///     "gattwalk",
///     "--log-level",
///     "trace",
///     "--fake",
///     "--fake-scan",
///     "hci0|AA:BB:CC|UART-Dev|-43",
///     "inspect",
/// ])?;
/// let settings = gattwalk::RunSettings::builder()
///     .maybe_log_level(args.log_level())
///     .session_config(args.session_config())
///     .build();
/// let (command, maybe_fake_args) = args.into_command_and_fake_args()?;
/// let backend = match maybe_fake_args {
///     Some(fake_args) => gattwalk::fake_backend(fake_args),
///     None => gattwalk::real_backend(),
/// };
/// let mut out = Vec::new();
/// gattwalk::run_with_clients(command, &mut out, &FakeTerminal, backend, settings).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns an error if tracing initialisation fails, BLE interaction fails, or
/// output writing fails.
#[instrument(
    skip(command, out, terminal_client, backend),
    level = "info",
    fields(command = command.name())
)]
pub async fn run_with_clients<W>(
    command: Command,
    out: &mut W,
    terminal_client: &dyn TerminalClient,
    backend: GatewayBackend,
    settings: RunSettings,
) -> Result<()>
where
    W: io::Write,
{
    telemetry::initialise_tracing(
        "gattwalk",
        terminal_client.stderr_is_terminal(),
        settings.log_level.map(LogLevel::as_level_filter),
    )?;

    let connected = gateway_from_backend(backend).await?;
    let session = Arc::new(GattSession::from_gateway(
        connected,
        settings.session_config,
    ));
    let link_watcher = session.watch_link();
    let painter = Painter::new(
        terminal_client.stdout_is_terminal() && settings.output_format == OutputFormat::Pretty,
    );
    let format = settings.output_format;

    let outcome = match command {
        Command::Scan(args) => crate::cli::scan::run(&session, &args, out, format, &painter).await,
        Command::Inspect(target) => {
            let handler = SessionHandler::from_target(session, &target);
            crate::cli::inspect::run(handler, out, format, &painter).await
        }
        Command::Read(args) => {
            let handler = SessionHandler::from_target(session, args.target());
            crate::cli::read::run(handler, &args, out, format, &painter).await
        }
        Command::Write(args) => {
            let handler = SessionHandler::from_target(session, args.target());
            crate::cli::write::run(handler, &args, out, format, &painter).await
        }
        Command::Listen(args) => {
            let handler = SessionHandler::from_target(session, args.target());
            crate::cli::listen::run(handler, &args, out, format, &painter).await
        }
    };

    link_watcher.abort();
    outcome
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(DeviceSelector::FirstFound, true)]
    #[case(DeviceSelector::Id(DeviceId::from("AA:BB")), true)]
    #[case(DeviceSelector::Id(DeviceId::from("CC:DD")), false)]
    #[case(DeviceSelector::NamePrefix("UART".to_string()), true)]
    #[case(DeviceSelector::NamePrefix("uart".to_string()), false)]
    fn selector_matches_scan_results(#[case] selector: DeviceSelector, #[case] expected: bool) {
        let device = FoundDevice::new("hci0", "AA:BB", Some("UART-Dev".to_string()), None);
        assert_eq!(expected, selector.matches(&device));
    }
}
