use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::StreamExt;

use gattwalk::{
    CharacteristicId, ConnectionState, DeviceId, Entity, EntityId, FakeCall, FakeController,
    FakeGateway, FakeGatewayConfig, GattError, GattSession, SessionConfig, SessionState,
    ValueEvent,
};

const WAIT: Duration = Duration::from_secs(5);
const DEVICE: &str = "AA:BB:CC";
const SCAN: &str = "hci1|00:11:22|Speaker|-65;hci0|AA:BB:CC|UART-Dev|-43";

fn battery_level() -> CharacteristicId {
    CharacteristicId::new(
        "0000180f-0000-1000-8000-00805f9b34fb",
        "00002a19-0000-1000-8000-00805f9b34fb",
    )
}

fn session_with(
    config: FakeGatewayConfig,
    session_config: SessionConfig,
) -> (Arc<GattSession>, FakeController) {
    let gateway = FakeGateway::new(config);
    let controller = gateway.controller();
    let permissions = Arc::new(gateway.permissions());
    let session = GattSession::new(Arc::new(gateway), session_config).with_permissions(permissions);
    (Arc::new(session), controller)
}

fn fake_config() -> anyhow::Result<FakeGatewayConfig> {
    Ok(FakeGatewayConfig::builder()
        .scan_fixture(SCAN.parse()?)
        .build())
}

async fn scan_all(session: &GattSession) -> anyhow::Result<Vec<DeviceId>> {
    let found = session.start_scan().await?;
    Ok(found
        .map(|device| device.device_id().clone())
        .collect::<Vec<_>>()
        .await)
}

async fn connect(session: &GattSession) -> anyhow::Result<DeviceId> {
    scan_all(session).await?;
    let device = DeviceId::from(DEVICE);
    session.select_device(&device).await?;
    session.discover_all().await?;
    Ok(device)
}

fn forwarding() -> (
    impl Fn(&ValueEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    mpsc::UnboundedReceiver<ValueEvent>,
) {
    let (sender, receiver) = mpsc::unbounded_channel();
    let observer = move |event: &ValueEvent| -> anyhow::Result<()> {
        sender.send(event.clone())?;
        Ok(())
    };
    (observer, receiver)
}

#[tokio::test]
async fn subscribed_observer_receives_decoded_values() -> anyhow::Result<()> {
    let config = FakeGatewayConfig::builder()
        .scan_fixture("hci0|D1|Sensor|-50".parse()?)
        .gatt_fixture("0000aaaa-0000-1000-8000-00805f9b34fb/0000bbbb-0000-1000-8000-00805f9b34fb=notify".parse()?)
        .build();
    let (session, controller) = session_with(config, SessionConfig::default());

    scan_all(&session).await?;
    session.select_device(&DeviceId::from("D1")).await?;
    let services = session.discover_services().await?;
    assert_eq!(1, services.len());
    let characteristics = session.discover_characteristics(services[0].uuid()).await?;
    assert_eq!(1, characteristics.len());
    let c1 = characteristics[0].id().clone();

    let (observer, mut values) = forwarding();
    session.subscribe(&c1, observer).await?;
    assert_eq!(1, controller.notify(&c1, &[0x01, 0x02]));

    let event = timeout(WAIT, values.recv()).await?.expect("observer should stay alive");
    assert_eq!(c1, event.characteristic);
    assert_eq!(vec![0x01, 0x02], event.bytes);
    assert_eq!("01-02", event.decoded.hex);
    assert_eq!("\u{1}\u{2}", event.decoded.utf8);
    assert_eq!(Some(513), event.decoded.int_le);
    Ok(())
}

#[tokio::test]
async fn connect_populates_catalog_and_state() -> anyhow::Result<()> {
    let (session, controller) = session_with(fake_config()?, SessionConfig::default());

    let found = scan_all(&session).await?;
    assert_eq!(vec![DeviceId::from("00:11:22"), DeviceId::from(DEVICE)], found);
    assert_eq!(SessionState::Idle, session.state());

    let device = DeviceId::from(DEVICE);
    session.select_device(&device).await?;
    session.discover_all().await?;

    assert_eq!(SessionState::Connected(device.clone()), session.state());
    assert!(controller.is_connected(&device));
    assert_eq!(2, session.services().len());
    assert_matches!(
        session.lookup(&EntityId::Device(device.clone())),
        Some(Entity::Device(entry)) if entry.state() == ConnectionState::Connected
    );
    assert_matches!(
        session.lookup(&EntityId::Characteristic(battery_level())),
        Some(Entity::Characteristic(info)) if info.name() == "Battery Level"
    );
    Ok(())
}

#[tokio::test]
async fn disconnect_clears_catalog_and_subscriptions() -> anyhow::Result<()> {
    let (session, controller) = session_with(fake_config()?, SessionConfig::default());
    let device = connect(&session).await?;
    let (observer, mut values) = forwarding();
    session.subscribe(&battery_level(), observer).await?;
    assert_eq!(1, controller.active_subscriptions());

    session.disconnect().await?;

    assert_eq!(SessionState::Disconnected, session.state());
    assert!(session.services().is_empty());
    assert!(session.active_subscriptions().is_empty());
    assert_eq!(0, controller.active_subscriptions());
    assert!(!controller.is_connected(&device));
    assert_eq!(None, session.lookup(&EntityId::Characteristic(battery_level())));
    assert_matches!(
        session.lookup(&EntityId::Device(device)),
        Some(Entity::Device(entry)) if entry.state() == ConnectionState::Disconnected
    );
    // The observer is dropped together with its subscription.
    assert_eq!(None, timeout(WAIT, values.recv()).await?);
    Ok(())
}

#[tokio::test]
async fn capability_checks_do_not_reach_the_gateway() -> anyhow::Result<()> {
    let (session, controller) = session_with(fake_config()?, SessionConfig::default());
    connect(&session).await?;
    let uart_tx: CharacteristicId =
        "6e400001-b5a3-f393-e0a9-e50e24dcca9e/6e400002-b5a3-f393-e0a9-e50e24dcca9e".parse()?;

    assert_matches!(
        session.read(&uart_tx).await,
        Err(GattError::NotReadable { characteristic }) if characteristic == uart_tx
    );
    assert_matches!(
        session.write(&battery_level(), &[0x01]).await,
        Err(GattError::NotWritable { .. })
    );
    assert_matches!(
        session.subscribe(&uart_tx, |_: &ValueEvent| -> anyhow::Result<()> { Ok(()) }).await,
        Err(GattError::NotNotifiable { .. })
    );

    assert_eq!(0, controller.call_count(FakeCall::Read));
    assert_eq!(0, controller.call_count(FakeCall::Write));
    assert_eq!(0, controller.call_count(FakeCall::Subscribe));
    Ok(())
}

#[tokio::test]
async fn read_and_write_round_trip_through_the_gateway() -> anyhow::Result<()> {
    let config = FakeGatewayConfig::builder()
        .scan_fixture(SCAN.parse()?)
        .read_payload("DE-AD".parse()?)
        .build();
    let (session, controller) = session_with(config, SessionConfig::default());
    connect(&session).await?;
    let uart_tx: CharacteristicId =
        "6e400001-b5a3-f393-e0a9-e50e24dcca9e/6e400002-b5a3-f393-e0a9-e50e24dcca9e".parse()?;

    assert_eq!(vec![0xde, 0xad], session.read(&battery_level()).await?);
    session.write_text(&uart_tx, "hi").await?;

    let writes = controller.writes();
    assert_eq!(1, writes.len());
    assert_eq!(uart_tx, writes[0].0);
    assert_eq!(b"hi".to_vec(), writes[0].1);
    assert_eq!(gattwalk::WriteMode::WithResponse, writes[0].2);
    Ok(())
}

#[tokio::test]
async fn operations_before_connect_report_not_connected() -> anyhow::Result<()> {
    let (session, _controller) = session_with(fake_config()?, SessionConfig::default());

    assert_matches!(session.read(&battery_level()).await, Err(GattError::NotConnected));
    assert_matches!(session.discover_services().await, Err(GattError::NotConnected));
    assert_matches!(session.disconnect().await, Err(GattError::NotConnected));
    assert_matches!(
        session.select_device(&DeviceId::from(DEVICE)).await,
        Err(GattError::UnknownDevice { .. })
    );
    Ok(())
}

#[tokio::test]
async fn subscribing_twice_replaces_the_first_observer() -> anyhow::Result<()> {
    let (session, controller) = session_with(fake_config()?, SessionConfig::default());
    connect(&session).await?;
    let (first, mut first_values) = forwarding();
    let (second, mut second_values) = forwarding();

    session.subscribe(&battery_level(), first).await?;
    session.subscribe(&battery_level(), second).await?;

    assert_eq!(vec![battery_level()], session.active_subscriptions());
    assert_eq!(1, controller.active_subscriptions());
    assert_eq!(1, controller.call_count(FakeCall::Unsubscribe));

    controller.notify(&battery_level(), &[0x2a]);
    let event = timeout(WAIT, second_values.recv()).await?.expect("second observer is active");
    assert_eq!(vec![0x2a], event.bytes);
    assert_eq!(None, timeout(WAIT, first_values.recv()).await?);
    Ok(())
}

#[tokio::test]
async fn extra_observers_share_a_subscription() -> anyhow::Result<()> {
    let (session, controller) = session_with(fake_config()?, SessionConfig::default());
    connect(&session).await?;
    let (first, mut first_values) = forwarding();
    let (second, mut second_values) = forwarding();

    assert_matches!(
        session.observe(&battery_level(), |_: &ValueEvent| -> anyhow::Result<()> { Ok(()) }),
        Err(GattError::NotSubscribed { .. })
    );
    session.subscribe(&battery_level(), first).await?;
    session.observe(&battery_level(), second)?;

    controller.notify(&battery_level(), &[0x07]);
    let one = timeout(WAIT, first_values.recv()).await?.expect("first observer");
    let two = timeout(WAIT, second_values.recv()).await?.expect("second observer");
    assert_eq!(one, two);

    session.unsubscribe(&battery_level()).await?;
    session.unsubscribe(&battery_level()).await?;
    assert!(!session.is_subscribed(&battery_level()));
    assert_eq!(1, controller.call_count(FakeCall::Unsubscribe));
    Ok(())
}

#[tokio::test]
async fn failing_observer_does_not_starve_the_others() -> anyhow::Result<()> {
    let (session, controller) = session_with(fake_config()?, SessionConfig::default());
    connect(&session).await?;
    let (healthy, mut values) = forwarding();

    session
        .subscribe(&battery_level(), |_: &ValueEvent| -> anyhow::Result<()> {
            anyhow::bail!("observer rejected value")
        })
        .await?;
    session.observe(&battery_level(), healthy)?;

    controller.notify(&battery_level(), &[0x01]);
    controller.notify(&battery_level(), &[0x02]);

    let first = timeout(WAIT, values.recv()).await?.expect("first value");
    let second = timeout(WAIT, values.recv()).await?.expect("second value");
    assert_eq!(first.sequence + 1, second.sequence);
    Ok(())
}

#[tokio::test]
async fn notifications_stream_sees_every_subscription() -> anyhow::Result<()> {
    let (session, controller) = session_with(fake_config()?, SessionConfig::default());
    connect(&session).await?;
    let uart_rx: CharacteristicId =
        "6e400001-b5a3-f393-e0a9-e50e24dcca9e/6e400003-b5a3-f393-e0a9-e50e24dcca9e".parse()?;
    let ignore = |_: &ValueEvent| -> anyhow::Result<()> { Ok(()) };
    session.subscribe(&battery_level(), ignore).await?;
    session.subscribe(&uart_rx, ignore).await?;
    let mut stream = Box::pin(session.notifications());

    controller.notify(&battery_level(), &[0x01]);
    controller.notify(&uart_rx, b"ok");

    let first = timeout(WAIT, stream.next()).await?.expect("first event");
    let second = timeout(WAIT, stream.next()).await?.expect("second event");
    assert_eq!(battery_level(), first.characteristic);
    assert_eq!(uart_rx, second.characteristic);
    assert_eq!("ok", second.decoded.utf8);
    Ok(())
}

#[tokio::test]
async fn link_loss_cancels_a_pending_read() -> anyhow::Result<()> {
    let config = FakeGatewayConfig::builder()
        .scan_fixture(SCAN.parse()?)
        .response_delay(Duration::from_secs(60))
        .build();
    let session_config = SessionConfig::builder()
        .operation_timeout(Duration::from_secs(120))
        .build();
    let (session, controller) = session_with(config, session_config);
    let watcher = session.watch_link();
    let device = connect(&session).await?;

    let pending = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.read(&battery_level()).await }
    });
    while controller.call_count(FakeCall::Read) == 0 {
        tokio::task::yield_now().await;
    }
    controller.drop_link(&device);

    assert_matches!(timeout(WAIT, pending).await??, Err(GattError::ConnectionLost));
    assert_eq!(SessionState::Disconnected, session.state());
    assert!(session.services().is_empty());
    watcher.abort();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn slow_read_fails_with_operation_timeout() -> anyhow::Result<()> {
    let config = FakeGatewayConfig::builder()
        .scan_fixture(SCAN.parse()?)
        .response_delay(Duration::from_secs(30))
        .build();
    let session_config = SessionConfig::builder()
        .operation_timeout(Duration::from_secs(2))
        .build();
    let (session, _controller) = session_with(config, session_config);
    connect(&session).await?;

    assert_matches!(
        session.read(&battery_level()).await,
        Err(GattError::OperationTimeout { operation: "read", timeout }) if timeout == Duration::from_secs(2)
    );
    // A timed out read leaves the connection usable.
    assert_eq!(SessionState::Connected(DeviceId::from(DEVICE)), session.state());
    Ok(())
}

#[tokio::test]
async fn failed_connect_can_be_retried() -> anyhow::Result<()> {
    let config = FakeGatewayConfig::builder()
        .scan_fixture(SCAN.parse()?)
        .connect_failures(1)
        .build();
    let (session, _controller) = session_with(config, SessionConfig::default());
    scan_all(&session).await?;
    let device = DeviceId::from(DEVICE);

    assert_matches!(session.select_device(&device).await, Err(GattError::Connect { .. }));
    assert_matches!(session.state(), SessionState::Failed(_));

    session.select_device(&device).await?;
    assert_eq!(SessionState::Connected(device), session.state());
    Ok(())
}

#[tokio::test]
async fn selecting_another_device_while_connected_is_rejected() -> anyhow::Result<()> {
    let (session, controller) = session_with(fake_config()?, SessionConfig::default());
    let device = connect(&session).await?;

    session.select_device(&device).await?;
    assert_eq!(1, controller.call_count(FakeCall::Connect));
    assert_matches!(
        session.select_device(&DeviceId::from("00:11:22")).await,
        Err(GattError::AlreadyConnected { device_id }) if device_id == device
    );
    assert_matches!(session.start_scan().await, Err(GattError::InvalidTransition { .. }));
    Ok(())
}

#[tokio::test]
async fn denied_permission_fails_scan() -> anyhow::Result<()> {
    let config = FakeGatewayConfig::builder()
        .scan_fixture(SCAN.parse()?)
        .permission_granted(false)
        .grant_on_request(false)
        .build();
    let (session, controller) = session_with(config, SessionConfig::default());

    assert_matches!(session.start_scan().await, Err(GattError::PermissionDenied));
    assert_eq!(SessionState::Idle, session.state());
    assert_eq!(0, controller.call_count(FakeCall::Scan));
    Ok(())
}

#[tokio::test]
async fn permission_granted_on_request_allows_scan() -> anyhow::Result<()> {
    let config = FakeGatewayConfig::builder()
        .scan_fixture(SCAN.parse()?)
        .permission_granted(false)
        .build();
    let (session, _controller) = session_with(config, SessionConfig::default());

    assert_eq!(2, scan_all(&session).await?.len());
    Ok(())
}

#[tokio::test]
async fn concurrent_reads_on_different_characteristics() -> anyhow::Result<()> {
    let config = FakeGatewayConfig::builder()
        .scan_fixture(SCAN.parse()?)
        .gatt_fixture("180f/2a19=read;180a/2a29=read".parse()?)
        .response_delay(Duration::from_millis(20))
        .build();
    let (session, controller) = session_with(config, SessionConfig::default());
    connect(&session).await?;
    let manufacturer: CharacteristicId = "180a/2a29".parse()?;
    let battery_level = battery_level();

    let (level, name) = tokio::join!(
        session.read(&battery_level),
        session.read(&manufacturer)
    );

    assert_eq!(vec![0x64], level?);
    assert_eq!(vec![0x64], name?);
    assert_eq!(2, controller.call_count(FakeCall::Read));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_fails_the_session_and_drops_the_link() -> anyhow::Result<()> {
    let config = FakeGatewayConfig::builder()
        .scan_fixture(SCAN.parse()?)
        .connect_delay(Duration::from_secs(30))
        .build();
    let session_config = SessionConfig::builder()
        .connect_timeout(Duration::from_secs(1))
        .build();
    let (session, controller) = session_with(config, session_config);
    scan_all(&session).await?;
    let device = DeviceId::from(DEVICE);

    assert_matches!(
        session.select_device(&device).await,
        Err(GattError::OperationTimeout { operation: "connect", timeout }) if timeout == Duration::from_secs(1)
    );
    assert_matches!(session.state(), SessionState::Failed(_));
    assert_eq!(1, controller.call_count(FakeCall::Disconnect));
    assert!(!controller.is_connected(&device));
    assert_matches!(
        session.lookup(&EntityId::Device(device)),
        Some(Entity::Device(entry)) if entry.state() == ConnectionState::Disconnected
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn disconnect_cancels_a_pending_read() -> anyhow::Result<()> {
    let config = FakeGatewayConfig::builder()
        .scan_fixture(SCAN.parse()?)
        .response_delay(Duration::from_secs(60))
        .build();
    let session_config = SessionConfig::builder()
        .operation_timeout(Duration::from_secs(120))
        .build();
    let (session, _controller) = session_with(config, session_config);
    connect(&session).await?;

    let pending = tokio::spawn({
        let session = Arc::clone(&session);
        async move { session.read(&battery_level()).await }
    });
    tokio::time::sleep(Duration::from_secs(1)).await;
    session.disconnect().await?;

    assert_matches!(pending.await?, Err(GattError::ConnectionLost));
    assert_eq!(SessionState::Disconnected, session.state());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stalled_gateway_teardown_is_bounded_by_the_operation_timeout() -> anyhow::Result<()> {
    let config = FakeGatewayConfig::builder()
        .scan_fixture(SCAN.parse()?)
        .stall_teardown(true)
        .build();
    let session_config = SessionConfig::builder()
        .operation_timeout(Duration::from_secs(1))
        .build();
    let (session, controller) = session_with(config, session_config);
    connect(&session).await?;
    let (observer, _values) = forwarding();
    session.subscribe(&battery_level(), observer).await?;

    let outcome = timeout(Duration::from_secs(60), session.disconnect()).await?;

    assert_matches!(
        outcome,
        Err(GattError::OperationTimeout { operation: "disconnect", .. })
    );
    assert_eq!(SessionState::Disconnected, session.state());
    assert!(session.active_subscriptions().is_empty());
    assert!(session.services().is_empty());
    assert_eq!(1, controller.call_count(FakeCall::Unsubscribe));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn stalled_teardown_does_not_block_link_loss_handling() -> anyhow::Result<()> {
    let config = FakeGatewayConfig::builder()
        .scan_fixture(SCAN.parse()?)
        .stall_teardown(true)
        .build();
    let session_config = SessionConfig::builder()
        .operation_timeout(Duration::from_secs(1))
        .build();
    let (session, _controller) = session_with(config, session_config);
    let device = connect(&session).await?;
    let (observer, _values) = forwarding();
    session.subscribe(&battery_level(), observer).await?;

    timeout(Duration::from_secs(60), session.handle_link_lost(&device)).await??;

    assert_eq!(SessionState::Disconnected, session.state());
    assert!(session.active_subscriptions().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn disconnect_while_stopping_the_scan_abandons_the_connect() -> anyhow::Result<()> {
    let config = FakeGatewayConfig::builder()
        .scan_fixture(SCAN.parse()?)
        .stop_scan_delay(Duration::from_millis(200))
        .build();
    let (session, controller) = session_with(config, SessionConfig::default());
    let mut found = session.start_scan().await?;
    while let Some(device) = found.next().await {
        if device.device_id().as_str() == DEVICE {
            break;
        }
    }
    let device = DeviceId::from(DEVICE);

    let selecting = tokio::spawn({
        let session = Arc::clone(&session);
        let device = device.clone();
        async move { session.select_device(&device).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(SessionState::Connecting(device.clone()), session.state());
    session.disconnect().await?;

    assert_matches!(selecting.await?, Err(GattError::ConnectionLost));
    assert_eq!(SessionState::Disconnected, session.state());
    assert!(!controller.is_connected(&device));
    assert_eq!(0, controller.call_count(FakeCall::Connect));
    assert_matches!(
        session.lookup(&EntityId::Device(device)),
        Some(Entity::Device(entry)) if entry.state() == ConnectionState::Disconnected
    );
    Ok(())
}
