mod config;
mod state;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

pub use self::config::SessionConfig;
pub use self::state::{SessionEvent, SessionState, SessionStateMachine, Transition};
use crate::catalog::{CatalogDevice, DiscoveryCatalog, Entity, EntityId};
use crate::codec::encode_utf8;
use crate::error::GattError;
use crate::hub::{NotificationHub, ValueEvent, ValueObserver};
use crate::hw::{
    AdapterGateway, AlwaysGranted, CharacteristicId, CharacteristicInfo, ConnectedGateway,
    ConnectionState, DeviceId, DeviceStream, FoundDevice, LinkEvent, PermissionGate, ServiceInfo,
    SubscriptionHandle,
};

/// A GATT client session bound to at most one peripheral at a time.
///
/// The session owns the lifecycle state, the discovery catalog and the
/// notification subscriptions. It is `Send + Sync`; wrap it in an [`Arc`] to
/// run operations on different characteristics concurrently.
#[derive(Debug)]
pub struct GattSession {
    gateway: Arc<dyn AdapterGateway>,
    permissions: Arc<dyn PermissionGate>,
    config: SessionConfig,
    machine: Arc<Mutex<SessionStateMachine>>,
    catalog: Arc<Mutex<DiscoveryCatalog>>,
    hub: NotificationHub,
    cancel: Mutex<CancellationToken>,
}

impl GattSession {
    /// Creates an idle session over `gateway` that never prompts for permission.
    pub fn new(gateway: Arc<dyn AdapterGateway>, config: SessionConfig) -> Self {
        Self {
            gateway,
            permissions: Arc::new(AlwaysGranted),
            hub: NotificationHub::new(config.event_capacity),
            config,
            machine: Arc::new(Mutex::new(SessionStateMachine::new())),
            catalog: Arc::new(Mutex::new(DiscoveryCatalog::new())),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Creates a session from a backend's gateway and permission gate.
    pub fn from_gateway(connected: ConnectedGateway, config: SessionConfig) -> Self {
        Self::new(connected.gateway, config).with_permissions(connected.permissions)
    }

    /// Replaces the permission gate consulted before scanning.
    #[must_use]
    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionGate>) -> Self {
        self.permissions = permissions;
        self
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Returns a snapshot of the lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        lock(&self.machine).state().clone()
    }

    /// Starts a scan, dropping previous scan results that are not connected.
    ///
    /// Every device yielded by the returned stream has already been recorded
    /// in the catalog. The stream ends when the gateway scan ends or the
    /// session leaves the scanning state.
    ///
    /// # Errors
    ///
    /// Returns [`GattError::PermissionDenied`] when the host refuses scanning,
    /// or [`GattError::InvalidTransition`] outside `Idle`, `Failed` and
    /// `Disconnected`.
    #[instrument(skip(self), level = "debug")]
    pub async fn start_scan(&self) -> Result<ScanResults, GattError> {
        if !self.permissions.has_permission().await && !self.permissions.request_permission().await
        {
            return Err(GattError::PermissionDenied);
        }

        self.transition(SessionEvent::StartScan)?;
        lock(&self.catalog).clear_scan_results();

        match self
            .settle("scan", self.gateway.scan(self.config.scan_timeout))
            .await
        {
            Ok(devices) => Ok(ScanResults {
                devices,
                machine: Arc::clone(&self.machine),
                catalog: Arc::clone(&self.catalog),
                finished: false,
            }),
            Err(error) => {
                if let Err(transition_error) = self.transition(SessionEvent::ScanEnded) {
                    debug!(?transition_error, "scan state already left");
                }
                Err(error)
            }
        }
    }

    /// Stops the active scan.
    ///
    /// # Errors
    ///
    /// Returns [`GattError::InvalidTransition`] when no scan is running.
    #[instrument(skip(self), level = "debug")]
    pub async fn stop_scan(&self) -> Result<(), GattError> {
        self.transition(SessionEvent::StopScan)?;
        self.settle("stop scan", self.gateway.stop_scan()).await
    }

    /// Connects to a catalogued device.
    ///
    /// Selecting the already connected device again is a no-op. A running scan
    /// is stopped first. On failure the session moves to `Failed` and the
    /// device can be selected again.
    ///
    /// # Errors
    ///
    /// Returns [`GattError::UnknownDevice`], [`GattError::AlreadyConnected`],
    /// the gateway's connect error, or [`GattError::OperationTimeout`] after
    /// the connect timeout.
    #[instrument(skip(self), level = "debug", fields(%device_id))]
    pub async fn select_device(&self, device_id: &DeviceId) -> Result<(), GattError> {
        if lock(&self.catalog).device(device_id).is_none() {
            return Err(GattError::UnknownDevice {
                device_id: device_id.clone(),
            });
        }

        // A disconnect may arrive as soon as the session is `Connecting`; it
        // must cancel the token this connect attempt runs under.
        let (from, token) = {
            let mut machine = lock(&self.machine);
            let Transition::Moved { from } =
                machine.apply(SessionEvent::SelectDevice(device_id.clone()))?
            else {
                return Ok(());
            };
            debug!(state = %machine.state(), "session state changed");
            lock(&self.catalog).set_connection_state(device_id, ConnectionState::Connecting);
            (from, self.reset_token())
        };
        if from == SessionState::Scanning
            && let Err(error) = self.settle("stop scan", self.gateway.stop_scan()).await
        {
            debug!(?error, "failed to stop scan before connecting");
        }

        let outcome = guarded(
            &token,
            "connect",
            self.config.connect_timeout,
            self.gateway.connect(device_id),
        )
        .await;

        match outcome {
            Ok(()) => {
                if self.transition(SessionEvent::ConnectSucceeded).is_err() {
                    self.abort_connect(device_id).await;
                    return Err(GattError::ConnectionLost);
                }
                lock(&self.catalog).set_connection_state(device_id, ConnectionState::Connected);
                info!("connected");
                Ok(())
            }
            // Disconnect already moved the session on.
            Err(GattError::ConnectionLost) if token.is_cancelled() => {
                self.abort_connect(device_id).await;
                Err(GattError::ConnectionLost)
            }
            Err(error) => {
                if matches!(error, GattError::OperationTimeout { .. }) {
                    self.abort_connect(device_id).await;
                }
                if let Err(transition_error) =
                    self.transition(SessionEvent::ConnectFailed(error.to_string()))
                {
                    debug!(?transition_error, "connect failure raced another transition");
                }
                lock(&self.catalog).set_connection_state(device_id, ConnectionState::Disconnected);
                warn!(error = %error, "connect failed");
                Err(error)
            }
        }
    }

    /// Disconnects the bound device.
    ///
    /// Pending operations fail with [`GattError::ConnectionLost`], all
    /// subscriptions are removed and the device's services are dropped from
    /// the catalog.
    ///
    /// # Errors
    ///
    /// Returns [`GattError::NotConnected`] when no device is bound, or the
    /// gateway's disconnect error (including [`GattError::OperationTimeout`])
    /// after local teardown completed.
    #[instrument(skip(self), level = "debug")]
    pub async fn disconnect(&self) -> Result<(), GattError> {
        let device = {
            let mut machine = lock(&self.machine);
            let device = machine.state().device().cloned();
            machine.apply(SessionEvent::Disconnect)?;
            device.ok_or(GattError::NotConnected)?
        };

        self.teardown(&device).await;
        self.settle("disconnect", self.gateway.disconnect(&device))
            .await
    }

    /// Reacts to the peripheral dropping the link.
    ///
    /// Loss reports for a device the session is not bound to are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`GattError::InvalidTransition`] if the state changed concurrently.
    #[instrument(skip(self), level = "debug", fields(%device))]
    pub async fn handle_link_lost(&self, device: &DeviceId) -> Result<(), GattError> {
        {
            let mut machine = lock(&self.machine);
            if machine.state().device() != Some(device) {
                debug!("ignoring link loss for unbound device");
                return Ok(());
            }
            machine.apply(SessionEvent::LinkLost)?;
        }

        warn!("connection lost");
        self.teardown(device).await;
        Ok(())
    }

    /// Forwards the gateway's link-loss events into this session until the
    /// session is dropped or the gateway closes its event channel.
    pub fn watch_link(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.gateway.link_events();
        let session = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(LinkEvent::Lost(device)) => {
                        let Some(session) = session.upgrade() else {
                            break;
                        };
                        if let Err(error) = session.handle_link_lost(&device).await {
                            debug!(?error, "failed to apply link loss");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed link events"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Discovers the connected device's services, replacing known ones.
    ///
    /// # Errors
    ///
    /// Returns [`GattError::NotConnected`] or the gateway's discovery error.
    /// A failed discovery leaves the connection open.
    #[instrument(skip(self), level = "debug")]
    pub async fn discover_services(&self) -> Result<Vec<ServiceInfo>, GattError> {
        let device = self.connected_device()?;
        let services = self
            .guard(
                "service discovery",
                self.gateway.discover_services(&device),
            )
            .await?;

        let services = {
            let mut catalog = lock(&self.catalog);
            catalog.set_services(&device, services)?;
            catalog.services().to_vec()
        };
        debug!(count = services.len(), "discovered services");
        Ok(services)
    }

    /// Discovers the characteristics of one catalogued service.
    ///
    /// # Errors
    ///
    /// Returns [`GattError::NotConnected`], [`GattError::UnknownService`] or
    /// the gateway's discovery error.
    #[instrument(skip(self), level = "debug")]
    pub async fn discover_characteristics(
        &self,
        service: &str,
    ) -> Result<Vec<CharacteristicInfo>, GattError> {
        let device = self.connected_device()?;
        let Some(uuid) = lock(&self.catalog)
            .service(service)
            .map(|service| service.uuid().to_string())
        else {
            return Err(GattError::UnknownService {
                service: service.to_string(),
            });
        };

        let characteristics = self
            .guard(
                "characteristic discovery",
                self.gateway.discover_characteristics(&device, &uuid),
            )
            .await?;

        let characteristics = {
            let mut catalog = lock(&self.catalog);
            catalog.set_characteristics(&uuid, characteristics)?;
            catalog.characteristics(&uuid).to_vec()
        };
        debug!(count = characteristics.len(), "discovered characteristics");
        Ok(characteristics)
    }

    /// Discovers services and then the characteristics of every service.
    ///
    /// # Errors
    ///
    /// Returns the first discovery error.
    pub async fn discover_all(&self) -> Result<(), GattError> {
        let services = self.discover_services().await?;
        for service in services {
            self.discover_characteristics(service.uuid()).await?;
        }
        Ok(())
    }

    /// Runs `query` against the catalog.
    pub fn with_catalog<R>(&self, query: impl FnOnce(&DiscoveryCatalog) -> R) -> R {
        query(&lock(&self.catalog))
    }

    #[must_use]
    pub fn devices(&self) -> Vec<CatalogDevice> {
        self.with_catalog(|catalog| catalog.devices().to_vec())
    }

    #[must_use]
    pub fn services(&self) -> Vec<ServiceInfo> {
        self.with_catalog(|catalog| catalog.services().to_vec())
    }

    #[must_use]
    pub fn characteristics(&self, service: &str) -> Vec<CharacteristicInfo> {
        self.with_catalog(|catalog| catalog.characteristics(service).to_vec())
    }

    #[must_use]
    pub fn lookup(&self, id: &EntityId) -> Option<Entity> {
        self.with_catalog(|catalog| catalog.lookup(id))
    }

    /// Reads the current value of a characteristic.
    ///
    /// # Errors
    ///
    /// Returns [`GattError::NotReadable`] without touching the gateway when the
    /// characteristic cannot be read, and otherwise the usual lookup, gateway,
    /// timeout and cancellation errors.
    #[instrument(skip(self), level = "debug", fields(%characteristic))]
    pub async fn read(&self, characteristic: &CharacteristicId) -> Result<Vec<u8>, GattError> {
        let (device, info) = self.resolve(characteristic)?;
        if !info.capabilities().readable {
            return Err(GattError::NotReadable {
                characteristic: characteristic.clone(),
            });
        }

        self.guard("read", self.gateway.read(&device, characteristic))
            .await
    }

    /// Writes raw bytes, acknowledged when the characteristic supports it.
    ///
    /// # Errors
    ///
    /// Returns [`GattError::NotWritable`] without touching the gateway when the
    /// characteristic cannot be written.
    #[instrument(skip(self, payload), level = "debug", fields(%characteristic, len = payload.len()))]
    pub async fn write(
        &self,
        characteristic: &CharacteristicId,
        payload: &[u8],
    ) -> Result<(), GattError> {
        let (device, info) = self.resolve(characteristic)?;
        if !info.capabilities().writable {
            return Err(GattError::NotWritable {
                characteristic: characteristic.clone(),
            });
        }

        let mode = info.preferred_write_mode();
        self.guard(
            "write",
            self.gateway.write(&device, characteristic, payload, mode),
        )
        .await
    }

    /// Writes `text` encoded as UTF-8.
    ///
    /// # Errors
    ///
    /// Same as [`GattSession::write`].
    pub async fn write_text(
        &self,
        characteristic: &CharacteristicId,
        text: &str,
    ) -> Result<(), GattError> {
        self.write(characteristic, &encode_utf8(text)).await
    }

    /// Subscribes to notifications, replacing any existing subscription on
    /// the same characteristic together with its observers.
    ///
    /// # Errors
    ///
    /// Returns [`GattError::NotNotifiable`] without touching the gateway when
    /// the characteristic cannot notify.
    #[instrument(skip(self, observer), level = "debug", fields(%characteristic))]
    pub async fn subscribe(
        &self,
        characteristic: &CharacteristicId,
        observer: impl ValueObserver,
    ) -> Result<(), GattError> {
        let (device, info) = self.resolve(characteristic)?;
        if !info.capabilities().notifiable {
            return Err(GattError::NotNotifiable {
                characteristic: characteristic.clone(),
            });
        }

        let (generation, replaced) = self.hub.begin(characteristic, Arc::new(observer));
        if let Some(replaced) = replaced {
            self.release(replaced).await;
        }

        let callback = self.hub.callback(characteristic.clone(), generation);
        let registered = self
            .guard(
                "subscribe",
                self.gateway.subscribe(&device, characteristic, callback),
            )
            .await;

        match registered {
            Ok(handle) => {
                if let Some(stale) = self.hub.activate(characteristic, generation, handle) {
                    self.release(stale).await;
                }
                Ok(())
            }
            Err(error) => {
                self.hub.abandon(characteristic, generation);
                Err(error)
            }
        }
    }

    /// Attaches another observer to an existing subscription.
    ///
    /// # Errors
    ///
    /// Returns [`GattError::NotSubscribed`] when the characteristic has no
    /// active subscription.
    pub fn observe(
        &self,
        characteristic: &CharacteristicId,
        observer: impl ValueObserver,
    ) -> Result<(), GattError> {
        self.hub.observe(characteristic, Arc::new(observer))
    }

    /// Removes a subscription. Unsubscribing twice is not an error.
    ///
    /// # Errors
    ///
    /// Returns the gateway's error if unregistering fails; the local
    /// subscription is removed regardless.
    #[instrument(skip(self), level = "debug", fields(%characteristic))]
    pub async fn unsubscribe(&self, characteristic: &CharacteristicId) -> Result<(), GattError> {
        let Some(handle) = self.hub.unsubscribe(characteristic) else {
            return Ok(());
        };
        self.guard("unsubscribe", self.gateway.unsubscribe(handle))
            .await
    }

    #[must_use]
    pub fn is_subscribed(&self, characteristic: &CharacteristicId) -> bool {
        self.hub.is_subscribed(characteristic)
    }

    #[must_use]
    pub fn active_subscriptions(&self) -> Vec<CharacteristicId> {
        self.hub.active_subscriptions()
    }

    /// Streams every notification value delivered from now on.
    ///
    /// A consumer that falls more than `event_capacity` values behind skips
    /// the oldest ones.
    pub fn notifications(&self) -> impl Stream<Item = ValueEvent> + Send + 'static {
        BroadcastStream::new(self.hub.events()).filter_map(|item| match item {
            Ok(event) => Some(event),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "notification consumer lagged");
                None
            }
        })
    }

    fn transition(&self, event: SessionEvent) -> Result<Transition, GattError> {
        let mut machine = lock(&self.machine);
        let transition = machine.apply(event)?;
        debug!(state = %machine.state(), "session state changed");
        Ok(transition)
    }

    fn connected_device(&self) -> Result<DeviceId, GattError> {
        lock(&self.machine)
            .state()
            .connected_device()
            .cloned()
            .ok_or(GattError::NotConnected)
    }

    fn resolve(
        &self,
        characteristic: &CharacteristicId,
    ) -> Result<(DeviceId, CharacteristicInfo), GattError> {
        let device = self.connected_device()?;
        let info = lock(&self.catalog)
            .characteristic(characteristic)
            .cloned()
            .ok_or_else(|| GattError::UnknownCharacteristic {
                characteristic: characteristic.clone(),
            })?;
        Ok((device, info))
    }

    fn reset_token(&self) -> CancellationToken {
        let mut current = lock(&self.cancel);
        *current = CancellationToken::new();
        current.clone()
    }

    async fn guard<T>(
        &self,
        operation: &'static str,
        future: impl Future<Output = Result<T, GattError>>,
    ) -> Result<T, GattError> {
        let token = lock(&self.cancel).clone();
        guarded(&token, operation, self.config.operation_timeout, future).await
    }

    /// Bounds a gateway call that must run even after the session token was
    /// cancelled, such as teardown.
    async fn settle<T>(
        &self,
        operation: &'static str,
        future: impl Future<Output = Result<T, GattError>>,
    ) -> Result<T, GattError> {
        guarded(
            &CancellationToken::new(),
            operation,
            self.config.operation_timeout,
            future,
        )
        .await
    }

    /// Drops whatever link a cancelled or timed out connect may have left.
    async fn abort_connect(&self, device_id: &DeviceId) {
        if let Err(error) = self.settle("disconnect", self.gateway.disconnect(device_id)).await {
            debug!(?error, "failed to abort connect");
        }
        lock(&self.catalog).set_connection_state(device_id, ConnectionState::Disconnected);
    }

    async fn release(&self, handle: SubscriptionHandle) {
        if let Err(error) = self.guard("unsubscribe", self.gateway.unsubscribe(handle)).await {
            debug!(?error, "failed to unregister replaced subscription");
        }
    }

    async fn teardown(&self, device: &DeviceId) {
        lock(&self.cancel).cancel();
        lock(&self.catalog).clear_device(device);

        for handle in self.hub.clear() {
            if let Err(error) = self.settle("unsubscribe", self.gateway.unsubscribe(handle)).await {
                debug!(?error, "failed to unregister subscription during teardown");
            }
        }
    }
}

/// Devices reported by a running scan.
///
/// Dropping the stream does not stop the scan; call
/// [`GattSession::stop_scan`] or select a device.
pub struct ScanResults {
    devices: DeviceStream,
    machine: Arc<Mutex<SessionStateMachine>>,
    catalog: Arc<Mutex<DiscoveryCatalog>>,
    finished: bool,
}

impl std::fmt::Debug for ScanResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanResults")
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl Stream for ScanResults {
    type Item = FoundDevice;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.devices.as_mut().poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(device)) => {
                if *lock(&this.machine).state() != SessionState::Scanning {
                    this.finished = true;
                    return Poll::Ready(None);
                }
                lock(&this.catalog).add_device(device.clone());
                Poll::Ready(Some(device))
            }
            Poll::Ready(None) => {
                this.finished = true;
                let mut machine = lock(&this.machine);
                if *machine.state() == SessionState::Scanning
                    && let Err(error) = machine.apply(SessionEvent::ScanEnded)
                {
                    debug!(?error, "failed to finish scan state");
                }
                Poll::Ready(None)
            }
        }
    }
}

async fn guarded<T>(
    token: &CancellationToken,
    operation: &'static str,
    limit: Duration,
    future: impl Future<Output = Result<T, GattError>>,
) -> Result<T, GattError> {
    tokio::select! {
        biased;
        () = token.cancelled() => Err(GattError::ConnectionLost),
        outcome = tokio::time::timeout(limit, future) => outcome.unwrap_or(Err(GattError::OperationTimeout {
            operation,
            timeout: limit,
        })),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}
