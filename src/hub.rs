use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::codec::{DecodedValue, decode_display};
use crate::error::GattError;
use crate::hw::{CharacteristicId, SubscriptionHandle, ValueCallback};

/// One value pushed by the peripheral, decoded for display.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct ValueEvent {
    pub characteristic: CharacteristicId,
    /// Increases by one for every delivered value across all characteristics.
    pub sequence: u64,
    #[serde(with = "hex_bytes")]
    pub bytes: Vec<u8>,
    pub decoded: DecodedValue,
}

/// Receives notification values for one characteristic.
///
/// Each observer runs on its own task; an error or panic is logged and the
/// observer keeps receiving later values.
pub trait ValueObserver: Send + Sync + 'static {
    /// Handles one value.
    ///
    /// # Errors
    ///
    /// Returned errors are logged and otherwise ignored.
    fn on_value(&self, event: &ValueEvent) -> anyhow::Result<()>;
}

impl<F> ValueObserver for F
where
    F: Fn(&ValueEvent) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn on_value(&self, event: &ValueEvent) -> anyhow::Result<()> {
        self(event)
    }
}

/// Subscription table plus value fan-out.
///
/// At most one subscription exists per characteristic. Values from a replaced
/// registration are recognised by their generation and dropped.
#[derive(Debug, Clone)]
pub(crate) struct NotificationHub {
    inner: Arc<HubInner>,
}

#[derive(Debug)]
struct HubInner {
    subscriptions: Mutex<HashMap<CharacteristicId, Subscription>>,
    next_generation: AtomicU64,
    next_sequence: AtomicU64,
    events: broadcast::Sender<ValueEvent>,
}

#[derive(Debug)]
struct Subscription {
    generation: u64,
    handle: Option<SubscriptionHandle>,
    observers: Vec<ObserverSlot>,
}

#[derive(Debug)]
struct ObserverSlot {
    sender: mpsc::UnboundedSender<ValueEvent>,
}

impl ObserverSlot {
    fn spawn(observer: Arc<dyn ValueObserver>) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<ValueEvent>();
        tokio::spawn(async move {
            while let Some(event) = receiver.recv().await {
                match catch_unwind(AssertUnwindSafe(|| observer.on_value(&event))) {
                    Ok(Ok(())) => {}
                    Ok(Err(error)) => warn!(
                        characteristic = %event.characteristic,
                        sequence = event.sequence,
                        error = format!("{error:#}"),
                        "notification observer failed"
                    ),
                    Err(_) => warn!(
                        characteristic = %event.characteristic,
                        sequence = event.sequence,
                        "notification observer panicked"
                    ),
                }
            }
        });
        Self { sender }
    }
}

impl NotificationHub {
    pub(crate) fn new(event_capacity: usize) -> Self {
        let (events, _receiver) = broadcast::channel(event_capacity.max(1));
        Self {
            inner: Arc::new(HubInner {
                subscriptions: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(1),
                next_sequence: AtomicU64::new(1),
                events,
            }),
        }
    }

    /// Installs a pending subscription with a single observer.
    ///
    /// Returns the new generation and the gateway handle of the subscription
    /// it replaced, which the caller must unregister.
    pub(crate) fn begin(
        &self,
        characteristic: &CharacteristicId,
        observer: Arc<dyn ValueObserver>,
    ) -> (u64, Option<SubscriptionHandle>) {
        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let previous = self.inner.table().insert(
            characteristic.clone(),
            Subscription {
                generation,
                handle: None,
                observers: vec![ObserverSlot::spawn(observer)],
            },
        );
        (generation, previous.and_then(|subscription| subscription.handle))
    }

    /// Stores the gateway handle for a pending subscription.
    ///
    /// Returns the handle back when the subscription was replaced or removed
    /// while the gateway call was in flight; the caller must unregister it.
    #[must_use]
    pub(crate) fn activate(
        &self,
        characteristic: &CharacteristicId,
        generation: u64,
        handle: SubscriptionHandle,
    ) -> Option<SubscriptionHandle> {
        let mut table = self.inner.table();
        match table.get_mut(characteristic) {
            Some(subscription) if subscription.generation == generation => {
                subscription.handle = Some(handle);
                None
            }
            _ => Some(handle),
        }
    }

    /// Removes a pending subscription whose gateway registration failed.
    pub(crate) fn abandon(&self, characteristic: &CharacteristicId, generation: u64) {
        let mut table = self.inner.table();
        if table
            .get(characteristic)
            .is_some_and(|subscription| subscription.generation == generation)
        {
            table.remove(characteristic);
        }
    }

    /// Builds the gateway callback for one subscription generation.
    pub(crate) fn callback(&self, characteristic: CharacteristicId, generation: u64) -> ValueCallback {
        let hub = Arc::downgrade(&self.inner);
        Arc::new(move |bytes: Vec<u8>| deliver(&hub, &characteristic, generation, bytes))
    }

    /// Attaches another observer to an active subscription.
    pub(crate) fn observe(
        &self,
        characteristic: &CharacteristicId,
        observer: Arc<dyn ValueObserver>,
    ) -> Result<(), GattError> {
        let mut table = self.inner.table();
        let Some(subscription) = table.get_mut(characteristic) else {
            return Err(GattError::NotSubscribed {
                characteristic: characteristic.clone(),
            });
        };
        subscription.observers.push(ObserverSlot::spawn(observer));
        Ok(())
    }

    /// Removes the subscription, returning the gateway handle to unregister.
    pub(crate) fn unsubscribe(&self, characteristic: &CharacteristicId) -> Option<SubscriptionHandle> {
        self.inner
            .table()
            .remove(characteristic)
            .and_then(|subscription| subscription.handle)
    }

    /// Drops every subscription, returning the handles to unregister.
    pub(crate) fn clear(&self) -> Vec<SubscriptionHandle> {
        self.inner
            .table()
            .drain()
            .filter_map(|(_, subscription)| subscription.handle)
            .collect()
    }

    pub(crate) fn is_subscribed(&self, characteristic: &CharacteristicId) -> bool {
        self.inner.table().contains_key(characteristic)
    }

    pub(crate) fn active_subscriptions(&self) -> Vec<CharacteristicId> {
        let mut active: Vec<CharacteristicId> = self.inner.table().keys().cloned().collect();
        active.sort();
        active
    }

    pub(crate) fn events(&self) -> broadcast::Receiver<ValueEvent> {
        self.inner.events.subscribe()
    }
}

impl HubInner {
    fn table(&self) -> MutexGuard<'_, HashMap<CharacteristicId, Subscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn deliver(hub: &Weak<HubInner>, characteristic: &CharacteristicId, generation: u64, bytes: Vec<u8>) {
    let Some(hub) = hub.upgrade() else {
        return;
    };

    let event = {
        let table = hub.table();
        let Some(subscription) = table.get(characteristic) else {
            trace!(%characteristic, "dropping value for inactive subscription");
            return;
        };
        if subscription.generation != generation {
            trace!(%characteristic, "dropping value from replaced subscription");
            return;
        }

        // Assigned under the table lock so observers see sequences in order.
        let event = ValueEvent {
            characteristic: characteristic.clone(),
            sequence: hub.next_sequence.fetch_add(1, Ordering::Relaxed),
            decoded: decode_display(&bytes),
            bytes,
        };
        for slot in &subscription.observers {
            if slot.sender.send(event.clone()).is_err() {
                debug!(%characteristic, "observer task has stopped");
            }
        }
        event
    };

    // No receivers is fine.
    let _ = hub.events.send(event);
}

mod hex_bytes {
    use serde::Serializer;

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }
}
