//! Typed change notifications.
//!
//! Producers (the link task, the telemetry store, connect/disconnect) publish
//! into an unbounded queue; one dispatcher task drains it and calls the
//! observers one after another, in publish order. Producers never wait on
//! observer code.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{trace, warn};

use crate::connection::ConnectionState;
use crate::mode::{VehicleMode, VehicleType};
use crate::telemetry::{HomePosition, Position};

const STREAM_CHANNEL_SIZE: usize = 256;

/// One state change, carrying the fields of its category.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    ConnectionStateChanged(ConnectionState),
    PositionUpdated {
        position: Position,
        is_gps_valid: bool,
    },
    AltitudeUpdated {
        altitude: f64,
    },
    SpeedUpdated {
        ground_speed: f64,
    },
    HomeUpdated {
        home: HomePosition,
    },
    ModeChanged {
        vehicle_type: VehicleType,
        mode: Option<VehicleMode>,
        is_armed: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    ConnectionStateChanged,
    PositionUpdated,
    AltitudeUpdated,
    SpeedUpdated,
    HomeUpdated,
    ModeChanged,
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        match self {
            Notification::ConnectionStateChanged(_) => NotificationKind::ConnectionStateChanged,
            Notification::PositionUpdated { .. } => NotificationKind::PositionUpdated,
            Notification::AltitudeUpdated { .. } => NotificationKind::AltitudeUpdated,
            Notification::SpeedUpdated { .. } => NotificationKind::SpeedUpdated,
            Notification::HomeUpdated { .. } => NotificationKind::HomeUpdated,
            Notification::ModeChanged { .. } => NotificationKind::ModeChanged,
        }
    }
}

/// Receives notifications on the bus's dispatcher task.
///
/// Implementations should return quickly, every other observer waits for
/// them. Plain closures implement this trait.
pub trait Observer: Send + Sync + 'static {
    fn on_notification(&self, notification: &Notification);
}

impl<F> Observer for F
where
    F: Fn(&Notification) + Send + Sync + 'static,
{
    fn on_notification(&self, notification: &Notification) {
        self(notification)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type ObserverList = RwLock<Vec<(SubscriptionId, Arc<dyn Observer>)>>;

/// Cheaply cloneable handle; all clones share one dispatcher task, which
/// ends once the last clone is dropped.
#[derive(Clone)]
pub struct EventBus {
    observers: Arc<ObserverList>,
    next_id: Arc<AtomicU64>,
    queue: mpsc::UnboundedSender<Notification>,
    stream_tx: broadcast::Sender<Notification>,
}

impl EventBus {
    /// Spawns the dispatcher task, so this has to be called from within a
    /// Tokio runtime.
    pub fn new() -> Self {
        let observers: Arc<ObserverList> = Arc::new(RwLock::new(Vec::new()));
        let (queue, rx) = mpsc::unbounded_channel();
        let (stream_tx, _) = broadcast::channel(STREAM_CHANNEL_SIZE);

        tokio::spawn(dispatch(Arc::clone(&observers), rx));

        Self {
            observers,
            next_id: Arc::new(AtomicU64::new(1)),
            queue,
            stream_tx,
        }
    }

    pub fn subscribe(&self, observer: impl Observer) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(observer)));
        id
    }

    /// Returns `false` if the id was not (or no longer) subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut observers = self
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = observers.len();
        observers.retain(|(sub, _)| *sub != id);
        observers.len() != before
    }

    pub fn observer_count(&self) -> usize {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Notifications as an async stream. A consumer that falls more than
    /// 256 notifications behind skips the oldest ones.
    pub fn stream(&self) -> impl Stream<Item = Notification> {
        BroadcastStream::new(self.stream_tx.subscribe()).filter_map(|item| match item {
            Ok(notification) => Some(notification),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                warn!(skipped, "notification stream consumer is lagging");
                None
            }
        })
    }

    pub(crate) fn publish(&self, notification: Notification) {
        trace!(kind = ?notification.kind(), "publish");
        // no stream consumers is fine
        let _ = self.stream_tx.send(notification.clone());
        if self.queue.send(notification).is_err() {
            warn!("notification dispatcher is gone, dropping notification");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("observers", &self.observer_count())
            .finish()
    }
}

async fn dispatch(observers: Arc<ObserverList>, mut rx: mpsc::UnboundedReceiver<Notification>) {
    while let Some(notification) = rx.recv().await {
        // snapshot, so observers may (un)subscribe from inside a callback
        let current: Vec<Arc<dyn Observer>> = observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();
        for observer in current {
            observer.on_notification(&notification);
        }
    }
    trace!("notification dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn altitude(altitude: f64) -> Notification {
        Notification::AltitudeUpdated { altitude }
    }

    #[tokio::test]
    async fn observers_see_notifications_in_publish_order() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(move |n: &Notification| {
            let _ = tx.send(n.clone());
        });

        for i in 0..20 {
            bus.publish(altitude(i as f64));
        }
        for i in 0..20 {
            assert_eq!(rx.recv().await, Some(altitude(i as f64)));
        }
    }

    #[tokio::test]
    async fn unsubscribed_observer_receives_nothing_more() {
        let bus = EventBus::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = bus.subscribe(move |n: &Notification| {
            let _ = tx.send(n.kind());
        });

        bus.publish(altitude(1.0));
        assert_eq!(rx.recv().await, Some(NotificationKind::AltitudeUpdated));

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.observer_count(), 0);

        bus.publish(altitude(2.0));
        // the observer (and its sender) was dropped with the subscription
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn stream_yields_published_notifications() {
        let bus = EventBus::new();
        let mut stream = Box::pin(bus.stream());

        bus.publish(Notification::SpeedUpdated { ground_speed: 4.5 });
        bus.publish(Notification::ConnectionStateChanged(ConnectionState::Connecting));

        assert_eq!(
            stream.next().await,
            Some(Notification::SpeedUpdated { ground_speed: 4.5 })
        );
        assert_eq!(
            stream.next().await,
            Some(Notification::ConnectionStateChanged(ConnectionState::Connecting))
        );
    }
}
