use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use ulid::Ulid;

use crate::model::{Booking, BookingStatus};

const CHANNEL_CAPACITY: usize = 256;

/// What happened to a booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationKind {
    BookingCreated,
    StatusChanged { from: BookingStatus, to: BookingStatus },
}

/// A committed booking change, as delivered to listeners.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub kind: NotificationKind,
    pub booking: Booking,
}

impl Notification {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification queue is full")]
    QueueFull,
    #[error("notification queue is closed")]
    Closed,
}

/// Receives committed booking changes. Must not block: the engine calls it
/// right after a commit and only logs failures.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, kind: NotificationKind, booking: &Booking) -> Result<(), NotifyError>;
}

/// Broadcast hub for LISTEN/NOTIFY, one channel per provider.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a provider. Creates the channel if needed.
    pub fn subscribe(&self, provider_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(provider_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, provider_id: Ulid, notification: Notification) {
        if let Some(sender) = self.channels.get(&provider_id) {
            let _ = sender.send(notification);
        }
    }
}

impl NotificationSink for NotifyHub {
    fn notify(&self, kind: NotificationKind, booking: &Booking) -> Result<(), NotifyError> {
        self.send(
            booking.provider_id,
            Notification {
                kind,
                booking: booking.clone(),
            },
        );
        Ok(())
    }
}

/// Bounded queue feeding an out-of-band delivery worker.
pub struct QueueSink {
    tx: mpsc::Sender<Notification>,
}

impl QueueSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

impl NotificationSink for QueueSink {
    fn notify(&self, kind: NotificationKind, booking: &Booking) -> Result<(), NotifyError> {
        let notification = Notification {
            kind,
            booking: booking.clone(),
        };
        self.tx.try_send(notification).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => NotifyError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => NotifyError::Closed,
        })
    }
}

/// Fans every notification out to several sinks. Reports the first failure
/// after trying them all.
pub struct FanoutSink {
    sinks: Vec<std::sync::Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<std::sync::Arc<dyn NotificationSink>>) -> Self {
        Self { sinks }
    }
}

impl NotificationSink for FanoutSink {
    fn notify(&self, kind: NotificationKind, booking: &Booking) -> Result<(), NotifyError> {
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(e) = sink.notify(kind, booking)
                && first_err.is_none()
            {
                first_err = Some(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
