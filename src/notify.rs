//! Notification fan-out.
//!
//! The directory emits a structured record for every seal and deletion so
//! external subscribers (workers, the scheduler above the store) can
//! track which objects exist. Records are pushed onto a bounded channel while
//! the directory lock is held, which gives subscribers a linear history
//! consistent with the table state at emission time; the consumer drains
//! the channel on its own thread and must never call back into the
//! directory.

use crate::id::ObjectId;
use kanal::{Receiver, Sender};

/// One seal or deletion event.
///
/// Deletion records carry only the id; seal records also carry the
/// payload sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectNotification {
    /// Id of the object the event is about.
    pub object_id: ObjectId,
    /// Data size in bytes (0 for deletions).
    pub data_size: i64,
    /// Metadata size in bytes (0 for deletions).
    pub metadata_size: i64,
    /// True for deletions and evictions, false for seals.
    pub is_deletion: bool,
}

impl ObjectNotification {
    /// A seal record for an object with the given payload sizes.
    pub fn sealed(object_id: ObjectId, data_size: usize, metadata_size: usize) -> Self {
        Self {
            object_id,
            data_size: data_size as i64,
            metadata_size: metadata_size as i64,
            is_deletion: false,
        }
    }

    /// A deletion record.
    pub fn deletion(object_id: ObjectId) -> Self {
        Self {
            object_id,
            data_size: 0,
            metadata_size: 0,
            is_deletion: true,
        }
    }
}

/// Receiving side of the notification channel; batches arrive in emission
/// order.
pub type NotificationReceiver = Receiver<Vec<ObjectNotification>>;

/// Sending side of the notification fan-out.
///
/// `notify` never blocks: the directory calls it while holding its lock,
/// so a slow subscriber must cost dropped batches rather than store
/// stalls.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: Sender<Vec<ObjectNotification>>,
}

impl Notifier {
    /// Create a notifier over a bounded channel of `capacity` batches.
    pub fn bounded(capacity: usize) -> (Self, NotificationReceiver) {
        let (tx, rx) = kanal::bounded(capacity);
        (Self { tx }, rx)
    }

    /// Push one batch of events to the subscriber.
    ///
    /// A full channel or a hung-up subscriber drops the batch with a
    /// warning.
    pub fn notify(&self, batch: Vec<ObjectNotification>) {
        if batch.is_empty() {
            return;
        }
        let len = batch.len();
        match self.tx.try_send(batch) {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!("notification queue full, dropping {} events", len);
            }
            Err(_) => {
                tracing::debug!("notification subscriber gone, dropping {} events", len);
            }
        }
    }
}
