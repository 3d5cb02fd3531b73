//! Single-slot notification mailboxes.
//!
//! Each subscribed characteristic has one [`Mailbox`]. The transport's
//! notification pump puts payloads in, a notifying read takes them out.
//! Only the latest undelivered payload is kept.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use tokio::sync::Notify;

use crate::transport::CharacteristicPath;

/// Latest-value-wins slot for one characteristic.
#[derive(Debug, Default)]
pub struct Mailbox {
    slot: Mutex<Option<Bytes>>,
    notify: Notify,
}

impl Mailbox {
    /// Create an empty mailbox.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a payload, replacing any undelivered one.
    ///
    /// Returns `true` if an undelivered payload was dropped.
    pub fn put(&self, payload: Bytes) -> bool {
        let replaced = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(payload)
            .is_some();
        self.notify.notify_waiters();
        replaced
    }

    /// Take the undelivered payload without waiting.
    pub fn try_take(&self) -> Option<Bytes> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Wait for a payload and take it.
    pub async fn take(&self) -> Bytes {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(payload) = self.try_take() {
                return payload;
            }
            notified.await;
        }
    }

    /// Drop any undelivered payload.
    pub fn clear(&self) {
        self.try_take();
    }
}

/// Mailboxes keyed by characteristic path.
#[derive(Debug, Default)]
pub struct Mailboxes {
    boxes: Mutex<HashMap<CharacteristicPath, Arc<Mailbox>>>,
}

impl Mailboxes {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mailbox of a path, created on first use.
    pub fn get(&self, path: &CharacteristicPath) -> Arc<Mailbox> {
        let mut boxes = self.boxes.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(boxes.entry(path.clone()).or_default())
    }

    /// Deliver a payload to a path.
    pub fn deliver(&self, path: &CharacteristicPath, payload: Bytes) -> bool {
        self.get(path).put(payload)
    }

    /// Drop the undelivered payload of a path.
    pub fn clear(&self, path: &CharacteristicPath) {
        if let Some(mailbox) = self
            .boxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
        {
            mailbox.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_latest_value_wins() {
        let mailbox = Mailbox::new();
        assert!(!mailbox.put(Bytes::from_static(&[1])));
        assert!(mailbox.put(Bytes::from_static(&[2])));

        assert_eq!(mailbox.take().await, Bytes::from_static(&[2]));
        assert_eq!(mailbox.try_take(), None);
    }

    #[tokio::test]
    async fn test_take_waits_for_put() {
        let mailbox = Arc::new(Mailbox::new());
        let reader = {
            let mailbox = Arc::clone(&mailbox);
            tokio::spawn(async move { mailbox.take().await })
        };
        tokio::task::yield_now().await;
        assert!(!reader.is_finished());

        mailbox.put(Bytes::from_static(b"x"));
        let payload = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(payload, Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn test_table_clear() {
        let boxes = Mailboxes::new();
        let path = CharacteristicPath::new("/p");
        boxes.deliver(&path, Bytes::from_static(&[9]));
        boxes.clear(&path);
        assert_eq!(boxes.get(&path).try_take(), None);
    }
}
