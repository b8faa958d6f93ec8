// src/notify.rs

//! Change notifications for catalog readers

use crossbeam::channel::{Receiver, Sender, unbounded};
use std::sync::{Mutex, PoisonError};
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CatalogEvent {
    /// A repository sync or settings change was committed
    CatalogChanged { repo_id: Option<i64> },
    /// Preferences or installed state of one package changed
    PackageChanged { package_name: String },
}

/// Fans events out to every live subscriber
#[derive(Debug, Default)]
pub struct Notifier {
    subscribers: Mutex<Vec<Sender<CatalogEvent>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<CatalogEvent> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Deliver `event` to all subscribers, dropping ones that hung up
    pub fn publish(&self, event: CatalogEvent) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        debug!("Published {:?} to {} subscribers", event, subscribers.len());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
