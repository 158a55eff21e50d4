//! Per-session fan-out channel.
//!
//! Every discovery session owns one [`EventChannel`]. Backend callbacks push
//! into it from their own threads; subscribers each hold a broadcast receiver.
//! Sending never blocks: a subscriber that falls more than the buffer size
//! behind is terminated with [`BeaconError::Lagged`] instead of stalling the
//! backend or silently missing events.

use beacon_core::{BeaconError, Event};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// What travels over the broadcast channel.
#[derive(Debug, Clone)]
pub(crate) enum Signal {
    Event(Event),
    Failed(BeaconError),
}

pub(crate) struct EventChannel {
    label: String,
    tx: broadcast::Sender<Signal>,
    /// Set once; a failed channel emits nothing further.
    failure: Mutex<Option<BeaconError>>,
}

impl EventChannel {
    pub(crate) fn new(label: impl Into<String>, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            label: label.into(),
            tx,
            failure: Mutex::new(None),
        }
    }

    /// Attaches a new receiver. Returns the stored failure if the channel
    /// already terminated, so late subscribers still observe it.
    pub(crate) fn subscribe(&self) -> (broadcast::Receiver<Signal>, Option<BeaconError>) {
        let failure = self.failure.lock();
        (self.tx.subscribe(), failure.clone())
    }

    pub(crate) fn emit(&self, event: Event) {
        let failure = self.failure.lock();
        if failure.is_some() {
            debug!(session = %self.label, kind = ?event.kind(), "Channel already failed, dropping event");
            return;
        }

        match self.tx.send(Signal::Event(event)) {
            Ok(receivers) => trace!(session = %self.label, receivers, "Event delivered"),
            Err(broadcast::error::SendError(signal)) => {
                debug!(session = %self.label, ?signal, "No subscribers attached, event discarded")
            }
        }
    }

    /// Terminates the channel for every current subscriber. Only the first
    /// failure is kept.
    pub(crate) fn fail(&self, error: BeaconError) {
        let mut failure = self.failure.lock();
        if let Some(existing) = failure.as_ref() {
            debug!(session = %self.label, %existing, ignored = %error, "Channel already failed");
            return;
        }

        warn!(session = %self.label, %error, "Session failed");
        *failure = Some(error.clone());
        let _ = self.tx.send(Signal::Failed(error));
    }

    pub(crate) fn has_failed(&self) -> bool {
        self.failure.lock().is_some()
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    #[cfg(test)]
    pub(crate) fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
