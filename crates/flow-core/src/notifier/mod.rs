//! Out-of-schedule wakeups for worker poll loops.
//!
//! The queue is always safe to poll on a fixed interval; a notifier is
//! purely a latency optimization that lets a freshly-inserted task get
//! picked up before the next tick. An external pub/sub bus (e.g. Postgres
//! `LISTEN`/`NOTIFY` fanned out across processes) is not implemented here;
//! this is the in-process broadcast used by a single worker binary running
//! several poll loops, or by tests.

use tokio::sync::broadcast;

/// Shared handle for announcing "a task was just inserted, consider
/// polling early". Cloned into every component that creates tasks.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<()>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Announce a wakeup. Dropped silently if nobody is subscribed.
    pub fn notify(&self) {
        let _ = self.tx.send(());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_notification() {
        let notifier = Notifier::default();
        let mut rx = notifier.subscribe();
        notifier.notify();
        assert!(rx.recv().await.is_ok());
    }

    #[tokio::test]
    async fn notify_without_subscribers_does_not_panic() {
        let notifier = Notifier::default();
        notifier.notify();
    }
}
