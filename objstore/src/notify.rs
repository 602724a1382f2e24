//! Change notifications for external subscribers
use objstore_core::Key;
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What happened to the objects of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Store,
    Update,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Store => "store",
            Action::Update => "update",
            Action::Delete => "delete",
        })
    }
}

/// Objects of `key` changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub key: Key,
    pub action: Action,
}

pub type NotificationReceiver = mpsc::Receiver<Notification>;

/// Sending half of a bounded notification mailbox
///
/// A send waits for room in the mailbox, unless `done` fires first, so a producer never
/// blocks forever on a subscriber that stopped draining.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
    done: CancellationToken,
}

impl Notifier {
    pub fn new(tx: mpsc::Sender<Notification>, done: CancellationToken) -> Self {
        Self { tx, done }
    }

    /// A fresh mailbox holding up to `capacity` undelivered notifications
    pub fn channel(capacity: usize) -> (Self, NotificationReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx, CancellationToken::new()), rx)
    }

    /// The signal that unblocks stalled sends
    pub fn done(&self) -> &CancellationToken {
        &self.done
    }

    /// Another sender on the same mailbox, done when either it or `self` is done
    pub fn child(&self) -> Self {
        Self::new(self.tx.clone(), self.done.child_token())
    }

    /// Deliver a notification, returns whether it was accepted
    pub async fn send(&self, notification: Notification) -> bool {
        if self.done.is_cancelled() {
            return false;
        }
        let action = notification.action;
        let key = notification.key.clone();
        tokio::select! {
            biased;
            _ = self.done.cancelled() => {
                tracing::debug!(%key, %action, "notification dropped, done");
                false
            }
            res = self.tx.send(notification) => match res {
                Ok(()) => true,
                Err(mpsc::error::SendError(n)) => {
                    tracing::warn!(key = %n.key, action = %n.action, "notification dropped, no subscriber");
                    false
                }
            },
        }
    }
}
