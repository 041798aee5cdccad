//! A broadcastable shutdown signal for a single connection.

use std::sync::{Arc, OnceLock};

use tokio::sync::broadcast;

/// A signal that can be fired once to tell every waiter on a [`Conn`](crate::conn::Conn)
/// to abandon its blocking operation.
///
/// Cloning a `Shutdown` gives another handle to the same underlying signal; firing it
/// through any clone wakes every other clone, including ones that start waiting after
/// the fact: a subscriber that arrives late still observes that a shutdown already
/// happened, instead of blocking forever.
#[derive(Debug, Clone)]
pub struct Shutdown {
    fired: Arc<OnceLock<()>>,
    notify: broadcast::Sender<()>,
}

impl Shutdown {
    /// Creates a new, not-yet-fired shutdown signal.
    pub fn new() -> Self {
        let (notify, _recv) = broadcast::channel(1);
        Self { fired: Arc::new(OnceLock::new()), notify }
    }

    /// Fires the signal. Idempotent: firing an already-fired signal does nothing.
    pub fn shut_down(&self) {
        if self.fired.set(()).is_ok() {
            let _ = self.notify.send(());
        }
    }

    /// Returns whether the signal has fired.
    pub fn is_shut_down(&self) -> bool {
        self.fired.get().is_some()
    }

    /// Waits until the signal fires. Returns immediately if it already has.
    pub async fn wait(&self) {
        let mut recv = self.notify.subscribe();

        loop {
            if self.is_shut_down() {
                return;
            }

            let _ = recv.recv().await;
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wakes_existing_waiters() {
        let shutdown = Shutdown::new();
        let waiters: Vec<_> = (0..3).map(|_| shutdown.clone()).collect();

        shutdown.shut_down();

        for w in waiters {
            w.wait().await;
            assert!(w.is_shut_down());
        }
    }

    #[tokio::test]
    async fn late_subscriber_sees_shutdown() {
        let shutdown = Shutdown::new();
        shutdown.shut_down();

        let late = shutdown.clone();
        late.wait().await;
        assert!(late.is_shut_down());
    }

    #[tokio::test]
    async fn shut_down_is_idempotent() {
        let shutdown = Shutdown::new();
        shutdown.shut_down();
        shutdown.shut_down();
        assert!(shutdown.is_shut_down());
    }
}
