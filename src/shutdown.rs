use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio::sync::broadcast;

/// A signal used to stop [`SocketLayer::run`](crate::SocketLayer::run).
/// Clones are connected: shutting down any one of them stops all of them.
#[derive(Debug, Clone)]
pub struct Shutdown {
    notify: broadcast::Sender<()>,
    /// Set before the broadcast so waiters that subscribe late still see it.
    fired: Arc<AtomicBool>,
}

impl Shutdown {
    /// Creates a new active shutdown.
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(1);
        Self {
            notify,
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Signals every `Shutdown` cloned from this one.
    pub fn shut_down(&self) {
        self.fired.store(true, Ordering::SeqCst);
        // No receivers just means nobody is waiting yet.
        let _ = self.notify.send(());
    }

    pub fn is_shut_down(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Waits until some clone calls [`shut_down`](Self::shut_down). Returns
    /// immediately if that already happened.
    pub async fn wait_for_shutdown(&self) {
        use tokio::sync::broadcast::error::RecvError;

        let mut recv = self.notify.subscribe();
        if self.is_shut_down() {
            return;
        }
        loop {
            match recv.recv().await {
                Ok(()) | Err(RecvError::Closed) => return,
                Err(RecvError::Lagged(_)) => (),
            }
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
    async fn clones_observe_shutdown() {
        let shut0 = Shutdown::new();
        let shuts = [shut0.clone(), shut0.clone(), shut0.clone()];

        shuts[0].shut_down();

        for shut in shuts {
            shut.wait_for_shutdown().await;
            assert!(shut.is_shut_down());
        }
    }

    #[tokio::test]
    async fn waiter_wakes_on_later_signal() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let task = tokio::spawn(async move { waiter.wait_for_shutdown().await });
        tokio::task::yield_now().await;
        shutdown.shut_down();
        task.await.unwrap();
    }
}
