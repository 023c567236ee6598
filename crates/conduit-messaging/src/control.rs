//! Cooperative cancellation token, plumbed from the top-level acceptor down
//! to every connection task.

use tokio::sync::watch;

/// The cancel side. Dropping the source does NOT cancel outstanding tokens;
/// cancellation is always explicit.
pub struct ControlTokenSource {
    tx: watch::Sender<bool>,
}

/// The observe side. Cheap to clone; one per task.
#[derive(Clone)]
pub struct ControlToken {
    rx: watch::Receiver<bool>,
}

impl ControlTokenSource {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn token(&self) -> ControlToken {
        ControlToken {
            rx: self.tx.subscribe(),
        }
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_canceled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ControlTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlToken {
    /// A token that can never fire, for tests and standalone connections.
    pub fn none() -> Self {
        let (tx, rx) = watch::channel(false);
        // Keep the sender alive forever so the channel never closes.
        std::mem::forget(tx);
        Self { rx }
    }

    pub fn is_canceled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves when cancellation is requested. Used in select! arms next
    /// to pending I/O.
    pub async fn canceled(&mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Source dropped without canceling; park forever.
                std::future::pending::<()>().await;
            }
        }
    }
}
