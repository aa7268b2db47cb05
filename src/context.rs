//! Cooperative cancellation for bus operations.
//!
//! A `Context` is a cheap, cloneable view of a cancellation flag carried by a
//! `tokio::sync::watch` channel. Operations probe it before doing work and
//! race it against every suspension point (buffer send, network write,
//! backend read), so a cancelled caller never leaves a half-sent message or a
//! parked task behind.

use std::sync::Arc;

use tokio::sync::watch;

/// Cancellation signal passed to `publish`/`consume` and to backends.
#[derive(Clone, Debug)]
pub struct Context {
    rx: watch::Receiver<bool>,
}

/// Owner side of a cancellable `Context`.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    /// Cancel the associated context. Calling this more than once is a no-op.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// True once `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Context {
    /// A context that is never cancelled.
    pub fn background() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// A fresh context together with the handle that cancels it.
    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (Self { rx }, CancelHandle { tx: Arc::new(tx) })
    }

    /// Derive a context that is cancelled when either `self` or the returned
    /// handle is cancelled.
    ///
    /// The link to the parent is held by a small task, so this must be called
    /// from within a tokio runtime.
    pub fn child(&self) -> (Self, CancelHandle) {
        let (child, handle) = Self::with_cancel();
        if self.is_cancelled() {
            handle.cancel();
            return (child, handle);
        }

        let parent = self.clone();
        let link = handle.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = parent.cancelled() => link.cancel(),
                _ = link.tx.closed() => {}
            }
        });

        (child, handle)
    }

    /// Non-blocking probe.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the context is cancelled.
    ///
    /// For a context whose handle has been dropped without cancelling (or for
    /// `background()`), this never resolves.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                // Sender gone without cancelling: nothing can cancel us now.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}
