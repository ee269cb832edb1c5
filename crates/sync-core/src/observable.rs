//! Single-writer, multi-reader value cell.

use tokio::sync::watch;

/// Owned, writable side of an observable value.
///
/// Only the owner can change the value; everyone else gets an
/// [`Observable`] reader.
#[derive(Debug)]
pub struct ObservableValue<T> {
    tx: watch::Sender<T>,
}

impl<T: Clone + PartialEq> ObservableValue<T> {
    pub fn new(initial: T) -> Self {
        let (tx, _) = watch::channel(initial);
        Self { tx }
    }

    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }

    /// Replace the value; subscribers are only woken when it differs.
    ///
    /// Returns whether the value changed.
    pub fn set(&self, value: T) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        })
    }

    pub fn reader(&self) -> Observable<T> {
        Observable {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read-only handle onto an [`ObservableValue`].
#[derive(Debug, Clone)]
pub struct Observable<T> {
    rx: watch::Receiver<T>,
}

impl<T: Clone> Observable<T> {
    pub fn get(&self) -> T {
        self.rx.borrow().clone()
    }

    /// Wait for the next change and return the new value.
    ///
    /// Returns `None` once the writer is gone.
    pub async fn changed(&mut self) -> Option<T> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// Wait until the value satisfies `predicate`, checking the current value
    /// first.
    pub async fn wait_for(&mut self, mut predicate: impl FnMut(&T) -> bool) -> Option<T> {
        self.rx
            .wait_for(|value| predicate(value))
            .await
            .ok()
            .map(|value| T::clone(&value))
    }

    /// Raw watch receiver, for `select!` loops.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.rx.clone()
    }
}
