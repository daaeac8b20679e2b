use tokio::sync::watch;

/// A value that is published at most once and stays readable afterwards.
///
/// Waiters that arrive after the value was published resolve immediately.
#[derive(Debug)]
pub struct OneShot<T> {
    slot: watch::Sender<Option<T>>,
}

impl<T: Clone> OneShot<T> {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self { slot }
    }

    /// Publishes `value` unless a value was already published. Returns whether
    /// this call was the one that fired.
    pub fn fire(&self, value: T) -> bool {
        self.slot.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
            true
        })
    }

    pub fn get(&self) -> Option<T> {
        self.slot.borrow().clone()
    }

    pub fn is_fired(&self) -> bool {
        self.slot.borrow().is_some()
    }

    pub async fn wait(&self) -> T {
        let mut rx = self.slot.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            if rx.changed().await.is_err() {
                return std::future::pending().await;
            }
        }
    }
}

impl<T: Clone> Default for OneShot<T> {
    fn default() -> Self {
        Self::new()
    }
}
