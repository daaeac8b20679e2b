use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_BACKOFF: Duration = Duration::from_secs(1);

/// Keeps one server-streaming call alive for the lifetime of the process.
///
/// `connect` opens a fresh stream (building its request each time) and every
/// received batch is handed to `on_batch` in arrival order before the next one
/// is read. When the stream ends, cleanly or with an error, the watcher waits
/// `backoff` and reconnects. There is no retry limit.
pub fn spawn_watcher<C, Fut, S, B, E, H>(
    name: &'static str,
    backoff: Duration,
    connect: C,
    on_batch: H,
) -> WatcherHandle
where
    C: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<S, E>> + Send + 'static,
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: Send + 'static,
    E: Display + Send + 'static,
    H: FnMut(B) + Send + 'static,
{
    let (stop, stop_rx) = watch::channel(false);
    let task = tokio::spawn(run_watcher(name, backoff, connect, on_batch, stop_rx));
    WatcherHandle {
        name,
        stop,
        task: Some(task),
    }
}

async fn run_watcher<C, Fut, S, B, E, H>(
    name: &'static str,
    backoff: Duration,
    mut connect: C,
    mut on_batch: H,
    mut stop: watch::Receiver<bool>,
) where
    C: FnMut() -> Fut,
    Fut: Future<Output = Result<S, E>>,
    S: Stream<Item = Result<B, E>>,
    E: Display,
    H: FnMut(B),
{
    let mut attempt: u64 = 0;
    while !*stop.borrow() {
        attempt += 1;
        debug!(event = "watcher_connect", watcher = name, attempt);
        // Leaving this select drops the stream, which cancels the call.
        let outcome = tokio::select! {
            _ = stop.changed() => break,
            outcome = pump(connect(), &mut on_batch) => outcome,
        };
        match outcome {
            Ok(batches) => info!(
                event = "watcher_stream_closed",
                watcher = name,
                batches,
                backoff_ms = backoff.as_millis() as u64
            ),
            Err(err) => warn!(
                event = "watcher_stream_error",
                watcher = name,
                error = %err,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                "cannot maintain connection to supervisor, reconnecting"
            ),
        }
        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
    }
    info!(event = "watcher_stopped", watcher = name);
}

async fn pump<Fut, S, B, E, H>(connect: Fut, on_batch: &mut H) -> Result<u64, E>
where
    Fut: Future<Output = Result<S, E>>,
    S: Stream<Item = Result<B, E>>,
    H: FnMut(B),
{
    let stream = connect.await?;
    let mut stream = std::pin::pin!(stream);
    let mut batches = 0;
    while let Some(batch) = stream.next().await {
        on_batch(batch?);
        batches += 1;
    }
    Ok(batches)
}

/// Owns one reconnect loop. Cancelling is idempotent and also happens on drop.
#[derive(Debug)]
pub struct WatcherHandle {
    name: &'static str,
    stop: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl WatcherHandle {
    pub fn cancel(&self) {
        if !self.stop.send_replace(true) {
            debug!(event = "watcher_cancel", watcher = self.name);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.stop.borrow()
    }

    /// Cancels the loop and waits for it to exit.
    pub async fn shutdown(mut self) {
        self.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    type Batches = stream::Iter<std::vec::IntoIter<Result<u32, String>>>;

    fn counting_connect(
        opens: Arc<AtomicUsize>,
        items: Vec<Result<u32, String>>,
        fail_connect: bool,
    ) -> impl FnMut() -> std::future::Ready<Result<Batches, String>> + Send + 'static {
        move || {
            opens.fetch_add(1, Ordering::SeqCst);
            if fail_connect {
                std::future::ready(Err("connection refused".to_string()))
            } else {
                std::future::ready(Ok(stream::iter(items.clone())))
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_backoff_on_error() {
        let opens = Arc::new(AtomicUsize::new(0));
        let handle = spawn_watcher(
            "test",
            Duration::from_secs(1),
            counting_connect(opens.clone(), Vec::new(), true),
            |_: u32| {},
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(opens.load(Ordering::SeqCst), 2);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_prevents_reconnect() {
        let opens = Arc::new(AtomicUsize::new(0));
        let handle = spawn_watcher(
            "test",
            Duration::from_secs(1),
            counting_connect(opens.clone(), Vec::new(), true),
            |_: u32| {},
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(opens.load(Ordering::SeqCst), 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn forwards_batches_in_order_and_reopens_after_close() {
        let opens = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = spawn_watcher(
            "test",
            Duration::from_secs(1),
            counting_connect(opens.clone(), vec![Ok(1), Ok(2), Ok(3)], false),
            move |batch| sink.lock().unwrap().push(batch),
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(opens.load(Ordering::SeqCst), 2);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 1, 2, 3]);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stream_error_stops_delivery_of_that_stream() {
        let opens = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handle = spawn_watcher(
            "test",
            Duration::from_secs(1),
            counting_connect(
                opens.clone(),
                vec![Ok(1), Err("reset".to_string()), Ok(2)],
                false,
            ),
            move |batch| sink.lock().unwrap().push(batch),
        );

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*seen.lock().unwrap(), vec![1]);
        drop(handle);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }
}
