use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

/// Results of a poll condition which are worth forwarding.
pub trait Truthy {
    fn is_truthy(&self) -> bool;
}

impl Truthy for bool {
    fn is_truthy(&self) -> bool {
        *self
    }
}

impl<T> Truthy for Option<T> {
    fn is_truthy(&self) -> bool {
        self.is_some()
    }
}

impl<T> Truthy for Vec<T> {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl<K, V> Truthy for BTreeMap<K, V> {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

impl<K, V, S> Truthy for HashMap<K, V, S> {
    fn is_truthy(&self) -> bool {
        !self.is_empty()
    }
}

/// A cloneable stop signal. Triggering it is idempotent and wakes every waiter
/// immediately.
#[derive(Clone, Debug)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Shutdown { tx: Arc::new(tx) }
    }

    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once `shutdown` has been called.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();

        loop {
            if *rx.borrow_and_update() {
                return;
            }

            // the sender lives as long as `self`, so this never fails
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

type Condition<T, E> = Box<dyn FnMut() -> Result<T, E> + Send>;
type Callback<T, E> = Box<dyn FnMut(T) -> Result<(), E> + Send>;
type ExceptionCallback<E> = Box<dyn FnOnce(E) + Send>;

/// Generic timed loop.
///
/// Every `interval` the condition is evaluated, truthy results are handed to
/// the callback. The first error from either of them stops the poller for good,
/// after the exception callback has been invoked exactly once.
pub struct Poller<T, E> {
    name: String,
    interval: Duration,
    condition: Condition<T, E>,
    callback: Callback<T, E>,
    on_exception: ExceptionCallback<E>,
    shutdown: Shutdown,
}

impl<T, E> Poller<T, E>
where
    T: Truthy + Send + 'static,
    E: Display + Send + 'static,
{
    pub fn new<C, F, X>(
        name: impl Into<String>,
        interval: Duration,
        condition: C,
        callback: F,
        on_exception: X,
    ) -> Self
    where
        C: FnMut() -> Result<T, E> + Send + 'static,
        F: FnMut(T) -> Result<(), E> + Send + 'static,
        X: FnOnce(E) + Send + 'static,
    {
        Poller {
            name: name.into(),
            interval,
            condition: Box::new(condition),
            callback: Box::new(callback),
            on_exception: Box::new(on_exception),
            shutdown: Shutdown::new(),
        }
    }

    /// The handle can be moved into the callback, to stop the poller from the
    /// inside.
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Spawn the loop onto the current tokio runtime.
    pub fn start(self) -> PollerHandle {
        let shutdown = self.shutdown.clone();
        let name = self.name.clone();
        let span = info_span!("poller", name = %self.name);
        let handle = tokio::spawn(self.run().instrument(span));

        PollerHandle {
            name,
            shutdown,
            handle,
        }
    }

    fn iterate(&mut self) -> Result<(), E> {
        let result = (self.condition)()?;
        if result.is_truthy() {
            (self.callback)(result)?;
        }

        Ok(())
    }

    async fn run(mut self) {
        debug!(message = "poller started", interval = ?self.interval);

        loop {
            if self.shutdown.is_shutdown() {
                break;
            }

            if let Err(err) = self.iterate() {
                self.shutdown.shutdown();

                error!(message = "poller stopped by error", %err);

                (self.on_exception)(err);
                return;
            }

            tokio::select! {
                biased;

                _ = self.shutdown.wait() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        debug!(message = "poller stopped");
    }
}

pub struct PollerHandle {
    name: String,
    shutdown: Shutdown,
    handle: JoinHandle<()>,
}

impl PollerHandle {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn shutdown(&self) {
        self.shutdown.shutdown()
    }

    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// True once the loop has exited, either by shutdown or by error.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the loop to exit, the current iteration always completes.
    pub async fn join(self) {
        if let Err(err) = self.handle.await {
            error!(message = "poller task failed", name = %self.name, ?err);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const INTERVAL: Duration = Duration::from_millis(10);

    #[tokio::test]
    async fn falsy_results_skip_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let evaluated = Arc::new(AtomicUsize::new(0));

        let e = Arc::clone(&evaluated);
        let c = Arc::clone(&calls);
        let poller = Poller::new(
            "falsy",
            INTERVAL,
            move || -> Result<Vec<u8>, String> {
                let n = e.fetch_add(1, Ordering::SeqCst);
                Ok(if n == 2 { vec![1] } else { vec![] })
            },
            move |items| {
                assert_eq!(items, vec![1]);
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            |err| panic!("unexpected error {err}"),
        );
        let handle = poller.start();

        testify::wait::wait_for(async || evaluated.load(Ordering::SeqCst) >= 5).await;
        handle.shutdown();
        handle.join().await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn error_stops_and_reports_once() {
        let reported = Arc::new(Mutex::new(vec![]));
        let evaluated = Arc::new(AtomicUsize::new(0));

        let e = Arc::clone(&evaluated);
        let r = Arc::clone(&reported);
        let poller = Poller::new(
            "failing",
            INTERVAL,
            move || {
                e.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(true)
            },
            |_| Err("boom".to_string()),
            move |err| r.lock().unwrap().push(err),
        );
        let shutdown = poller.shutdown_handle();
        let handle = poller.start();
        handle.join().await;

        assert!(shutdown.is_shutdown());
        assert_eq!(evaluated.load(Ordering::SeqCst), 1);
        assert_eq!(*reported.lock().unwrap(), vec!["boom".to_string()]);
    }

    #[tokio::test]
    async fn shutdown_from_inside_callback() {
        let calls = Arc::new(AtomicUsize::new(0));

        let c = Arc::clone(&calls);
        let mut poller = Poller::new(
            "inside",
            Duration::from_secs(3600),
            || Ok::<_, String>(Some(())),
            |_| Ok(()),
            |_| {},
        );
        let shutdown = poller.shutdown_handle();
        poller.callback = Box::new(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            shutdown.shutdown();
            // idempotent
            shutdown.shutdown();
            Ok(())
        });

        // the interval is an hour, so returning at all proves the sleep was cut short
        poller.start().join().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_interrupts_sleep() {
        let poller = Poller::new(
            "sleepy",
            Duration::from_secs(3600),
            || Ok::<_, String>(false),
            |_| Ok(()),
            |_| {},
        );
        let handle = poller.start();
        assert!(!handle.is_finished());

        tokio::time::sleep(INTERVAL).await;
        handle.shutdown();
        handle.shutdown();

        tokio::time::timeout(Duration::from_secs(5), handle.join())
            .await
            .expect("poller should exit promptly");
    }
}
