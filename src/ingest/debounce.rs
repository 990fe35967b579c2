//! Debounced event dispatch.
//!
//! Events are buffered in a coalescing window and flushed on a
//! recurring interval. Within one window, events with the same identity
//! (`collection:event:key`) collapse to the latest occurrence, so a
//! burst of saves to one record costs a single eviction.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use metrics::{counter, histogram};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::event::ChangeEvent;
use super::observers::ObserverRegistry;

const METRIC_INGEST_DISPATCHED: &str = "velo_ingest_dispatched_total";
const METRIC_INGEST_FLUSH_MS: &str = "velo_ingest_flush_ms";

/// Receive loop bridging the intake queue to the observer registry.
///
/// Runs until the shutdown signal fires or the intake channel closes;
/// either way the final buffer is flushed before returning, so an
/// accepted event is never silently dropped.
pub(super) async fn run_dispatch(
    mut rx: mpsc::Receiver<ChangeEvent>,
    observers: Arc<ObserverRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut pending: HashMap<String, ChangeEvent> = HashMap::new();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                // Drain whatever already reached the queue, then flush.
                while let Ok(event) = rx.try_recv() {
                    pending.insert(event.dedupe_key(), event);
                }
                flush(&mut pending, &observers).await;
                debug!("event dispatch stopped");
                return;
            }
            received = rx.recv() => {
                match received {
                    Some(event) => {
                        pending.insert(event.dedupe_key(), event);
                    }
                    None => {
                        flush(&mut pending, &observers).await;
                        debug!("intake channel closed; event dispatch stopped");
                        return;
                    }
                }
            }
            _ = ticker.tick() => {
                flush(&mut pending, &observers).await;
            }
        }
    }
}

/// Dispatch the buffered window to interested observers.
///
/// A panicking observer is contained: the panic is logged and the rest
/// of the window still dispatches.
async fn flush(pending: &mut HashMap<String, ChangeEvent>, observers: &ObserverRegistry) {
    if pending.is_empty() {
        return;
    }
    let window = std::mem::take(pending);
    let started = Instant::now();

    for (_, event) in window {
        let callbacks = observers.callbacks_for(&event.collection);
        if callbacks.is_empty() {
            debug!(
                collection = %event.collection,
                kind = %event.event,
                "no observer for change event"
            );
            continue;
        }
        for callback in callbacks {
            let outcome = AssertUnwindSafe(callback(event.clone()))
                .catch_unwind()
                .await;
            if outcome.is_err() {
                warn!(
                    collection = %event.collection,
                    kind = %event.event,
                    key = %event.key,
                    "observer panicked while handling change event"
                );
            }
        }
        counter!(METRIC_INGEST_DISPATCHED).increment(1);
    }

    histogram!(METRIC_INGEST_FLUSH_MS).record(started.elapsed().as_secs_f64() * 1_000.0);
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::Value;

    use crate::ingest::observers::{ObserverCallback, WILDCARD};

    use super::*;

    fn event(collection: &str, kind: &str, key: &str) -> ChangeEvent {
        ChangeEvent {
            event: kind.to_string(),
            payload: Value::Null,
            key: key.to_string(),
            collection: collection.to_string(),
        }
    }

    fn counting_callback(counter: Arc<AtomicUsize>) -> ObserverCallback {
        Arc::new(move |_event| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        })
    }

    fn recording_callback(sink: Arc<std::sync::Mutex<Vec<ChangeEvent>>>) -> ObserverCallback {
        Arc::new(move |event| {
            let sink = sink.clone();
            async move {
                sink.lock().expect("sink").push(event);
            }
            .boxed()
        })
    }

    struct Harness {
        tx: mpsc::Sender<ChangeEvent>,
        shutdown_tx: watch::Sender<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn_dispatch(observers: Arc<ObserverRegistry>, interval: Duration) -> Harness {
        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(run_dispatch(rx, observers, interval, shutdown_rx));
        Harness {
            tx,
            shutdown_tx,
            task,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_for_one_record_dispatches_the_last_event_once() {
        let observers = Arc::new(ObserverRegistry::new());
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        observers
            .add("users", recording_callback(seen.clone()))
            .expect("add");

        let harness = spawn_dispatch(observers, Duration::from_millis(100));
        for i in 0..5 {
            let mut burst = event("users", "update", "42");
            burst.payload = Value::from(i);
            harness.tx.send(burst).await.expect("send");
        }

        tokio::time::sleep(Duration::from_millis(250)).await;
        {
            let seen = seen.lock().expect("seen");
            assert_eq!(seen.len(), 1);
            assert_eq!(seen[0].payload, Value::from(4));
        }

        harness.shutdown_tx.send(true).expect("signal");
        harness.task.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn distinct_identities_dispatch_separately() {
        let observers = Arc::new(ObserverRegistry::new());
        let seen = Arc::new(AtomicUsize::new(0));
        observers
            .add(WILDCARD, counting_callback(seen.clone()))
            .expect("add");

        let harness = spawn_dispatch(observers, Duration::from_millis(100));
        harness.tx.send(event("users", "update", "1")).await.expect("send");
        harness.tx.send(event("users", "delete", "1")).await.expect("send");
        harness.tx.send(event("posts", "update", "1")).await.expect("send");

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        harness.shutdown_tx.send(true).expect("signal");
        harness.task.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_flushes_buffered_events() {
        let observers = Arc::new(ObserverRegistry::new());
        let seen = Arc::new(AtomicUsize::new(0));
        observers
            .add("users", counting_callback(seen.clone()))
            .expect("add");

        // Long interval so the ticker never fires before shutdown.
        let harness = spawn_dispatch(observers, Duration::from_secs(3600));
        harness
            .tx
            .send(event("users", "update", "1"))
            .await
            .expect("send");

        harness.shutdown_tx.send(true).expect("signal");
        harness.task.await.expect("join");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_observer_does_not_poison_dispatch() {
        let observers = Arc::new(ObserverRegistry::new());
        let panicking: ObserverCallback = Arc::new(|_event| {
            async {
                panic!("observer failure");
            }
            .boxed()
        });
        observers.add("users", panicking).expect("add");
        let seen = Arc::new(AtomicUsize::new(0));
        observers
            .add(WILDCARD, counting_callback(seen.clone()))
            .expect("add");

        let harness = spawn_dispatch(observers, Duration::from_millis(100));
        harness.tx.send(event("users", "update", "1")).await.expect("send");
        harness.tx.send(event("posts", "update", "2")).await.expect("send");

        tokio::time::sleep(Duration::from_millis(250)).await;
        // Wildcard ran for both events despite the exact observer panicking.
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        harness.shutdown_tx.send(true).expect("signal");
        harness.task.await.expect("join");
    }

    #[tokio::test(start_paused = true)]
    async fn closed_intake_flushes_and_stops() {
        let observers = Arc::new(ObserverRegistry::new());
        let seen = Arc::new(AtomicUsize::new(0));
        observers
            .add("users", counting_callback(seen.clone()))
            .expect("add");

        let harness = spawn_dispatch(observers, Duration::from_secs(3600));
        harness
            .tx
            .send(event("users", "update", "1"))
            .await
            .expect("send");
        drop(harness.tx);

        harness.task.await.expect("join");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
