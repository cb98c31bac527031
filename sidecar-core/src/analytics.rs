//! AnalyticsPipeline (spec §4.7): bounded channel → batching ticker → keyed
//! publish to the message bus, drop-on-overflow, ≤3 attempts with no
//! backoff. Channel/ticker shape mirrors the teacher's scan-progress
//! pipeline (`ferrex-server/src/media/scan/scan_manager.rs`'s
//! `mpsc`-fed, periodically-flushed progress loop), generalized from an
//! unbounded progress channel to a bounded, drop-on-overflow one.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::ports::BusPublisher;
use crate::thresholds::Thresholds;

/// One event destined for the downstream bus. `topic` and `key` are set by
/// the producer (trigger handlers, metrics collector); `value` is already
/// serialized JSON.
#[derive(Debug, Clone, Serialize)]
pub struct AnalyticsEvent {
    pub topic: String,
    pub session_id: String,
    pub event_type: String,
    pub value: serde_json::Value,
}

impl AnalyticsEvent {
    fn key(&self) -> String {
        serde_json::json!({"sessionID": self.session_id, "eventType": self.event_type})
            .to_string()
    }
}

#[derive(Debug, Default)]
pub struct AnalyticsCounters {
    pub enqueued: AtomicU64,
    pub dropped_overflow: AtomicU64,
    pub batches_flushed: AtomicU64,
    pub batches_failed: AtomicU64,
}

/// Producer handle: cheap to clone, hands events into the bounded channel.
#[derive(Debug, Clone)]
pub struct AnalyticsHandle {
    pub(crate) sender: mpsc::Sender<AnalyticsEvent>,
    pub(crate) counters: Arc<AnalyticsCounters>,
}

impl AnalyticsHandle {
    /// Enqueue an event. Drops it and increments a counter on overflow —
    /// analytics correctness is best-effort, memory safety is paramount
    /// (spec §4.7).
    pub fn submit(&self, event: AnalyticsEvent) {
        match self.sender.try_send(event) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.dropped_overflow.fetch_add(1, Ordering::Relaxed);
                warn!("analytics queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("analytics consumer shut down, dropping event");
            }
        }
    }

    pub fn counters(&self) -> Arc<AnalyticsCounters> {
        self.counters.clone()
    }
}

/// Owns the consumer task. Construct with [`AnalyticsPipeline::spawn`], keep
/// the returned [`AnalyticsHandle`] for producers and the [`CancellationToken`]
/// for shutdown.
pub struct AnalyticsPipeline;

impl AnalyticsPipeline {
    pub fn spawn<B: BusPublisher + 'static>(
        bus: Arc<B>,
        thresholds: Thresholds,
        cancel: CancellationToken,
    ) -> AnalyticsHandle {
        let (tx, rx) = mpsc::channel(thresholds.analytics_queue_capacity);
        let counters = Arc::new(AnalyticsCounters::default());
        let handle = AnalyticsHandle {
            sender: tx,
            counters: counters.clone(),
        };
        tokio::spawn(run_consumer(bus, rx, thresholds, cancel, counters));
        handle
    }
}

async fn run_consumer<B: BusPublisher + 'static>(
    bus: Arc<B>,
    mut rx: mpsc::Receiver<AnalyticsEvent>,
    thresholds: Thresholds,
    cancel: CancellationToken,
    counters: Arc<AnalyticsCounters>,
) {
    let mut batch: HashMap<String, Vec<AnalyticsEvent>> = HashMap::new();
    let mut ticker = tokio::time::interval(thresholds.flush_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                flush(&bus, &mut batch, &counters).await;
                break;
            }
            maybe_event = rx.recv() => {
                match maybe_event {
                    Some(event) => {
                        batch.entry(event.topic.clone()).or_default().push(event);
                    }
                    None => {
                        flush(&bus, &mut batch, &counters).await;
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush(&bus, &mut batch, &counters).await;
                }
            }
        }
    }
}

async fn flush<B: BusPublisher>(
    bus: &Arc<B>,
    batch: &mut HashMap<String, Vec<AnalyticsEvent>>,
    counters: &Arc<AnalyticsCounters>,
) {
    if batch.is_empty() {
        return;
    }
    let drained: Vec<(String, Vec<AnalyticsEvent>)> = batch.drain().collect();
    for (topic, events) in drained {
        for event in events {
            let key = event.key();
            let Ok(value) = serde_json::to_vec(&event.value) else {
                warn!(%topic, "analytics event failed to serialize, dropping");
                counters.batches_failed.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            let mut attempts = 0;
            loop {
                attempts += 1;
                match bus.publish(&topic, &key, &value).await {
                    Ok(()) => {
                        counters.batches_flushed.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                    Err(err) if attempts < 3 => {
                        warn!(error = %err, attempts, %topic, "bus publish failed, retrying");
                    }
                    Err(err) => {
                        error!(error = %err, %topic, "bus publish failed after 3 attempts, dropping batch");
                        counters.batches_failed.fetch_add(1, Ordering::Relaxed);
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::MockBusPublisher;
    use std::sync::atomic::Ordering;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn submit_then_flush_publishes_once() {
        let mut mock = MockBusPublisher::new();
        mock.expect_publish()
            .times(1)
            .returning(|_, _, _| Ok(()));
        let cancel = CancellationToken::new();
        let handle = AnalyticsPipeline::spawn(
            Arc::new(mock),
            Thresholds {
                flush_interval: StdDuration::from_millis(20),
                ..Thresholds::default()
            },
            cancel.clone(),
        );
        handle.submit(AnalyticsEvent {
            topic: "stream.state.s1".to_string(),
            session_id: "sess1".to_string(),
            event_type: "state".to_string(),
            value: serde_json::json!({"active": true}),
        });
        tokio::time::sleep(StdDuration::from_millis(60)).await;
        cancel.cancel();
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(handle.counters().batches_flushed.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn overflow_drops_and_counts() {
        let mock = MockBusPublisher::new();
        let cancel = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(1);
        let counters = Arc::new(AnalyticsCounters::default());
        let handle = AnalyticsHandle {
            sender: tx,
            counters: counters.clone(),
        };
        handle.submit(AnalyticsEvent {
            topic: "t".to_string(),
            session_id: "s".to_string(),
            event_type: "e".to_string(),
            value: serde_json::Value::Null,
        });
        handle.submit(AnalyticsEvent {
            topic: "t".to_string(),
            session_id: "s".to_string(),
            event_type: "e".to_string(),
            value: serde_json::Value::Null,
        });
        assert_eq!(counters.dropped_overflow.load(Ordering::Relaxed), 1);
        drop(mock);
        let _ = cancel;
    }

    #[tokio::test]
    async fn publish_failure_retries_three_times_then_drops() {
        let mut mock = MockBusPublisher::new();
        mock.expect_publish()
            .times(3)
            .returning(|_, _, _| Err(crate::error::BusError::PublishFailed(
                reqwest_timeout_error(),
            )));
        let cancel = CancellationToken::new();
        let handle = AnalyticsPipeline::spawn(
            Arc::new(mock),
            Thresholds {
                flush_interval: StdDuration::from_millis(20),
                ..Thresholds::default()
            },
            cancel.clone(),
        );
        handle.submit(AnalyticsEvent {
            topic: "t".to_string(),
            session_id: "s".to_string(),
            event_type: "e".to_string(),
            value: serde_json::Value::Null,
        });
        tokio::time::sleep(StdDuration::from_millis(80)).await;
        cancel.cancel();
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert_eq!(handle.counters().batches_failed.load(Ordering::Relaxed), 1);
    }

    fn reqwest_timeout_error() -> reqwest::Error {
        // `reqwest::Error` has no public constructor; build a request against
        // an invalid URL scheme and take the construction error, which is of
        // the same type bus failures are modeled with.
        reqwest::Client::new()
            .get("not-a-url")
            .build()
            .expect_err("malformed URL must fail to build")
    }
}
