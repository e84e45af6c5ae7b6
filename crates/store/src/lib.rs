//! Courier store: the single consumer of the watcher queue. Coalesces change events
//! per key and releases them to a [`Handler`], first immediately, then on a flush tick.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::ChangeEvent;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Receives every event the aggregator releases. Failures stay inside the handler.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, event: ChangeEvent);
}

#[async_trait]
impl<H: Handler + ?Sized> Handler for Arc<H> {
    async fn handle(&self, event: ChangeEvent) {
        (**self).handle(event).await
    }
}

/// Events waiting for the next flush, at most one per dedup key.
///
/// Each key owns one slot, assigned on first sight; a later event for the key
/// overwrites the slot in place, so a flush releases keys in first-seen order.
#[derive(Debug, Default)]
pub struct Pending {
    slots: Vec<ChangeEvent>,
    index: FxHashMap<String, usize>,
}

impl Pending {
    pub fn new() -> Self { Self::default() }

    pub fn len(&self) -> usize { self.slots.len() }
    pub fn is_empty(&self) -> bool { self.slots.is_empty() }

    /// Store `evt`, returning true when it replaced an older event for the same key.
    pub fn insert(&mut self, evt: ChangeEvent) -> bool {
        match self.index.get(&evt.key) {
            Some(&slot) => {
                self.slots[slot] = evt;
                true
            }
            None => {
                self.index.insert(evt.key.clone(), self.slots.len());
                self.slots.push(evt);
                false
            }
        }
    }

    /// Hand over every stored event and start empty.
    pub fn take_all(&mut self) -> Vec<ChangeEvent> {
        self.index.clear();
        std::mem::take(&mut self.slots)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("flush interval must be positive")]
pub struct ZeroFlushInterval;

/// Two-phase dispatcher over the shared event queue.
///
/// Until the first flush tick every event goes straight to the handler. From the first
/// tick on, events are coalesced per key and only released when the ticker fires.
pub struct Aggregator<H> {
    handler: H,
    flush_interval: Duration,
    pending: Pending,
    has_flushed_once: bool,
}

impl<H: Handler> Aggregator<H> {
    pub fn new(handler: H, flush_interval: Duration) -> Result<Self, ZeroFlushInterval> {
        if flush_interval.is_zero() {
            return Err(ZeroFlushInterval);
        }
        Ok(Self { handler, flush_interval, pending: Pending::new(), has_flushed_once: false })
    }

    /// Consume the queue until cancellation or until every sender is gone, then drain
    /// whatever is pending. Events still queued at cancellation are not read.
    pub async fn run(mut self, mut rx: mpsc::Receiver<ChangeEvent>, cancel: CancellationToken) {
        let period = self.flush_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(flush_secs = period.as_secs_f64(), "aggregator starting");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(pending = self.pending.len(), "aggregator stopping; draining");
                    self.flush().await;
                    break;
                }
                maybe = rx.recv() => match maybe {
                    Some(evt) => self.accept(evt).await,
                    None => {
                        debug!("event queue closed; draining and exiting");
                        self.flush().await;
                        break;
                    }
                },
                _ = ticker.tick() => {
                    self.has_flushed_once = true;
                    self.flush().await;
                }
            }
        }
        info!("aggregator stopped");
    }

    async fn accept(&mut self, evt: ChangeEvent) {
        if self.has_flushed_once {
            counter!("aggregator_buffered_total", 1u64);
            let (key, op) = (evt.key.clone(), evt.op);
            let replaced = self.pending.insert(evt);
            debug!(key = %key, op = %op, replaced, "buffered");
        } else {
            counter!("aggregator_passthrough_total", 1u64);
            self.handler.handle(evt).await;
        }
    }

    async fn flush(&mut self) {
        let batch = self.pending.take_all();
        let count = batch.len();
        counter!("aggregator_flush_total", 1u64);
        histogram!("aggregator_flush_size", count as f64);
        for evt in batch {
            self.handler.handle(evt).await;
        }
        debug!(count, "flushed");
    }
}

/// Spawn the aggregator loop. Await the handle after cancelling to make sure the final
/// drain has reached the handler.
pub fn spawn_aggregator<H>(
    handler: H,
    flush_interval: Duration,
    rx: mpsc::Receiver<ChangeEvent>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, ZeroFlushInterval>
where
    H: Handler + 'static,
{
    let aggregator = Aggregator::new(handler, flush_interval)?;
    Ok(tokio::spawn(aggregator.run(rx, cancel)))
}
