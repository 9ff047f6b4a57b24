// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Acknowledgment Batching
//!
//! Deliveries register a pending record in an [`AckBatch`]; the handler later
//! flips it to ack, nack or reject through its [`MessageHandle`]. A periodic
//! signal calls [`AckBatch::process_batch`], which resolves the leading run of
//! identically disposed records with one inclusive broker call.
//!
//! A record is never resolved while an earlier record is still pending, so the
//! broker only ever sees acknowledgments for a prefix of the deliveries.

use crate::errors::AmqpError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::{sync::broadcast, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Pending,
    Ack,
    /// Negative acknowledgment with requeue.
    Nack,
    /// Negative acknowledgment without requeue.
    Reject,
}

/// Result of one batch signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// A resolution is already in flight.
    Busy,
    Empty,
    /// The oldest record is still pending.
    Waiting,
    Resolved {
        disposition: Disposition,
        tag: u64,
        count: usize,
    },
    /// The resolver failed; records are kept for the next signal.
    Failed(AmqpError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEvent {
    /// Every record has been resolved.
    Empty,
}

/// Sends the resolution of a tag range to the broker.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AckResolver: Send + Sync {
    async fn resolve(
        &self,
        disposition: Disposition,
        tag: u64,
        inclusive: bool,
    ) -> Result<(), AmqpError>;
}

#[derive(Debug, Clone, Copy)]
struct Record {
    tag: u64,
    disposition: Disposition,
}

#[derive(Debug, Default, Clone, Copy)]
struct Marks {
    ack: Option<u64>,
    nack: Option<u64>,
    reject: Option<u64>,
}

impl Marks {
    fn get(&self, disposition: Disposition) -> Option<u64> {
        match disposition {
            Disposition::Ack => self.ack,
            Disposition::Nack => self.nack,
            Disposition::Reject => self.reject,
            Disposition::Pending => None,
        }
    }

    fn set(&mut self, disposition: Disposition, tag: Option<u64>) {
        match disposition {
            Disposition::Ack => self.ack = tag,
            Disposition::Nack => self.nack = tag,
            Disposition::Reject => self.reject = tag,
            Disposition::Pending => {}
        }
    }
}

#[derive(Default)]
struct BatchState {
    records: VecDeque<Record>,
    acking: bool,
    epoch: u64,
    received: u64,
    last_resolved: Marks,
    first_pending: Marks,
}

impl BatchState {
    fn mark(&mut self, tag: u64, disposition: Disposition) -> bool {
        let Some(record) = self.records.iter_mut().find(|r| r.tag == tag) else {
            return false;
        };
        if record.disposition != Disposition::Pending {
            return false;
        }
        record.disposition = disposition;

        match self.first_pending.get(disposition) {
            Some(first) if first <= tag => {}
            _ => self.first_pending.set(disposition, Some(tag)),
        }
        true
    }

    fn plan(&self) -> Result<(Disposition, u64, usize), BatchOutcome> {
        let front = match self.records.front() {
            None => return Err(BatchOutcome::Empty),
            Some(r) if r.disposition == Disposition::Pending => {
                return Err(BatchOutcome::Waiting)
            }
            Some(r) => *r,
        };

        let run = self
            .records
            .iter()
            .take_while(|r| r.disposition == front.disposition)
            .count();
        let tag = self.records[run - 1].tag;

        Ok((front.disposition, tag, run))
    }

    fn settle(&mut self, disposition: Disposition, tag: u64, count: usize) {
        self.records.drain(..count);
        self.last_resolved.set(disposition, Some(tag));

        let next = self
            .records
            .iter()
            .find(|r| r.disposition == disposition)
            .map(|r| r.tag);
        self.first_pending.set(disposition, next);
    }
}

/// Per-message disposition switch. Only the first disposition applied to a
/// message takes effect, and handles from before a [`AckBatch::reset`] are inert.
#[derive(Clone)]
pub struct MessageHandle {
    tag: u64,
    epoch: u64,
    state: Weak<Mutex<BatchState>>,
}

impl MessageHandle {
    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn ack(&self) -> bool {
        self.set(Disposition::Ack)
    }

    pub fn nack(&self) -> bool {
        self.set(Disposition::Nack)
    }

    pub fn reject(&self) -> bool {
        self.set(Disposition::Reject)
    }

    /// Whether the message still awaits a disposition.
    pub fn is_pending(&self) -> bool {
        let Some(state) = self.state.upgrade() else {
            return false;
        };
        let state = state.lock();
        state.epoch == self.epoch
            && state
                .records
                .iter()
                .any(|r| r.tag == self.tag && r.disposition == Disposition::Pending)
    }

    fn set(&self, disposition: Disposition) -> bool {
        let Some(state) = self.state.upgrade() else {
            return false;
        };
        let mut state = state.lock();
        if state.epoch != self.epoch {
            return false;
        }
        state.mark(self.tag, disposition)
    }
}

/// Ordered in-flight deliveries of one queue consumer.
#[derive(Clone)]
pub struct AckBatch {
    name: String,
    state: Arc<Mutex<BatchState>>,
    resolver: Arc<dyn AckResolver>,
    events: broadcast::Sender<BatchEvent>,
}

impl AckBatch {
    pub fn new(name: &str, resolver: Arc<dyn AckResolver>) -> AckBatch {
        let (events, _) = broadcast::channel(16);
        AckBatch {
            name: name.to_owned(),
            state: Arc::new(Mutex::new(BatchState::default())),
            resolver,
            events,
        }
    }

    /// Registers a delivery. Tags must be added in ascending order.
    pub fn add_message(&self, tag: u64) -> MessageHandle {
        let mut state = self.state.lock();
        if let Some(back) = state.records.back() {
            if back.tag >= tag {
                warn!(
                    batch = self.name,
                    tag,
                    last = back.tag,
                    "delivery tag is not ascending"
                );
            }
        }

        state.records.push_back(Record {
            tag,
            disposition: Disposition::Pending,
        });
        state.received += 1;

        MessageHandle {
            tag,
            epoch: state.epoch,
            state: Arc::downgrade(&self.state),
        }
    }

    /// Resolves the leading run of identically disposed records.
    pub async fn process_batch(&self) -> BatchOutcome {
        let (epoch, disposition, tag, count) = {
            let mut state = self.state.lock();
            if state.acking {
                return BatchOutcome::Busy;
            }
            match state.plan() {
                Ok((disposition, tag, count)) => {
                    state.acking = true;
                    (state.epoch, disposition, tag, count)
                }
                Err(outcome) => return outcome,
            }
        };

        debug!(batch = self.name, ?disposition, tag, count, "resolving batch");
        let result = self.resolver.resolve(disposition, tag, true).await;

        let mut state = self.state.lock();
        if state.epoch != epoch {
            debug!(batch = self.name, tag, "batch was reset during resolution");
            return BatchOutcome::Empty;
        }
        state.acking = false;

        match result {
            Ok(()) => {
                state.settle(disposition, tag, count);
                if state.records.is_empty() {
                    let _ = self.events.send(BatchEvent::Empty);
                }
                BatchOutcome::Resolved {
                    disposition,
                    tag,
                    count,
                }
            }
            Err(err) => {
                warn!(
                    batch = self.name,
                    error = err.to_string(),
                    tag,
                    "failure to resolve batch, retrying on next signal"
                );
                BatchOutcome::Failed(err)
            }
        }
    }

    /// Forgets every record. Outstanding handles become inert.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.epoch += 1;
        state.records.clear();
        state.acking = false;
        state.first_pending = Marks::default();
        let _ = self.events.send(BatchEvent::Empty);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.events.subscribe()
    }

    /// Resolves once no record is left.
    pub async fn wait_empty(&self) {
        let mut events = self.events.subscribe();
        while !self.is_empty() {
            match events.recv().await {
                Ok(BatchEvent::Empty) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    }

    /// Drives [`AckBatch::process_batch`] every `interval` until the handle is aborted.
    pub fn listen(&self, interval: Duration) -> JoinHandle<()> {
        let batch = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                batch.process_batch().await;
            }
        })
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }

    /// Deliveries registered since creation.
    pub fn received(&self) -> u64 {
        self.state.lock().received
    }

    /// Highest tag resolved with `disposition`.
    pub fn last_resolved(&self, disposition: Disposition) -> Option<u64> {
        self.state.lock().last_resolved.get(disposition)
    }

    /// Lowest unresolved tag flagged with `disposition`.
    pub fn first_pending(&self, disposition: Disposition) -> Option<u64> {
        self.state.lock().first_pending.get(disposition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type Calls = Arc<Mutex<Vec<(Disposition, u64, bool)>>>;

    fn recording(calls: Calls) -> MockAckResolver {
        let mut resolver = MockAckResolver::new();
        resolver
            .expect_resolve()
            .returning(move |disposition, tag, inclusive| {
                calls.lock().push((disposition, tag, inclusive));
                Ok(())
            });
        resolver
    }

    #[tokio::test]
    async fn uniform_batch_resolves_in_one_call() {
        let mut resolver = MockAckResolver::new();
        resolver
            .expect_resolve()
            .withf(|d, tag, inclusive| *d == Disposition::Ack && *tag == 105 && *inclusive)
            .times(1)
            .returning(|_, _, _| Ok(()));
        let batch = AckBatch::new("orders", Arc::new(resolver));
        let mut events = batch.subscribe();

        for tag in 101..=105 {
            assert!(batch.add_message(tag).ack());
        }

        assert_eq!(
            batch.process_batch().await,
            BatchOutcome::Resolved {
                disposition: Disposition::Ack,
                tag: 105,
                count: 5
            }
        );
        assert!(batch.is_empty());
        assert_eq!(events.try_recv().unwrap(), BatchEvent::Empty);
        assert_eq!(batch.last_resolved(Disposition::Ack), Some(105));
        assert_eq!(batch.received(), 5);
    }

    #[tokio::test]
    async fn mixed_batch_resolves_one_run_per_signal() {
        let calls = Calls::default();
        let batch = AckBatch::new("orders", Arc::new(recording(calls.clone())));

        let handles: Vec<_> = (101..=106).map(|tag| batch.add_message(tag)).collect();
        handles[0].ack();
        handles[1].ack();
        handles[2].nack();
        handles[3].nack();
        handles[4].reject();
        handles[5].reject();
        assert_eq!(batch.first_pending(Disposition::Nack), Some(103));

        for _ in 0..3 {
            assert!(matches!(
                batch.process_batch().await,
                BatchOutcome::Resolved { .. }
            ));
        }

        assert_eq!(
            *calls.lock(),
            vec![
                (Disposition::Ack, 102, true),
                (Disposition::Nack, 104, true),
                (Disposition::Reject, 106, true),
            ]
        );
        assert!(batch.is_empty());
        assert_eq!(batch.first_pending(Disposition::Nack), None);
        assert_eq!(batch.process_batch().await, BatchOutcome::Empty);
    }

    #[tokio::test]
    async fn pending_front_blocks_later_resolutions() {
        let mut resolver = MockAckResolver::new();
        resolver.expect_resolve().never();
        let batch = AckBatch::new("orders", Arc::new(resolver));

        let _first = batch.add_message(1);
        batch.add_message(2).ack();
        batch.add_message(3).ack();

        assert_eq!(batch.process_batch().await, BatchOutcome::Waiting);
        assert_eq!(batch.len(), 3);
    }

    #[tokio::test]
    async fn resolver_failure_keeps_records_for_the_next_signal() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let mut resolver = MockAckResolver::new();
        resolver.expect_resolve().times(2).returning(move |_, _, _| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(AmqpError::AckMessageError("channel closed".to_owned()))
            } else {
                Ok(())
            }
        });
        let batch = AckBatch::new("orders", Arc::new(resolver));
        batch.add_message(7).ack();

        assert!(matches!(
            batch.process_batch().await,
            BatchOutcome::Failed(_)
        ));
        assert_eq!(batch.len(), 1);

        assert!(matches!(
            batch.process_batch().await,
            BatchOutcome::Resolved { tag: 7, .. }
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn first_disposition_wins_and_reset_disarms_handles() {
        let batch = AckBatch::new("orders", Arc::new(recording(Calls::default())));
        let handle = batch.add_message(1);

        assert!(handle.is_pending());
        assert!(handle.reject());
        assert!(!handle.ack());

        let stale = batch.add_message(2);
        batch.reset();
        assert!(batch.is_empty());
        assert!(!stale.ack());
        assert!(!stale.is_pending());

        let fresh = batch.add_message(1);
        assert!(fresh.ack());
    }

    #[tokio::test]
    async fn wait_empty_returns_once_drained() {
        let batch = AckBatch::new("orders", Arc::new(recording(Calls::default())));
        let handle = batch.add_message(1);

        let waiter = {
            let batch = batch.clone();
            tokio::spawn(async move { batch.wait_empty().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        handle.ack();
        batch.process_batch().await;
        waiter.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn listener_drives_resolution() {
        let calls = Calls::default();
        let batch = AckBatch::new("orders", Arc::new(recording(calls.clone())));
        let ticker = batch.listen(Duration::from_millis(500));

        batch.add_message(1).ack();
        batch.add_message(2).nack();
        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(batch.is_empty());
        assert_eq!(calls.lock().len(), 2);
        ticker.abort();
    }

    #[tokio::test]
    async fn resolutions_never_pass_a_pending_record() {
        let calls = Calls::default();
        let batch = AckBatch::new("orders", Arc::new(recording(calls.clone())));
        let dispositions = [Disposition::Ack, Disposition::Nack, Disposition::Reject];

        let mut seed: u64 = 0x2545_f491;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        let handles: Vec<_> = (1..=200).map(|tag| batch.add_message(tag)).collect();
        let mut model = vec![Disposition::Pending; 201];
        let mut resolved_up_to = 0;

        while resolved_up_to < 200 {
            for _ in 0..10 {
                let idx = (next() % 200) as usize;
                let disposition = dispositions[(next() % 3) as usize];
                let flipped = match disposition {
                    Disposition::Ack => handles[idx].ack(),
                    Disposition::Nack => handles[idx].nack(),
                    _ => handles[idx].reject(),
                };
                if flipped {
                    model[idx + 1] = disposition;
                }
            }

            if let BatchOutcome::Resolved {
                disposition, tag, ..
            } = batch.process_batch().await
            {
                assert!(tag as usize > resolved_up_to);
                for t in resolved_up_to + 1..=tag as usize {
                    assert_eq!(model[t], disposition);
                }
                resolved_up_to = tag as usize;
            }
        }

        let tags: Vec<u64> = calls.lock().iter().map(|(_, tag, _)| *tag).collect();
        assert!(tags.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(*tags.last().unwrap(), 200);
    }
}
