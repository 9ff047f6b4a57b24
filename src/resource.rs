// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Resource Lifecycle
//!
//! [`Resource`] wraps one externally acquired object (a connection or a
//! channel) and keeps it usable across failures:
//!
//! ```text
//! idle -> acquiring -> acquired <-> blocked
//!              ^          |
//!              |          +-- error --> failed --(backoff)--> acquiring
//!              |          +-- remote close --> closed --(acquire)--> acquiring
//!              +-- releasing -> released          destroyed
//! ```
//!
//! Operations submitted while the resource is not acquired are queued and
//! replayed in submission order once it is. Operations on a released resource
//! fail immediately.

use crate::{
    config::RetryConfigs,
    errors::AmqpError,
    transport::{Lifecycle, TransportEvent},
};
use async_trait::async_trait;
use futures_util::{future::BoxFuture, FutureExt};
use parking_lot::Mutex;
use std::{collections::VecDeque, future::Future, sync::Arc, time::Duration};
use tokio::{
    sync::{broadcast, oneshot, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

const EVENTS_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Acquiring,
    Acquired,
    Blocked,
    Failed,
    Closed,
    Releasing,
    Released,
    Destroyed,
}

/// Notifications emitted on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceEvent {
    Acquiring,
    Acquired,
    Failed(AmqpError),
    Closed(String),
    Blocked(String),
    Unblocked,
    Released,
    Destroyed,
}

/// Bounded, linearly growing wait between acquisition attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub min: Duration,
    pub max: Duration,
    pub increment: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::from(&RetryConfigs::default())
    }
}

impl From<&RetryConfigs> for Backoff {
    fn from(cfg: &RetryConfigs) -> Self {
        Backoff {
            min: Duration::from_millis(cfg.min_ms),
            max: Duration::from_millis(cfg.max_ms),
            increment: Duration::from_millis(cfg.increment_ms),
        }
    }
}

impl Backoff {
    fn next(&self, current: Duration) -> Duration {
        (current + self.increment).min(self.max)
    }
}

/// Produces the underlying object every time the resource is (re)acquired.
#[async_trait]
pub trait ResourceFactory: Send + Sync + 'static {
    type Item: Lifecycle + ?Sized + 'static;

    async fn acquire(&self) -> Result<Arc<Self::Item>, AmqpError>;
}

type Job<T> = Box<dyn FnOnce(Result<Arc<T>, AmqpError>) -> BoxFuture<'static, ()> + Send>;

struct Slot<T: ?Sized> {
    state: LifecycleState,
    item: Option<Arc<T>>,
    wait: Duration,
    last_error: Option<AmqpError>,
    pending: VecDeque<Job<T>>,
    draining: bool,
    /// Successful acquisitions so far.
    generation: u64,
    /// Identifies the in-flight attempt or armed retry; bumped to invalidate them.
    attempt: u64,
    retry: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl<T: ?Sized> Slot<T> {
    fn cancel_retry(&mut self) {
        if let Some(timer) = self.retry.take() {
            timer.abort();
        }
    }

    fn stop_watcher(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

struct Shared<F: ResourceFactory> {
    name: String,
    factory: F,
    backoff: Backoff,
    slot: Mutex<Slot<F::Item>>,
    state: watch::Sender<LifecycleState>,
    events: broadcast::Sender<ResourceEvent>,
}

enum Scheduled<T: ?Sized, Op, R> {
    Now(Arc<T>, Op),
    Queued(oneshot::Receiver<Result<R, AmqpError>>),
}

enum Release<T: ?Sized> {
    Done,
    Wait,
    Close(Arc<T>),
}

/// A resilient handle around one acquired object. Clones share the same state.
pub struct Resource<F: ResourceFactory> {
    inner: Arc<Shared<F>>,
}

impl<F: ResourceFactory> Clone for Resource<F> {
    fn clone(&self) -> Self {
        Resource {
            inner: self.inner.clone(),
        }
    }
}

impl<F: ResourceFactory> Resource<F> {
    pub fn new(name: &str, factory: F, backoff: Backoff) -> Resource<F> {
        let (state, _) = watch::channel(LifecycleState::Idle);
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);

        Resource {
            inner: Arc::new(Shared {
                name: name.to_owned(),
                factory,
                backoff,
                slot: Mutex::new(Slot {
                    state: LifecycleState::Idle,
                    item: None,
                    wait: backoff.min,
                    last_error: None,
                    pending: VecDeque::new(),
                    draining: false,
                    generation: 0,
                    attempt: 0,
                    retry: None,
                    watcher: None,
                }),
                state,
                events,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.slot.lock().state
    }

    /// Number of successful acquisitions.
    pub fn generation(&self) -> u64 {
        self.inner.slot.lock().generation
    }

    /// Wait applied before the next retry.
    pub fn wait_interval(&self) -> Duration {
        self.inner.slot.lock().wait
    }

    pub fn last_error(&self) -> Option<AmqpError> {
        self.inner.slot.lock().last_error.clone()
    }

    /// The acquired object, if any.
    pub fn item(&self) -> Option<Arc<F::Item>> {
        self.inner.slot.lock().item.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.inner.events.subscribe()
    }

    /// Starts an acquisition unless one is running, the resource is held,
    /// or a retry is already armed.
    pub fn request(&self) {
        let mut slot = self.inner.slot.lock();
        match slot.state {
            LifecycleState::Acquiring
            | LifecycleState::Acquired
            | LifecycleState::Blocked
            | LifecycleState::Releasing
            | LifecycleState::Destroyed => {}
            LifecycleState::Failed if slot.retry.is_some() => {}
            LifecycleState::Idle
            | LifecycleState::Failed
            | LifecycleState::Closed
            | LifecycleState::Released => self.begin(&mut slot),
        }
    }

    /// Resolves with the object once acquired; fails if the resource is
    /// released before the acquisition completes.
    pub async fn acquire(&self) -> Result<Arc<F::Item>, AmqpError> {
        let mut state = self.inner.state.subscribe();
        self.request();

        loop {
            let current = *state.borrow_and_update();
            match current {
                LifecycleState::Acquired | LifecycleState::Blocked => {
                    if let Some(item) = self.item() {
                        return Ok(item);
                    }
                }
                LifecycleState::Released | LifecycleState::Destroyed => {
                    return Err(self.released_error("acquire"));
                }
                _ => {}
            }

            state
                .changed()
                .await
                .map_err(|_| AmqpError::InternalError)?;
        }
    }

    /// Invokes `op` on the acquired object, queuing it until acquisition when
    /// needed. Queued operations run in submission order.
    pub async fn operate<R, Fut, Op>(&self, operation: &str, op: Op) -> Result<R, AmqpError>
    where
        R: Send + 'static,
        Fut: Future<Output = Result<R, AmqpError>> + Send + 'static,
        Op: FnOnce(Arc<F::Item>) -> Fut + Send + 'static,
    {
        match self.schedule(operation, op, false)? {
            Scheduled::Now(item, op) => op(item).await,
            Scheduled::Queued(rx) => rx
                .await
                .map_err(|_| self.released_error(operation))?,
        }
    }

    /// Queues `op` behind every operation submitted before it and returns the
    /// receiver of its result without waiting.
    pub fn submit<R, Fut, Op>(
        &self,
        operation: &str,
        op: Op,
    ) -> Result<oneshot::Receiver<Result<R, AmqpError>>, AmqpError>
    where
        R: Send + 'static,
        Fut: Future<Output = Result<R, AmqpError>> + Send + 'static,
        Op: FnOnce(Arc<F::Item>) -> Fut + Send + 'static,
    {
        match self.schedule(operation, op, true)? {
            Scheduled::Queued(rx) => Ok(rx),
            Scheduled::Now(..) => Err(AmqpError::InternalError),
        }
    }

    /// Releases the resource, closing the object when one is held.
    /// Calling it again has no further effect.
    pub async fn release(&self) -> Result<(), AmqpError> {
        let mut state = self.inner.state.subscribe();

        match self.begin_release() {
            Release::Done => return Ok(()),
            Release::Close(item) => {
                if let Err(err) = item.close().await {
                    warn!(
                        resource = self.inner.name,
                        error = err.to_string(),
                        "failure to close while releasing"
                    );
                }
                self.finish_release();
                return Ok(());
            }
            Release::Wait => {}
        }

        loop {
            let current = *state.borrow_and_update();
            if matches!(
                current,
                LifecycleState::Released | LifecycleState::Destroyed
            ) {
                return Ok(());
            }

            state
                .changed()
                .await
                .map_err(|_| AmqpError::InternalError)?;
        }
    }

    /// Releases the resource and makes the state terminal.
    pub async fn destroy(&self) -> Result<(), AmqpError> {
        self.release().await?;

        let mut slot = self.inner.slot.lock();
        if slot.state != LifecycleState::Destroyed {
            self.transition(&mut slot, LifecycleState::Destroyed);
            self.emit(ResourceEvent::Destroyed);
        }
        Ok(())
    }

    /// Treats the held object as broken and re-acquires it.
    pub fn invalidate(&self, reason: &str) {
        let mut slot = self.inner.slot.lock();
        if !matches!(
            slot.state,
            LifecycleState::Acquired | LifecycleState::Blocked
        ) {
            return;
        }

        if let Some(stale) = slot.item.clone() {
            tokio::spawn(async move {
                let _ = stale.close().await;
            });
        }
        self.fail(&mut slot, AmqpError::TransportError(reason.to_owned()));
    }

    fn released_error(&self, operation: &str) -> AmqpError {
        AmqpError::ReleasedResource {
            resource: self.inner.name.clone(),
            operation: operation.to_owned(),
        }
    }

    fn transition(&self, slot: &mut Slot<F::Item>, state: LifecycleState) {
        slot.state = state;
        self.inner.state.send_replace(state);
    }

    fn emit(&self, event: ResourceEvent) {
        let _ = self.inner.events.send(event);
    }

    fn begin(&self, slot: &mut Slot<F::Item>) {
        slot.cancel_retry();
        slot.attempt += 1;
        let attempt = slot.attempt;

        debug!(resource = self.inner.name, attempt, "acquiring");
        self.transition(slot, LifecycleState::Acquiring);
        self.emit(ResourceEvent::Acquiring);

        let this = self.clone();
        tokio::spawn(async move {
            let result = this.inner.factory.acquire().await;
            this.complete(attempt, result);
        });
    }

    fn complete(&self, attempt: u64, result: Result<Arc<F::Item>, AmqpError>) {
        let mut slot = self.inner.slot.lock();

        if attempt != slot.attempt || slot.state != LifecycleState::Acquiring {
            if let Ok(item) = result {
                debug!(
                    resource = self.inner.name,
                    "discarding object acquired after release"
                );
                tokio::spawn(async move {
                    let _ = item.close().await;
                });
            }
            return;
        }

        match result {
            Ok(item) => {
                slot.generation += 1;
                slot.wait = self.inner.backoff.min;
                slot.last_error = None;
                slot.watcher = Some(self.watch(item.events(), slot.generation));
                slot.item = Some(item);

                info!(
                    resource = self.inner.name,
                    generation = slot.generation,
                    "acquired"
                );
                self.transition(&mut slot, LifecycleState::Acquired);
                self.emit(ResourceEvent::Acquired);
                self.drain(&mut slot);
            }
            Err(err) => self.fail(&mut slot, err),
        }
    }

    fn fail(&self, slot: &mut Slot<F::Item>, err: AmqpError) {
        slot.stop_watcher();
        slot.item = None;
        slot.last_error = Some(err.clone());

        let delay = slot.wait;
        slot.wait = self.inner.backoff.next(slot.wait);
        slot.attempt += 1;
        let attempt = slot.attempt;

        warn!(
            resource = self.inner.name,
            error = err.to_string(),
            retry_in_ms = delay.as_millis() as u64,
            "resource failed"
        );
        self.transition(slot, LifecycleState::Failed);
        self.emit(ResourceEvent::Failed(err));

        let this = self.clone();
        slot.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.retry(attempt);
        }));
    }

    fn retry(&self, attempt: u64) {
        let mut slot = self.inner.slot.lock();
        if slot.attempt != attempt || slot.state != LifecycleState::Failed {
            return;
        }
        slot.retry = None;
        self.begin(&mut slot);
    }

    fn watch(
        &self,
        mut events: broadcast::Receiver<TransportEvent>,
        generation: u64,
    ) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => this.on_event(generation, event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(resource = this.inner.name, skipped, "missed resource events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn on_event(&self, generation: u64, event: TransportEvent) {
        let mut slot = self.inner.slot.lock();
        if slot.generation != generation {
            return;
        }

        match (slot.state, event) {
            (
                LifecycleState::Acquired | LifecycleState::Blocked,
                TransportEvent::Error(reason),
            ) => {
                self.fail(&mut slot, AmqpError::TransportError(reason));
            }
            (
                LifecycleState::Acquired | LifecycleState::Blocked,
                TransportEvent::Close(reason),
            ) => {
                slot.stop_watcher();
                slot.item = None;
                info!(resource = self.inner.name, reason, "closed by the remote peer");
                self.transition(&mut slot, LifecycleState::Closed);
                self.emit(ResourceEvent::Closed(reason));
            }
            (LifecycleState::Acquired, TransportEvent::Blocked(reason)) => {
                self.transition(&mut slot, LifecycleState::Blocked);
                self.emit(ResourceEvent::Blocked(reason));
            }
            (LifecycleState::Blocked, TransportEvent::Unblocked) => {
                self.transition(&mut slot, LifecycleState::Acquired);
                self.emit(ResourceEvent::Unblocked);
                self.drain(&mut slot);
            }
            (state, event) => {
                debug!(resource = self.inner.name, ?state, ?event, "ignoring event");
            }
        }
    }

    fn schedule<R, Fut, Op>(
        &self,
        operation: &str,
        op: Op,
        force_queue: bool,
    ) -> Result<Scheduled<F::Item, Op, R>, AmqpError>
    where
        R: Send + 'static,
        Fut: Future<Output = Result<R, AmqpError>> + Send + 'static,
        Op: FnOnce(Arc<F::Item>) -> Fut + Send + 'static,
    {
        let mut slot = self.inner.slot.lock();

        if matches!(
            slot.state,
            LifecycleState::Releasing | LifecycleState::Released | LifecycleState::Destroyed
        ) {
            return Err(self.released_error(operation));
        }

        if !force_queue
            && slot.state == LifecycleState::Acquired
            && !slot.draining
            && slot.pending.is_empty()
        {
            if let Some(item) = slot.item.clone() {
                return Ok(Scheduled::Now(item, op));
            }
        }

        let (tx, rx) = oneshot::channel();
        let job: Job<F::Item> = Box::new(move |item: Result<Arc<F::Item>, AmqpError>| {
            async move {
                let result = match item {
                    Ok(item) => op(item).await,
                    Err(err) => Err(err),
                };
                let _ = tx.send(result);
            }
            .boxed()
        });
        slot.pending.push_back(job);

        if slot.state == LifecycleState::Acquired {
            self.drain(&mut slot);
        } else {
            debug!(
                resource = self.inner.name,
                operation,
                queued = slot.pending.len(),
                "deferring operation until acquired"
            );
        }

        Ok(Scheduled::Queued(rx))
    }

    fn drain(&self, slot: &mut Slot<F::Item>) {
        if slot.draining || slot.pending.is_empty() {
            return;
        }
        slot.draining = true;

        let this = self.clone();
        tokio::spawn(async move {
            while let Some((job, item)) = this.next_job() {
                job(Ok(item)).await;
            }
        });
    }

    fn next_job(&self) -> Option<(Job<F::Item>, Arc<F::Item>)> {
        let mut slot = self.inner.slot.lock();

        if slot.state == LifecycleState::Acquired {
            if let Some(item) = slot.item.clone() {
                if let Some(job) = slot.pending.pop_front() {
                    return Some((job, item));
                }
            }
        }

        slot.draining = false;
        None
    }

    fn begin_release(&self) -> Release<F::Item> {
        let mut slot = self.inner.slot.lock();

        match slot.state {
            LifecycleState::Released | LifecycleState::Destroyed => Release::Done,
            LifecycleState::Releasing => Release::Wait,
            LifecycleState::Acquired | LifecycleState::Blocked => {
                slot.cancel_retry();
                slot.stop_watcher();
                slot.attempt += 1;
                match slot.item.take() {
                    Some(item) => {
                        self.transition(&mut slot, LifecycleState::Releasing);
                        Release::Close(item)
                    }
                    None => {
                        self.mark_released(&mut slot);
                        Release::Done
                    }
                }
            }
            LifecycleState::Idle
            | LifecycleState::Acquiring
            | LifecycleState::Failed
            | LifecycleState::Closed => {
                slot.cancel_retry();
                slot.attempt += 1;
                self.mark_released(&mut slot);
                Release::Done
            }
        }
    }

    fn finish_release(&self) {
        let mut slot = self.inner.slot.lock();
        if slot.state == LifecycleState::Releasing {
            self.mark_released(&mut slot);
        }
    }

    fn mark_released(&self, slot: &mut Slot<F::Item>) {
        slot.item = None;
        slot.wait = self.inner.backoff.min;

        let abandoned: Vec<_> = slot.pending.drain(..).collect();
        for job in abandoned {
            tokio::spawn(job(Err(self.released_error("queued operation"))));
        }

        info!(resource = self.inner.name, "released");
        self.transition(slot, LifecycleState::Released);
        self.emit(ResourceEvent::Released);
    }
}
