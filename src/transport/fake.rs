// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! In-memory transport recording every broker call, for tests.

use super::{
    AmqpChannel, AmqpConnection, ConfirmFuture, ConsumeOptions, Delivery, DeliveryStream,
    Lifecycle, PublishConfirm, QueueInfo, Transport, TransportEvent,
};
use crate::errors::AmqpError;
use async_trait::async_trait;
use futures_util::FutureExt;
use lapin::{
    options::{ExchangeDeclareOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, ExchangeKind,
};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{broadcast, mpsc, oneshot};

#[derive(Default)]
struct FakeState {
    calls: Mutex<Vec<String>>,
    connect_failures: AtomicUsize,
    connects: AtomicUsize,
    connections: Mutex<Vec<Arc<FakeConnection>>>,
    channels: Mutex<Vec<Arc<FakeChannel>>>,
    consumers: Mutex<HashMap<String, mpsc::UnboundedSender<Delivery>>>,
    reject_declares: Mutex<HashSet<String>>,
    hold_confirms: AtomicBool,
    held: Mutex<Vec<oneshot::Sender<PublishConfirm>>>,
    next_channel: AtomicUsize,
}

impl FakeState {
    fn record(&self, call: String) {
        self.calls.lock().push(call);
    }
}

#[derive(Clone, Default)]
pub(crate) struct FakeTransport {
    state: Arc<FakeState>,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<FakeTransport> {
        Arc::new(FakeTransport::default())
    }

    /// The next `failures` connection attempts fail.
    pub(crate) fn fail_connects(&self, failures: usize) {
        self.state.connect_failures.store(failures, Ordering::SeqCst);
    }

    pub(crate) fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.calls.lock().clone()
    }

    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub(crate) fn position(&self, call: &str) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    pub(crate) fn clear_calls(&self) {
        self.state.calls.lock().clear();
    }

    pub(crate) fn reject_declare(&self, name: &str) {
        self.state.reject_declares.lock().insert(name.to_owned());
    }

    pub(crate) fn accept_declare(&self, name: &str) {
        self.state.reject_declares.lock().remove(name);
    }

    pub(crate) fn hold_confirms(&self, hold: bool) {
        self.state.hold_confirms.store(hold, Ordering::SeqCst);
    }

    /// Confirms every held publish with `confirm`, returns how many were held.
    pub(crate) fn release_confirms(&self, confirm: PublishConfirm) -> usize {
        let held: Vec<_> = self.state.held.lock().drain(..).collect();
        let count = held.len();
        for tx in held {
            let _ = tx.send(confirm);
        }
        count
    }

    pub(crate) fn connection(&self, index: usize) -> Option<Arc<FakeConnection>> {
        self.state.connections.lock().get(index).cloned()
    }

    pub(crate) fn last_connection(&self) -> Option<Arc<FakeConnection>> {
        self.state.connections.lock().last().cloned()
    }

    pub(crate) fn channels(&self) -> Vec<Arc<FakeChannel>> {
        self.state.channels.lock().clone()
    }

    /// Pushes a delivery to the active consumer of `queue`.
    pub(crate) fn deliver(&self, queue: &str, delivery: Delivery) -> bool {
        match self.state.consumers.lock().get(queue) {
            Some(tx) => tx.send(delivery).is_ok(),
            None => false,
        }
    }

    pub(crate) fn has_consumer(&self, queue: &str) -> bool {
        self.state
            .consumers
            .lock()
            .get(queue)
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, uri: &str, _name: &str) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        let failures = self.state.connect_failures.load(Ordering::SeqCst);
        if failures > 0 {
            self.state
                .connect_failures
                .store(failures - 1, Ordering::SeqCst);
            self.state.record(format!("connect_failed:{uri}"));
            return Err(AmqpError::ConnectionError(
                uri.to_owned(),
                "connection refused".to_owned(),
            ));
        }

        self.state.record(format!("connect:{uri}"));
        let (events, _) = broadcast::channel(16);
        let conn = Arc::new(FakeConnection {
            state: self.state.clone(),
            events,
        });
        self.state.connections.lock().push(conn.clone());
        Ok(conn)
    }
}

pub(crate) struct FakeConnection {
    state: Arc<FakeState>,
    events: broadcast::Sender<TransportEvent>,
}

impl FakeConnection {
    pub(crate) fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Lifecycle for FakeConnection {
    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.state.record("close_connection".to_owned());
        Ok(())
    }
}

#[async_trait]
impl AmqpConnection for FakeConnection {
    async fn create_channel(&self, confirm: bool) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let id = self.state.next_channel.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.record(format!("create_channel:{confirm}"));
        let (events, _) = broadcast::channel(16);
        let channel = Arc::new(FakeChannel {
            id,
            confirm,
            state: self.state.clone(),
            events,
        });
        self.state.channels.lock().push(channel.clone());
        Ok(channel)
    }
}

pub(crate) struct FakeChannel {
    pub(crate) id: usize,
    confirm: bool,
    state: Arc<FakeState>,
    events: broadcast::Sender<TransportEvent>,
}

impl FakeChannel {
    pub(crate) fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Lifecycle for FakeChannel {
    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.state.record(format!("close_channel:{}", self.id));
        Ok(())
    }
}

#[async_trait]
impl AmqpChannel for FakeChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        _kind: ExchangeKind,
        _options: ExchangeDeclareOptions,
        _args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.state.record(format!("declare_exchange:{name}"));
        if self.state.reject_declares.lock().contains(name) {
            return Err(AmqpError::BrokerRejected("PRECONDITION_FAILED".to_owned()));
        }
        Ok(())
    }

    async fn declare_queue(
        &self,
        name: &str,
        _options: QueueDeclareOptions,
        _args: FieldTable,
    ) -> Result<QueueInfo, AmqpError> {
        self.state.record(format!("declare_queue:{name}"));
        if self.state.reject_declares.lock().contains(name) {
            return Err(AmqpError::BrokerRejected("PRECONDITION_FAILED".to_owned()));
        }
        Ok(QueueInfo {
            name: name.to_owned(),
            ..Default::default()
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        key: &str,
        _args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.state
            .record(format!("bind_queue:{exchange}->{queue}:{key}"));
        Ok(())
    }

    async fn bind_exchange(
        &self,
        target: &str,
        source: &str,
        key: &str,
        _args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.state
            .record(format!("bind_exchange:{source}->{target}:{key}"));
        Ok(())
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.state.record(format!("delete_exchange:{name}"));
        Ok(())
    }

    async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError> {
        self.state.record(format!("delete_queue:{name}"));
        Ok(0)
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.state.record(format!("qos:{prefetch}"));
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        _properties: BasicProperties,
        _mandatory: bool,
    ) -> Result<ConfirmFuture, AmqpError> {
        self.state.record(format!(
            "publish:{exchange}:{routing_key}:{}",
            String::from_utf8_lossy(payload)
        ));

        if !self.confirm {
            return Ok(async { Ok(PublishConfirm::NotRequested) }.boxed());
        }

        if self.state.hold_confirms.load(Ordering::SeqCst) {
            let (tx, rx) = oneshot::channel();
            self.state.held.lock().push(tx);
            return Ok(async move {
                rx.await
                    .map_err(|_| AmqpError::TransportError("channel closed".to_owned()))
            }
            .boxed());
        }

        Ok(async { Ok(PublishConfirm::Ack) }.boxed())
    }

    async fn consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
        _options: ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        self.state.record(format!("consume:{queue}"));
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.consumers.lock().insert(queue.to_owned(), tx);
        Ok(rx)
    }

    async fn cancel(&self, _consumer_tag: &str) -> Result<(), AmqpError> {
        self.state.record("cancel".to_owned());
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.state.record(format!("ack:{delivery_tag}:{multiple}"));
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        self.state
            .record(format!("nack:{delivery_tag}:{multiple}:{requeue}"));
        Ok(())
    }
}

/// Polls `condition` until it holds or two seconds elapse.
pub(crate) async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// A delivery with the given tag and body.
pub(crate) fn delivery(tag: u64, body: &str) -> Delivery {
    Delivery {
        delivery_tag: tag,
        data: body.as_bytes().to_vec(),
        ..Default::default()
    }
}
