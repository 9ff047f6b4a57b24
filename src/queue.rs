// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management for RabbitMQ
//!
//! [`QueueDefinition`] describes a queue, including its Dead Letter Queue
//! (DLQ) and retry queue. [`QueueController`] keeps the queue declared on its
//! own channel, consumes it and resolves acknowledgments through an
//! [`AckBatch`] driven by a periodic signal.

use crate::{
    ack::{AckBatch, AckResolver, Disposition},
    connection::{ChannelResource, ConnectionController, ConnectionEvent, Dependent},
    errors::AmqpError,
    message::Message,
    primitive::{PrimitiveEvent, PrimitiveState, PrimitiveStatus},
    resource::{LifecycleState, ResourceEvent},
    transport::{AmqpChannel, ConsumeOptions, Delivery, DeliveryStream, QueueInfo},
};
use async_trait::async_trait;
use lapin::{
    options::QueueDeclareOptions,
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Constant for the header field used to specify a dead letter exchange
pub const AMQP_HEADERS_DEAD_LETTER_EXCHANGE: &str = "x-dead-letter-exchange";
/// Constant for the header field used to specify a dead letter routing key
pub const AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY: &str = "x-dead-letter-routing-key";
/// Constant for the header field used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the header field used to specify maximum queue length
pub const AMQP_HEADERS_MAX_LENGTH: &str = "x-max-length";
/// Constant for the header field used to specify maximum queue size in bytes
pub const AMQP_HEADERS_MAX_LENGTH_BYTES: &str = "x-max-length-bytes";

/// Definition of a RabbitMQ queue with its configuration parameters.
///
/// This struct implements the builder pattern to create and configure queue definitions.
/// It supports standard queue options as well as advanced features like message TTL,
/// max length, Dead Letter Queues (DLQ), and retry mechanisms.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: String,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) passive: bool,
    pub(crate) no_wait: bool,
    pub(crate) ttl: Option<i32>,
    pub(crate) max_length: Option<i32>,
    pub(crate) max_length_bytes: Option<i32>,
    pub(crate) dlq_name: Option<String>,
    pub(crate) retry_name: Option<String>,
    pub(crate) retry_ttl: Option<i32>,
    pub(crate) retries: Option<i32>,
    pub(crate) prefetch: Option<u16>,
    pub(crate) no_ack: bool,
    pub(crate) exclusive_consumer: bool,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    ///
    /// By default, the queue is created with standard settings (non-durable, non-exclusive, etc.)
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: name.to_owned(),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dlq_name(&self) -> Option<&str> {
        self.dlq_name.as_deref()
    }

    pub fn retry_name(&self) -> Option<&str> {
        self.retry_name.as_deref()
    }

    pub fn retries(&self) -> Option<i32> {
        self.retries
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    ///
    /// Exclusive queues are deleted when the connection closes.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Only checks that the queue exists.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: i32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the maximum number of messages the queue can hold.
    pub fn max_length(mut self, max: i32) -> Self {
        self.max_length = Some(max);
        self
    }

    /// Sets the maximum size in bytes the queue can hold.
    pub fn max_length_bytes(mut self, max_bytes: i32) -> Self {
        self.max_length_bytes = Some(max_bytes);
        self
    }

    /// Adds a Dead Letter Queue (DLQ) named after the queue with a "-dlq" suffix.
    ///
    /// The DLQ receives messages that are rejected, expired, or overflow
    /// from the main queue.
    pub fn with_dlq(mut self) -> Self {
        self.dlq_name = Some(format!("{}-dlq", self.name));
        self
    }

    /// Adds a retry queue named after the queue with a "-retry" suffix.
    ///
    /// Rejected messages wait `ttl` milliseconds in the retry queue before
    /// being dead-lettered back to the main queue, at most `retries` times.
    pub fn with_retry(mut self, ttl: i32, retries: i32) -> Self {
        self.retry_name = Some(format!("{}-retry", self.name));
        self.retries = Some(retries);
        self.retry_ttl = Some(ttl);
        self
    }

    /// Limits unacknowledged deliveries on the consumer channel.
    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = Some(count);
        self
    }

    /// Consumes without acknowledgments.
    pub fn no_ack(mut self) -> Self {
        self.no_ack = true;
        self
    }

    /// Requests exclusive consumption.
    pub fn exclusive_consumer(mut self) -> Self {
        self.exclusive_consumer = true;
        self
    }

    pub(crate) fn options(&self) -> QueueDeclareOptions {
        QueueDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.delete,
            nowait: self.no_wait,
        }
    }

    /// Arguments of the main queue. Rejected messages go to the retry queue
    /// when there is one, otherwise to the DLQ.
    pub(crate) fn arguments(&self) -> FieldTable {
        let mut args = BTreeMap::new();

        if let Some(target) = self.retry_name.as_ref().or(self.dlq_name.as_ref()) {
            dead_letter_to(&mut args, target);
        }

        for (key, value) in [
            (AMQP_HEADERS_MESSAGE_TTL, self.ttl),
            (AMQP_HEADERS_MAX_LENGTH, self.max_length),
            (AMQP_HEADERS_MAX_LENGTH_BYTES, self.max_length_bytes),
        ] {
            if let Some(value) = value {
                args.insert(
                    ShortString::from(key),
                    AMQPValue::LongInt(LongInt::from(value)),
                );
            }
        }

        FieldTable::from(args)
    }

    /// Arguments of the retry queue, which dead-letters back to the main queue.
    pub(crate) fn retry_arguments(&self) -> Option<(String, FieldTable)> {
        let (Some(name), Some(ttl)) = (&self.retry_name, self.retry_ttl) else {
            return None;
        };

        let mut args = BTreeMap::new();
        dead_letter_to(&mut args, &self.name);
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl)),
        );

        Some((name.clone(), FieldTable::from(args)))
    }
}

fn dead_letter_to(args: &mut BTreeMap<ShortString, AMQPValue>, queue: &str) {
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
        AMQPValue::LongString(LongString::from("")),
    );
    args.insert(
        ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
        AMQPValue::LongString(LongString::from(queue)),
    );
}

/// Declares the retry queue and the DLQ before the queue routing to them.
async fn declare_all(
    ch: Arc<dyn AmqpChannel>,
    def: QueueDefinition,
) -> Result<QueueInfo, AmqpError> {
    if let Some((retry_name, args)) = def.retry_arguments() {
        debug!(name = retry_name, "declaring retry queue");
        ch.declare_queue(&retry_name, def.options(), args).await?;
    }

    if let Some(dlq_name) = &def.dlq_name {
        debug!(name = dlq_name, "declaring dlq");
        ch.declare_queue(dlq_name, def.options(), FieldTable::default())
            .await?;
    }

    ch.declare_queue(&def.name, def.options(), def.arguments())
        .await
}

/// Application callback invoked for every delivery.
///
/// A message still pending when the handler returns an error is nacked.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), AmqpError>;
}

/// Resolves batch ranges on the channel the deliveries arrived on.
struct ChannelResolver {
    channel: ChannelResource,
    consuming_on: Arc<AtomicU64>,
}

#[async_trait]
impl AckResolver for ChannelResolver {
    async fn resolve(
        &self,
        disposition: Disposition,
        tag: u64,
        inclusive: bool,
    ) -> Result<(), AmqpError> {
        let item = match self.channel.item() {
            Some(item)
                if self.channel.state() == LifecycleState::Acquired
                    && self.channel.generation() == self.consuming_on.load(Ordering::SeqCst) =>
            {
                item
            }
            _ => {
                return Err(AmqpError::TransportError(
                    "delivery channel is not available".to_owned(),
                ))
            }
        };

        match disposition {
            Disposition::Ack => item.ack(tag, inclusive).await,
            Disposition::Nack => item.nack(tag, inclusive, true).await,
            Disposition::Reject => item.nack(tag, inclusive, false).await,
            Disposition::Pending => Ok(()),
        }
    }
}

struct Consumer {
    tag: String,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct QueueInner {
    def: QueueDefinition,
    connection: ConnectionController,
    channel: ChannelResource,
    status: PrimitiveStatus,
    batch: AckBatch,
    ack_interval: Duration,
    consuming_on: Arc<AtomicU64>,
    rebuild: tokio::sync::Mutex<()>,
    declared_on: AtomicU64,
    info: Mutex<QueueInfo>,
    handler: Mutex<Option<Arc<dyn MessageHandler>>>,
    consumer: Mutex<Option<Consumer>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl QueueInner {
    /// Declares the queue and, when a handler is set, consumes it again.
    /// Re-acquires the channel on transient failures.
    async fn establish(self: &Arc<Self>) -> Result<(), AmqpError> {
        let _rebuild = self.rebuild.lock().await;

        loop {
            if self.status.stopped() {
                return Err(self
                    .status
                    .failure()
                    .unwrap_or_else(|| AmqpError::Destroyed(self.def.name.clone())));
            }

            if self.channel.state() == LifecycleState::Acquired
                && self.connection.is_stale(&self.channel)
            {
                self.channel.invalidate("connection replaced");
            }

            match self.declare_and_consume().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_transient() => {
                    warn!(
                        name = self.def.name,
                        error = err.to_string(),
                        "transient failure declaring queue"
                    );
                    self.channel.invalidate(&err.to_string());
                }
                Err(err @ (AmqpError::ReleasedResource { .. } | AmqpError::Destroyed(_))) => {
                    return Err(err)
                }
                Err(err) => {
                    return Err(AmqpError::DeclareQueueError {
                        name: self.def.name.clone(),
                        connection: self.connection.name().to_owned(),
                        reason: err.to_string(),
                    })
                }
            }
        }
    }

    async fn declare_and_consume(self: &Arc<Self>) -> Result<(), AmqpError> {
        self.channel.request();
        debug!(name = self.def.name, "declaring queue");

        let def = self.def.clone();
        let info = self
            .channel
            .operate("declare queue", move |ch| declare_all(ch, def))
            .await?;

        self.declared_on
            .store(self.channel.factory().created_on(), Ordering::SeqCst);
        debug!(
            name = self.def.name,
            messages = info.message_count,
            "queue declared"
        );
        *self.info.lock() = info;

        self.status
            .transition(PrimitiveState::Reconnecting, PrimitiveState::Reconnected);

        let live = self.consumer.lock().is_some()
            && self.consuming_on.load(Ordering::SeqCst) == self.channel.generation();
        if live {
            return Ok(());
        }

        self.stop_consumer(false);
        self.batch.reset();
        self.start_consumer().await
    }

    async fn start_consumer(self: &Arc<Self>) -> Result<(), AmqpError> {
        let Some(handler) = self.handler.lock().clone() else {
            return Ok(());
        };

        let tag = format!("{}.{}", self.def.name, Uuid::new_v4());
        let queue = self.def.name.clone();
        let consumer_tag = tag.clone();
        let prefetch = self.def.prefetch;
        let options = ConsumeOptions {
            no_ack: self.def.no_ack,
            exclusive: self.def.exclusive_consumer,
        };

        let stream = self
            .channel
            .operate("consume", move |ch| async move {
                if let Some(count) = prefetch {
                    ch.qos(count)
                        .await
                        .map_err(|err| AmqpError::QoSDeclarationError(err.to_string()))?;
                }
                ch.consume(&queue, &consumer_tag, options).await
            })
            .await?;

        self.consuming_on
            .store(self.channel.generation(), Ordering::SeqCst);
        self.ensure_ticker();

        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(run_consumer(
            Arc::downgrade(self),
            self.def.name.clone(),
            handler,
            stream,
            stopped,
        ));
        info!(name = self.def.name, tag, "consuming queue");
        *self.consumer.lock() = Some(Consumer { tag, stop, task });
        Ok(())
    }

    /// Stops dispatching deliveries. With `graceful` the in-flight delivery
    /// completes, otherwise it is aborted.
    fn stop_consumer(&self, graceful: bool) -> Option<String> {
        let consumer = self.consumer.lock().take()?;
        let _ = consumer.stop.send(());
        if !graceful {
            consumer.task.abort();
        }
        Some(consumer.tag)
    }

    fn ensure_ticker(&self) {
        let mut ticker = self.ticker.lock();
        if ticker.is_none() {
            *ticker = Some(self.batch.listen(self.ack_interval));
        }
    }

    async fn deliver(&self, delivery: Delivery, handler: &Arc<dyn MessageHandler>) {
        let handle = if self.def.no_ack {
            None
        } else {
            Some(self.batch.add_message(delivery.delivery_tag))
        };
        let message = Message::new(&self.def.name, delivery, handle, self.channel.clone());

        if let Err(err) = handler.handle(&message).await {
            warn!(
                name = self.def.name,
                tag = message.delivery_tag(),
                error = err.to_string(),
                "handler failure"
            );
            if message.nack() {
                debug!(tag = message.delivery_tag(), "unhandled message nacked");
            }
        }
    }

    async fn initialize(self: Arc<Self>) {
        match self.establish().await {
            Ok(()) => self.status.define(),
            Err(err) => self.fail(err),
        }
    }

    fn on_channel_event(self: &Arc<Self>, event: ResourceEvent) {
        match event {
            ResourceEvent::Closed(reason) if !self.status.stopped() => {
                warn!(name = self.def.name, reason, "queue channel closed by the broker");
                self.status.set(PrimitiveState::Initializing);
                tokio::spawn(self.clone().initialize());
            }
            ResourceEvent::Failed(_) => {
                if self
                    .status
                    .transition(PrimitiveState::Ready, PrimitiveState::Reconnecting)
                {
                    tokio::spawn(self.clone().initialize());
                }
            }
            _ => {}
        }
    }

    fn fail(&self, err: AmqpError) {
        if self.status.get() == PrimitiveState::Destroyed {
            return;
        }
        error!(name = self.def.name, error = err.to_string(), "queue failed");
        self.status.fail(err);
    }

    async fn destroy(&self) -> Result<(), AmqpError> {
        if self.status.get() == PrimitiveState::Destroyed {
            return Ok(());
        }
        let mut channel_events = self.channel.subscribe();
        let mut connection_events = self.connection.subscribe();
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }

        let connected = self.connection.is_connected()
            && self.channel.state() == LifecycleState::Acquired;

        if let Some(tag) = self.stop_consumer(connected) {
            if connected {
                let cancel = self
                    .channel
                    .operate("cancel", move |ch| async move { ch.cancel(&tag).await })
                    .await;
                if let Err(err) = cancel {
                    warn!(name = self.def.name, error = err.to_string(), "failure to cancel consumer");
                }
            }
        }

        if connected {
            debug!(name = self.def.name, pending = self.batch.len(), "draining acknowledgments");
            tokio::select! {
                _ = self.batch.wait_empty() => {}
                _ = channel_lost(&mut channel_events, &mut connection_events) => {
                    warn!(
                        name = self.def.name,
                        pending = self.batch.len(),
                        "channel lost while draining, dropping acknowledgments"
                    );
                    self.batch.reset();
                }
            }
        }

        if let Some(ticker) = self.ticker.lock().take() {
            ticker.abort();
        }
        let result = self.channel.release().await;
        self.status.destroy();

        info!(name = self.def.name, "queue destroyed");
        result
    }
}

/// Resolves once the channel can no longer settle deliveries.
async fn channel_lost(
    channel: &mut broadcast::Receiver<ResourceEvent>,
    connection: &mut broadcast::Receiver<ConnectionEvent>,
) {
    loop {
        tokio::select! {
            event = channel.recv() => match event {
                Ok(
                    ResourceEvent::Failed(_)
                    | ResourceEvent::Closed(_)
                    | ResourceEvent::Released
                    | ResourceEvent::Destroyed,
                )
                | Err(broadcast::error::RecvError::Closed) => return,
                _ => {}
            },
            event = connection.recv() => match event {
                Ok(ConnectionEvent::Lost(_) | ConnectionEvent::Failed(_) | ConnectionEvent::Closed)
                | Err(broadcast::error::RecvError::Closed) => return,
                _ => {}
            },
        }
    }
}

async fn run_consumer(
    queue: Weak<QueueInner>,
    name: String,
    handler: Arc<dyn MessageHandler>,
    mut stream: DeliveryStream,
    mut stopped: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut stopped => break,
            delivery = stream.recv() => {
                let Some(delivery) = delivery else { break };
                let Some(queue) = queue.upgrade() else {
                    warn!(
                        queue = name,
                        delivery_tag = delivery.delivery_tag,
                        "queue controller dropped, consumer stopped"
                    );
                    break;
                };
                queue.deliver(delivery, &handler).await;
            }
        }
    }
}

#[async_trait]
impl Dependent for QueueInner {
    fn name(&self) -> String {
        self.def.name.clone()
    }

    async fn release(&self) -> Result<(), AmqpError> {
        self.destroy().await
    }
}

/// Keeps one queue declared and consumed.
#[derive(Clone)]
pub struct QueueController {
    inner: Arc<QueueInner>,
}

impl QueueController {
    pub fn new(
        def: QueueDefinition,
        connection: &ConnectionController,
        ack_interval: Duration,
    ) -> QueueController {
        let channel = connection.create_channel(false);
        let consuming_on = Arc::new(AtomicU64::new(0));
        let batch = AckBatch::new(
            &def.name,
            Arc::new(ChannelResolver {
                channel: channel.clone(),
                consuming_on: consuming_on.clone(),
            }),
        );

        let inner = Arc::new(QueueInner {
            status: PrimitiveStatus::new(&def.name),
            def,
            connection: connection.clone(),
            channel,
            batch,
            ack_interval,
            consuming_on,
            rebuild: tokio::sync::Mutex::new(()),
            declared_on: AtomicU64::new(0),
            info: Mutex::new(QueueInfo::default()),
            handler: Mutex::new(None),
            consumer: Mutex::new(None),
            ticker: Mutex::new(None),
            watcher: Mutex::new(None),
        });

        let mut events = inner.channel.subscribe();
        let weak = Arc::downgrade(&inner);
        *inner.watcher.lock() = Some(tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => match weak.upgrade() {
                        Some(inner) => inner.on_channel_event(event),
                        None => break,
                    },
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let dependent: Arc<dyn Dependent> = inner.clone();
        connection.add_queue(Arc::downgrade(&dependent));
        tokio::spawn(inner.clone().initialize());

        QueueController { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.def.name
    }

    pub fn definition(&self) -> &QueueDefinition {
        &self.inner.def
    }

    pub fn state(&self) -> PrimitiveState {
        self.inner.status.get()
    }

    pub fn failure(&self) -> Option<AmqpError> {
        self.inner.status.failure()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PrimitiveEvent> {
        self.inner.status.subscribe()
    }

    /// Result of the last declaration.
    pub fn info(&self) -> QueueInfo {
        self.inner.info.lock().clone()
    }

    /// Connection generation the queue was last declared on.
    pub fn declared_on(&self) -> u64 {
        self.inner.declared_on.load(Ordering::SeqCst)
    }

    /// Deliveries awaiting resolution.
    pub fn unresolved(&self) -> usize {
        self.inner.batch.len()
    }

    pub fn is_consuming(&self) -> bool {
        self.inner.consumer.lock().is_some()
    }

    /// Resolves once declared, rejects with the declaration failure.
    pub async fn check(&self) -> Result<(), AmqpError> {
        self.inner.status.check().await
    }

    /// Starts consuming with `handler`. Consumption resumes on its own after
    /// every rebuild.
    pub async fn subscribe(&self, handler: Arc<dyn MessageHandler>) -> Result<(), AmqpError> {
        *self.inner.handler.lock() = Some(handler);
        self.inner.status.check().await?;

        let _rebuild = self.inner.rebuild.lock().await;
        if self.inner.consumer.lock().is_some() {
            return Ok(());
        }
        self.inner.start_consumer().await
    }

    /// Stops consuming; delivered messages keep being resolved.
    pub async fn unsubscribe(&self) -> Result<(), AmqpError> {
        let _rebuild = self.inner.rebuild.lock().await;
        self.inner.handler.lock().take();

        let Some(tag) = self.inner.stop_consumer(true) else {
            return Ok(());
        };
        self.inner
            .channel
            .operate("cancel", move |ch| async move { ch.cancel(&tag).await })
            .await
    }

    /// Cancels consumption, waits for pending acknowledgments unless the
    /// connection is lost, then releases the channel.
    pub async fn destroy(&self) -> Result<(), AmqpError> {
        self.inner.destroy().await
    }

    /// Re-declares and consumes again after the connection was replaced.
    pub(crate) async fn on_reconnected(&self) {
        if self.inner.status.stopped() {
            return;
        }
        self.inner.status.set(PrimitiveState::Reconnecting);

        match self.inner.establish().await {
            Ok(()) => self.inner.status.define(),
            Err(err) => self.inner.fail(err),
        }
    }
}
