// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Exchange Management for RabbitMQ
//!
//! [`ExchangeDefinition`] describes an exchange with a builder API.
//! [`ExchangeController`] keeps it declared on a dedicated confirm channel and
//! publishes through a [`PublishLog`], so every unconfirmed message is
//! published again once the topology is restored after a reconnection.

use crate::{
    connection::{ChannelResource, ConnectionController, Dependent},
    errors::AmqpError,
    message::Envelope,
    primitive::{PrimitiveEvent, PrimitiveState, PrimitiveStatus},
    publish_log::{PublishLog, Sequenced},
    resource::{LifecycleState, ResourceEvent},
    transport::{ConfirmFuture, PublishConfirm},
};
use async_trait::async_trait;
use lapin::{
    options::ExchangeDeclareOptions,
    types::{AMQPValue, FieldTable, LongString, ShortString},
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::{broadcast, oneshot},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

/// Constant for the header field used to specify the delayed exchange type
pub const AMQP_HEADERS_DELAYED_EXCHANGE_TYPE: &str = "x-delayed-type";
/// Constant for the argument naming the exchange receiving unroutable messages
pub const AMQP_HEADERS_ALTERNATE_EXCHANGE: &str = "alternate-exchange";

/// Represents the types of exchanges available in RabbitMQ.
///
/// - Direct: Routes messages to queues based on an exact match of routing keys
/// - Fanout: Broadcasts messages to all bound queues regardless of routing keys
/// - Topic: Routes messages based on wildcard pattern matching of routing keys
/// - Headers: Routes based on message header values instead of routing keys
/// - XMessageDelayed: Extension for delayed message delivery (plugin required)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
    XMessageDelayed,
}

impl From<&ExchangeKind> for lapin::ExchangeKind {
    fn from(kind: &ExchangeKind) -> lapin::ExchangeKind {
        match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Headers => lapin::ExchangeKind::Headers,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::XMessageDelayed => {
                lapin::ExchangeKind::Custom("x-delayed-message".to_owned())
            }
        }
    }
}

/// Definition of a RabbitMQ exchange with its configuration parameters.
///
/// Stored by the topology and reused verbatim on every re-declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub(crate) name: String,
    pub(crate) kind: ExchangeKind,
    pub(crate) delete: bool,
    pub(crate) durable: bool,
    pub(crate) passive: bool,
    pub(crate) internal: bool,
    pub(crate) no_wait: bool,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
    pub(crate) confirm: bool,
    pub(crate) publish_timeout: Option<Duration>,
}

impl ExchangeDefinition {
    /// Creates a new exchange definition with the given name.
    ///
    /// By default the exchange is a Direct exchange published to in confirm mode.
    pub fn new(name: &str) -> ExchangeDefinition {
        ExchangeDefinition {
            name: name.to_owned(),
            kind: ExchangeKind::Direct,
            delete: false,
            durable: false,
            passive: false,
            internal: false,
            no_wait: false,
            params: BTreeMap::default(),
            confirm: true,
            publish_timeout: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(mut self, kind: ExchangeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn direct(self) -> Self {
        self.kind(ExchangeKind::Direct)
    }

    pub fn fanout(self) -> Self {
        self.kind(ExchangeKind::Fanout)
    }

    pub fn topic(self) -> Self {
        self.kind(ExchangeKind::Topic)
    }

    pub fn headers(self) -> Self {
        self.kind(ExchangeKind::Headers)
    }

    /// Creates a delayed direct exchange.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn direct_delayed(self) -> Self {
        self.delayed("direct")
    }

    /// Creates a delayed fanout exchange.
    ///
    /// This requires the x-delayed-message plugin to be installed on the RabbitMQ server.
    pub fn fanout_delayed(self) -> Self {
        self.delayed("fanout")
    }

    fn delayed(mut self, routing: &str) -> Self {
        self.kind = ExchangeKind::XMessageDelayed;
        self.params.insert(
            ShortString::from(AMQP_HEADERS_DELAYED_EXCHANGE_TYPE),
            AMQPValue::LongString(LongString::from(routing)),
        );
        self
    }

    /// Routes messages this exchange cannot route to `exchange`.
    pub fn alternate(mut self, exchange: &str) -> Self {
        self.params.insert(
            ShortString::from(AMQP_HEADERS_ALTERNATE_EXCHANGE),
            AMQPValue::LongString(LongString::from(exchange)),
        );
        self
    }

    pub fn params(mut self, params: BTreeMap<ShortString, AMQPValue>) -> Self {
        self.params = params;
        self
    }

    pub fn param(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.params.insert(key, value);
        self
    }

    /// Sets the exchange to auto-delete when no longer used.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the exchange durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Makes the exchange passive, checking for existence without creating it.
    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    /// Makes the exchange internal, preventing direct publishing.
    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn no_wait(mut self) -> Self {
        self.no_wait = true;
        self
    }

    /// Publishes on a plain channel; messages count as delivered once written.
    pub fn without_confirm(mut self) -> Self {
        self.confirm = false;
        self
    }

    /// Rejects publishes not confirmed within `timeout`.
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = Some(timeout);
        self
    }

    pub(crate) fn options(&self) -> ExchangeDeclareOptions {
        ExchangeDeclareOptions {
            passive: self.passive,
            durable: self.durable,
            auto_delete: self.delete,
            internal: self.internal,
            nowait: self.no_wait,
        }
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }
}

/// A publish awaiting its broker confirmation.
#[derive(Debug, Clone, Default)]
struct Outbound {
    id: u64,
    envelope: Envelope,
    sequence: Option<u64>,
}

impl PartialEq for Outbound {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Sequenced for Outbound {
    fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    fn set_sequence(&mut self, sequence: Option<u64>) {
        self.sequence = sequence;
    }
}

type Waiter = oneshot::Sender<Result<(), AmqpError>>;

struct ExchangeInner {
    def: ExchangeDefinition,
    connection: ConnectionController,
    channel: ChannelResource,
    status: PrimitiveStatus,
    log: Mutex<PublishLog<Outbound>>,
    waiters: Mutex<HashMap<u64, Waiter>>,
    next_id: AtomicU64,
    rebuild: tokio::sync::Mutex<()>,
    declared_on: AtomicU64,
    /// Generation whose bindings are known to be in place.
    settled_on: AtomicU64,
    /// Set while rebuilding; writes of the current epoch wait for the replay.
    suspended: AtomicBool,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ExchangeInner {
    async fn declare(&self) -> Result<(), AmqpError> {
        self.channel.request();
        let def = self.def.clone();

        self.channel
            .operate("declare exchange", move |ch| async move {
                ch.declare_exchange(
                    &def.name,
                    lapin::ExchangeKind::from(&def.kind),
                    def.options(),
                    def.arguments(),
                )
                .await
            })
            .await
    }

    /// Declares the exchange, re-acquiring the channel on transient failures.
    async fn establish(&self) -> Result<(), AmqpError> {
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

            debug!(name = self.def.name, "declaring exchange");
            match self.declare().await {
                Ok(()) => {
                    self.declared_on
                        .store(self.channel.factory().created_on(), Ordering::SeqCst);
                    debug!(name = self.def.name, "exchange declared");
                    return Ok(());
                }
                Err(err) if err.is_transient() => {
                    warn!(
                        name = self.def.name,
                        error = err.to_string(),
                        "transient failure declaring exchange"
                    );
                    self.channel.invalidate(&err.to_string());
                }
                Err(err @ (AmqpError::ReleasedResource { .. } | AmqpError::Destroyed(_))) => {
                    return Err(err)
                }
                Err(err) => {
                    return Err(AmqpError::DeclareExchangeError {
                        name: self.def.name.clone(),
                        connection: self.connection.name().to_owned(),
                        reason: err.to_string(),
                    })
                }
            }
        }
    }

    async fn initialize(self: Arc<Self>) {
        match self.establish().await {
            Ok(()) => self.resume(),
            Err(err) => self.fail(err),
        }
    }

    /// Rebuild after the channel was lost. When the connection was replaced
    /// in the meantime the topology finishes the recovery once the bindings
    /// are back.
    async fn recover(self: Arc<Self>) {
        match self.establish().await {
            Ok(()) if self.bound() => self.resume(),
            Ok(()) => {
                debug!(
                    name = self.def.name,
                    "exchange redeclared on a new connection, waiting for bindings"
                );
                let waiting = self
                    .status
                    .transition(PrimitiveState::Reconnecting, PrimitiveState::Reconnected);
                // Bindings may have completed while transitioning.
                if waiting && self.bound() {
                    self.resume();
                }
            }
            Err(err) => self.fail(err),
        }
    }

    fn bound(&self) -> bool {
        self.declared_on.load(Ordering::SeqCst) == self.settled_on.load(Ordering::SeqCst)
    }

    fn on_channel_event(self: &Arc<Self>, event: ResourceEvent) {
        match event {
            ResourceEvent::Closed(reason) if !self.status.stopped() => {
                warn!(name = self.def.name, reason, "exchange channel closed by the broker");
                self.suspended.store(true, Ordering::SeqCst);
                if self.status.get() == PrimitiveState::Initializing {
                    tokio::spawn(self.clone().initialize());
                } else {
                    self.status.set(PrimitiveState::Reconnecting);
                    tokio::spawn(self.clone().recover());
                }
            }
            ResourceEvent::Failed(_) => {
                if self
                    .status
                    .transition(PrimitiveState::Ready, PrimitiveState::Reconnecting)
                {
                    self.suspended.store(true, Ordering::SeqCst);
                    tokio::spawn(self.clone().recover());
                }
            }
            _ => {}
        }
    }

    fn resume(self: &Arc<Self>) {
        self.settled_on
            .store(self.declared_on.load(Ordering::SeqCst), Ordering::SeqCst);
        self.replay();
        self.status.define();
    }

    fn fail(&self, err: AmqpError) {
        if self.status.get() == PrimitiveState::Destroyed {
            return;
        }
        error!(name = self.def.name, error = err.to_string(), "exchange failed");
        self.status.fail(err.clone());
        self.abandon(err);
    }

    /// Rejects every unconfirmed publish with `err`.
    fn abandon(&self, err: AmqpError) {
        self.log.lock().reset();
        let waiters: Vec<_> = self.waiters.lock().drain().collect();
        for (_, tx) in waiters {
            let _ = tx.send(Err(err.clone()));
        }
    }

    fn resolve(&self, id: u64, result: Result<(), AmqpError>) {
        if let Some(tx) = self.waiters.lock().remove(&id) {
            let _ = tx.send(result);
        }
    }

    fn forget(&self, id: u64) {
        self.waiters.lock().remove(&id);
        self.log.lock().remove_message(&Outbound {
            id,
            ..Default::default()
        });
    }

    /// Writes are skipped while the exchange is being rebuilt; their log
    /// entries are republished once it settles.
    fn writable(&self, epoch: u64) -> bool {
        self.log.lock().epoch() == epoch && !self.suspended.load(Ordering::SeqCst)
    }

    fn dispatch(self: &Arc<Self>, outbound: Outbound) -> Result<(), AmqpError> {
        let (epoch, seq) = {
            let mut log = self.log.lock();
            (log.epoch(), log.add(outbound.clone()))
        };

        let inner = self.clone();
        let exchange = self.def.name.clone();
        let envelope = outbound.envelope;
        let write = self.channel.submit("publish", move |ch| async move {
            if !inner.writable(epoch) {
                return Ok(None);
            }
            ch.publish(
                &exchange,
                &envelope.routing_key,
                &envelope.payload,
                envelope.properties,
                envelope.mandatory,
            )
            .await
            .map(Some)
        });

        let write = match write {
            Ok(rx) => rx,
            Err(err) => {
                self.log.lock().take(seq);
                return Err(err);
            }
        };

        let inner = self.clone();
        tokio::spawn(async move {
            let confirm: Result<Option<ConfirmFuture>, AmqpError> =
                write.await.unwrap_or(Err(AmqpError::InternalError));
            let outcome = match confirm {
                Ok(Some(confirm)) => confirm.await,
                Ok(None) => return,
                Err(err) => Err(err),
            };
            inner.settle(epoch, seq, outcome);
        });

        Ok(())
    }

    fn settle(&self, epoch: u64, seq: u64, outcome: Result<PublishConfirm, AmqpError>) {
        match outcome {
            Ok(confirm) => {
                let taken = self.log.lock().take_in_epoch(epoch, seq);
                let Some(outbound) = taken else {
                    debug!(
                        name = self.def.name,
                        seq, "ignoring confirmation of an untracked publish"
                    );
                    return;
                };

                let result = match confirm {
                    PublishConfirm::Nack => Err(AmqpError::PublishNacked(self.def.name.clone())),
                    PublishConfirm::Ack | PublishConfirm::NotRequested => Ok(()),
                };
                self.resolve(outbound.id, result);
            }
            Err(err @ (AmqpError::ReleasedResource { .. } | AmqpError::Destroyed(_))) => {
                let taken = self.log.lock().take_in_epoch(epoch, seq);
                if let Some(outbound) = taken {
                    self.resolve(outbound.id, Err(err));
                }
            }
            Err(err) => {
                debug!(
                    name = self.def.name,
                    seq,
                    error = err.to_string(),
                    "publish unconfirmed, kept for replay"
                );
            }
        }
    }

    /// Publishes every unconfirmed message again, in the original order.
    fn replay(self: &Arc<Self>) {
        let pending = self.log.lock().reset();
        self.suspended.store(false, Ordering::SeqCst);
        if pending.is_empty() {
            return;
        }
        info!(
            name = self.def.name,
            count = pending.len(),
            "republishing unconfirmed messages"
        );

        for outbound in pending {
            let id = outbound.id;
            let waiting = self
                .waiters
                .lock()
                .get(&id)
                .is_some_and(|tx| !tx.is_closed());
            if !waiting {
                self.waiters.lock().remove(&id);
                continue;
            }

            if let Err(err) = self.dispatch(outbound) {
                self.resolve(id, Err(err));
            }
        }
    }

    async fn destroy(&self) -> Result<(), AmqpError> {
        if self.status.get() == PrimitiveState::Destroyed {
            return Ok(());
        }

        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        self.status.destroy();
        let result = self.channel.release().await;
        self.abandon(AmqpError::Destroyed(self.def.name.clone()));

        info!(name = self.def.name, "exchange destroyed");
        result
    }
}

#[async_trait]
impl Dependent for ExchangeInner {
    fn name(&self) -> String {
        self.def.name.clone()
    }

    async fn release(&self) -> Result<(), AmqpError> {
        self.destroy().await
    }
}

/// Keeps one exchange declared and publishes to it.
#[derive(Clone)]
pub struct ExchangeController {
    inner: Arc<ExchangeInner>,
}

impl ExchangeController {
    pub fn new(def: ExchangeDefinition, connection: &ConnectionController) -> ExchangeController {
        let channel = connection.create_channel(def.confirm);

        let inner = Arc::new(ExchangeInner {
            status: PrimitiveStatus::new(&def.name),
            def,
            connection: connection.clone(),
            channel,
            log: Mutex::new(PublishLog::new()),
            waiters: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            rebuild: tokio::sync::Mutex::new(()),
            declared_on: AtomicU64::new(0),
            settled_on: AtomicU64::new(0),
            suspended: AtomicBool::new(false),
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
        connection.add_exchange(Arc::downgrade(&dependent));
        tokio::spawn(inner.clone().initialize());

        ExchangeController { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.def.name
    }

    pub fn definition(&self) -> &ExchangeDefinition {
        &self.inner.def
    }

    pub fn state(&self) -> PrimitiveState {
        self.inner.status.get()
    }

    pub fn failure(&self) -> Option<AmqpError> {
        self.inner.status.failure()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PrimitiveEvent> {
        self.inner.status.subscribe()
    }

    /// Resolves once declared, rejects with the declaration failure.
    pub async fn check(&self) -> Result<(), AmqpError> {
        self.inner.status.check().await
    }

    /// Connection generation the exchange was last declared on.
    pub fn declared_on(&self) -> u64 {
        self.inner.declared_on.load(Ordering::SeqCst)
    }

    /// Publishes not confirmed yet.
    pub fn unconfirmed(&self) -> usize {
        self.inner.log.lock().count()
    }

    /// Publishes `envelope` and resolves once the broker confirmed it.
    pub async fn publish(&self, envelope: Envelope) -> Result<(), AmqpError> {
        self.inner.status.ready().await?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.waiters.lock().insert(id, tx);

        let outbound = Outbound {
            id,
            envelope,
            sequence: None,
        };
        if let Err(err) = self.inner.dispatch(outbound) {
            self.inner.waiters.lock().remove(&id);
            return Err(err);
        }

        let received = match self.inner.def.publish_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(received) => received,
                Err(_) => {
                    self.inner.forget(id);
                    warn!(name = self.inner.def.name, id, "publish confirmation timed out");
                    return Err(AmqpError::PublishTimeout {
                        exchange: self.inner.def.name.clone(),
                        timeout_ms: timeout.as_millis() as u64,
                    });
                }
            },
            None => rx.await,
        };

        received.map_err(|_| AmqpError::InternalError)?
    }

    pub async fn destroy(&self) -> Result<(), AmqpError> {
        self.inner.destroy().await
    }

    /// Re-declares the exchange after the connection was replaced. Publishing
    /// resumes with [`ExchangeController::on_bindings_completed`].
    pub(crate) async fn on_reconnected(&self) {
        if self.inner.status.stopped() {
            return;
        }
        self.inner.suspended.store(true, Ordering::SeqCst);
        self.inner.status.set(PrimitiveState::Reconnecting);

        match self.inner.establish().await {
            Ok(()) => {
                self.inner
                    .status
                    .transition(PrimitiveState::Reconnecting, PrimitiveState::Reconnected);
            }
            Err(err) => self.inner.fail(err),
        }
    }

    /// Republishes unconfirmed messages and settles into ready.
    pub(crate) fn on_bindings_completed(&self) {
        let declared_on = self.inner.declared_on.load(Ordering::SeqCst);
        self.inner.settled_on.store(declared_on, Ordering::SeqCst);
        if self.inner.status.get() != PrimitiveState::Reconnected {
            return;
        }
        self.inner.resume();
    }
}
