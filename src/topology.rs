// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! [`Topology`] is the registry of every declared exchange, queue and
//! binding. Declarations are idempotent: a name always maps to the same
//! controller, and a binding identity to the same in-flight or completed
//! binding.
//!
//! When the connection is replaced the topology re-declares every primitive,
//! binds again (the broker forgets bindings of exclusive and auto-deleted
//! primitives) and only then emits [`TopologyEvent::BindingsCompleted`], which
//! releases the exchanges to republish their unconfirmed messages.

use crate::{
    binding::BindingDefinition,
    config::{RabbitMQConfigs, ReplyQueue},
    connection::{ChannelResource, ConnectionController, ConnectionEvent},
    errors::AmqpError,
    exchange::{ExchangeController, ExchangeDefinition},
    message::Envelope,
    primitive::PrimitiveState,
    queue::{MessageHandler, QueueController, QueueDefinition},
    resource::LifecycleState,
    transport::{AmqpChannel, Transport},
};
use futures_util::{
    future::{join_all, BoxFuture, Shared},
    FutureExt,
};
use parking_lot::Mutex;
use std::{collections::HashMap, future::Future, sync::Arc, time::Duration};
use tokio::{sync::broadcast, task::JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type BindingFuture = Shared<BoxFuture<'static, Result<(), AmqpError>>>;

/// Topology notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopologyEvent {
    /// Every binding was re-created after a reconnection.
    BindingsCompleted,
    /// The reply queue is declared under the given name.
    ReplyQueueReady(String),
    Closed,
}

/// Declarative description of exchanges, queues and bindings.
#[derive(Debug, Clone, Default)]
pub struct TopologyDefinition {
    pub exchanges: Vec<ExchangeDefinition>,
    pub queues: Vec<QueueDefinition>,
    pub bindings: Vec<BindingDefinition>,
}

impl TopologyDefinition {
    pub fn new() -> TopologyDefinition {
        TopologyDefinition::default()
    }

    pub fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.exchanges.push(def);
        self
    }

    pub fn queue(mut self, def: QueueDefinition) -> Self {
        self.queues.push(def);
        self
    }

    pub fn binding(mut self, def: BindingDefinition) -> Self {
        self.bindings.push(def);
        self
    }
}

struct TopologyInner {
    connection: ConnectionController,
    control: ChannelResource,
    ack_interval: Duration,
    publish_timeout: Option<Duration>,
    exchanges: Mutex<HashMap<String, ExchangeController>>,
    queues: Mutex<HashMap<String, QueueController>>,
    bindings: Mutex<HashMap<String, (BindingDefinition, BindingFuture)>>,
    reply_queue: Option<String>,
    reconciling: tokio::sync::Mutex<()>,
    events: broadcast::Sender<TopologyEvent>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl TopologyInner {
    /// Runs `op` on the control channel, re-acquiring it on transient failures.
    async fn on_control<R, Fut, Op>(&self, operation: &str, op: Op) -> Result<R, AmqpError>
    where
        R: Send + 'static,
        Fut: Future<Output = Result<R, AmqpError>> + Send + 'static,
        Op: FnOnce(Arc<dyn AmqpChannel>) -> Fut + Clone + Send + 'static,
    {
        loop {
            if self.control.state() == LifecycleState::Acquired
                && self.connection.is_stale(&self.control)
            {
                self.control.invalidate("connection replaced");
            }
            self.control.request();

            match self.control.operate(operation, op.clone()).await {
                Err(err) if err.is_transient() => {
                    warn!(operation, error = err.to_string(), "control channel failure");
                    self.control.invalidate(&err.to_string());
                }
                result => return result,
            }
        }
    }

    fn exchange_controller(
        &self,
        mut def: ExchangeDefinition,
    ) -> (ExchangeController, Option<ExchangeController>) {
        let mut exchanges = self.exchanges.lock();

        let failed = match exchanges.get(&def.name) {
            Some(existing) if existing.state() != PrimitiveState::Failed => {
                return (existing.clone(), None);
            }
            Some(existing) => {
                def = existing.definition().clone();
                exchanges.remove(&def.name)
            }
            None => None,
        };

        if def.publish_timeout.is_none() {
            def.publish_timeout = self.publish_timeout;
        }
        debug!(name = def.name, "creating exchange");
        let controller = ExchangeController::new(def, &self.connection);
        exchanges.insert(controller.name().to_owned(), controller.clone());
        (controller, failed)
    }

    fn queue_controller(
        &self,
        mut def: QueueDefinition,
    ) -> (QueueController, Option<QueueController>) {
        let mut queues = self.queues.lock();

        let failed = match queues.get(&def.name) {
            Some(existing) if existing.state() != PrimitiveState::Failed => {
                return (existing.clone(), None);
            }
            Some(existing) => {
                def = existing.definition().clone();
                queues.remove(&def.name)
            }
            None => None,
        };

        debug!(name = def.name, "creating queue");
        let controller = QueueController::new(def, &self.connection, self.ack_interval);
        queues.insert(controller.name().to_owned(), controller.clone());
        (controller, failed)
    }

    /// The shared binding of `def`. A binding that failed is attempted
    /// again; its definition stays registered either way.
    fn binding_future(self: &Arc<Self>, def: BindingDefinition) -> BindingFuture {
        let mut bindings = self.bindings.lock();
        let id = def.id();

        if let Some((_, bound)) = bindings.get(&id) {
            if !matches!(bound.peek(), Some(Err(_))) {
                return bound.clone();
            }
        }

        let bound = self.clone().bind(def.clone()).boxed().shared();
        bindings.insert(id, (def, bound.clone()));
        bound
    }

    async fn create_binding(self: Arc<Self>, def: BindingDefinition) -> Result<(), AmqpError> {
        self.binding_future(def).await
    }

    /// Binds every registered binding matching `filter` again.
    async fn rebind(self: &Arc<Self>, filter: impl Fn(&BindingDefinition) -> bool) {
        let rebinding: Vec<_> = {
            let mut bindings = self.bindings.lock();
            bindings
                .values_mut()
                .filter(|(def, _)| filter(def))
                .map(|(def, bound)| {
                    *bound = self.clone().bind(def.clone()).boxed().shared();
                    bound.clone()
                })
                .collect()
        };

        for err in join_all(rebinding).await.into_iter().filter_map(Result::err) {
            warn!(error = err.to_string(), "binding not restored");
        }
    }

    async fn bind(self: Arc<Self>, def: BindingDefinition) -> Result<(), AmqpError> {
        let source = self.exchanges.lock().get(&def.source).cloned();
        let target_queue = self.queues.lock().get(&def.target).cloned();
        let target_exchange = self.exchanges.lock().get(&def.target).cloned();
        let to_queue = def.to_queue.unwrap_or(target_queue.is_some());

        let binding_error = |reason: String| AmqpError::BindingError {
            exchange: def.source.clone(),
            target: def.target.clone(),
            connection: self.connection.name().to_owned(),
            reason,
        };

        if let Some(source) = source {
            source.check().await.map_err(|err| binding_error(err.to_string()))?;
        }
        let target_check = match (to_queue, target_queue, target_exchange) {
            (true, Some(queue), _) => queue.check().await,
            (false, _, Some(exchange)) => exchange.check().await,
            _ => Ok(()),
        };
        target_check.map_err(|err| binding_error(err.to_string()))?;

        debug!(binding = def.id(), to_queue, "binding");
        for key in def.keys() {
            let (source, target, args) = (def.source.clone(), def.target.clone(), def.arguments());
            let result = self
                .on_control("bind", move |ch| async move {
                    if to_queue {
                        ch.bind_queue(&target, &source, &key, args).await
                    } else {
                        ch.bind_exchange(&target, &source, &key, args).await
                    }
                })
                .await;

            if let Err(err) = result {
                error!(binding = def.id(), error = err.to_string(), "failure to bind");
                return Err(binding_error(err.to_string()));
            }
        }

        Ok(())
    }

    async fn restore_bindings(self: &Arc<Self>, name: &str) {
        self.rebind(|def| def.source == name || def.target == name).await;
    }

    fn forget_bindings(&self, name: &str) {
        self.bindings
            .lock()
            .retain(|_, (def, _)| def.source != name && def.target != name);
    }

    async fn reconcile(self: Arc<Self>) {
        let _reconciling = self.reconciling.lock().await;
        info!(name = self.connection.name(), "reconciling topology");

        let exchanges: Vec<_> = self.exchanges.lock().values().cloned().collect();
        let queues: Vec<_> = self.queues.lock().values().cloned().collect();

        join_all(exchanges.iter().map(ExchangeController::on_reconnected)).await;
        join_all(queues.iter().map(QueueController::on_reconnected)).await;

        let exchange_checks = join_all(exchanges.iter().map(ExchangeController::check)).await;
        let queue_checks = join_all(queues.iter().map(QueueController::check)).await;
        for err in exchange_checks
            .into_iter()
            .chain(queue_checks)
            .filter_map(Result::err)
        {
            warn!(error = err.to_string(), "primitive not restored");
        }

        if let Some(reply_queue) = &self.reply_queue {
            let _ = self
                .events
                .send(TopologyEvent::ReplyQueueReady(reply_queue.clone()));
        }

        self.rebind(|_| true).await;

        info!(name = self.connection.name(), "bindings completed");
        let _ = self.events.send(TopologyEvent::BindingsCompleted);
        for exchange in &exchanges {
            exchange.on_bindings_completed();
        }
    }
}

/// Registry and reconciler of the declared primitives of one connection.
#[derive(Clone)]
pub struct Topology {
    inner: Arc<TopologyInner>,
}

impl Topology {
    pub fn new(transport: Arc<dyn Transport>, configs: &RabbitMQConfigs) -> Topology {
        let connection = ConnectionController::new(transport, configs);
        let control = connection.create_channel(false);
        let (events, _) = broadcast::channel(64);

        let reply_queue = match &configs.reply_queue {
            ReplyQueue::Generated => Some(format!("{}.response.{}", configs.name, Uuid::new_v4())),
            ReplyQueue::Named(name) => Some(name.clone()),
            ReplyQueue::Disabled => None,
        };

        let inner = Arc::new(TopologyInner {
            connection,
            control,
            ack_interval: configs.ack_interval(),
            publish_timeout: configs.publish_timeout(),
            exchanges: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            bindings: Mutex::new(HashMap::new()),
            reply_queue: reply_queue.clone(),
            reconciling: tokio::sync::Mutex::new(()),
            events,
            watcher: Mutex::new(None),
        });

        if let Some(name) = reply_queue {
            let def = match configs.reply_queue {
                ReplyQueue::Generated => QueueDefinition::new(&name).exclusive().delete(),
                _ => QueueDefinition::new(&name),
            };
            inner.queue_controller(def.no_ack());
        }

        let mut connection_events = inner.connection.subscribe();
        let weak = Arc::downgrade(&inner);
        *inner.watcher.lock() = Some(tokio::spawn(async move {
            loop {
                match connection_events.recv().await {
                    Ok(ConnectionEvent::Reconnected) => match weak.upgrade() {
                        Some(inner) => {
                            tokio::spawn(inner.reconcile());
                        }
                        None => break,
                    },
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "missed connection events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        Topology { inner }
    }

    pub fn connection(&self) -> &ConnectionController {
        &self.inner.connection
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TopologyEvent> {
        self.inner.events.subscribe()
    }

    /// Resolves once the connection is established.
    pub async fn connect(&self) -> Result<(), AmqpError> {
        self.inner.connection.connect().await
    }

    /// Name of the reply queue, unless disabled.
    pub fn reply_queue(&self) -> Option<&str> {
        self.inner.reply_queue.as_deref()
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeController> {
        self.inner.exchanges.lock().get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<QueueController> {
        self.inner.queues.lock().get(name).cloned()
    }

    /// Declares the exchange once per name. A failed exchange is declared
    /// again with its first definition, then its bindings are restored.
    pub async fn create_exchange(&self, def: ExchangeDefinition) -> Result<ExchangeController, AmqpError> {
        let (controller, failed) = self.inner.exchange_controller(def);
        let recovered = failed.is_some();
        if let Some(failed) = failed {
            let _ = failed.destroy().await;
        }

        controller.check().await?;
        if recovered {
            self.inner.restore_bindings(controller.name()).await;
        }
        Ok(controller)
    }

    /// Declares the queue once per name. A failed queue is declared again
    /// with its first definition, then its bindings are restored.
    pub async fn create_queue(&self, def: QueueDefinition) -> Result<QueueController, AmqpError> {
        let (controller, failed) = self.inner.queue_controller(def);
        let recovered = failed.is_some();
        if let Some(failed) = failed {
            let _ = failed.destroy().await;
        }

        controller.check().await?;
        if recovered {
            self.inner.restore_bindings(controller.name()).await;
        }
        Ok(controller)
    }

    /// Binds once per binding identity. Concurrent callers share the same
    /// binding; a failed binding may be attempted again.
    pub async fn create_binding(&self, def: BindingDefinition) -> Result<(), AmqpError> {
        self.inner.clone().create_binding(def).await
    }

    /// Destroys the exchange controller, then deletes the exchange.
    pub async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        let controller = self.inner.exchanges.lock().remove(name);
        if let Some(controller) = controller {
            controller.destroy().await?;
        }
        self.inner.forget_bindings(name);

        let exchange = name.to_owned();
        self.inner
            .on_control("delete exchange", move |ch| async move {
                ch.delete_exchange(&exchange).await
            })
            .await
            .map_err(|err| AmqpError::DeleteError {
                kind: "exchange".to_owned(),
                name: name.to_owned(),
                reason: err.to_string(),
            })
    }

    /// Destroys the queue controller, then deletes the queue. Returns the
    /// number of messages it held.
    pub async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError> {
        let controller = self.inner.queues.lock().remove(name);
        if let Some(controller) = controller {
            controller.destroy().await?;
        }
        self.inner.forget_bindings(name);

        let queue = name.to_owned();
        self.inner
            .on_control("delete queue", move |ch| async move { ch.delete_queue(&queue).await })
            .await
            .map_err(|err| AmqpError::DeleteError {
                kind: "queue".to_owned(),
                name: name.to_owned(),
                reason: err.to_string(),
            })
    }

    /// Creates exchanges, then queues, then bindings, stopping at the first
    /// failing stage.
    pub async fn configure(&self, def: TopologyDefinition) -> Result<(), AmqpError> {
        let stage = |stage: &str| {
            let stage = stage.to_owned();
            move |err: AmqpError| {
                error!(stage, error = err.to_string(), "failure to configure topology");
                AmqpError::ConfigurationError {
                    stage,
                    reason: Box::new(err),
                }
            }
        };

        for exchange in def.exchanges {
            self.create_exchange(exchange).await.map_err(stage("exchanges"))?;
        }
        for queue in def.queues {
            self.create_queue(queue).await.map_err(stage("queues"))?;
        }
        for binding in def.bindings {
            self.create_binding(binding).await.map_err(stage("bindings"))?;
        }

        Ok(())
    }

    /// Publishes through a declared exchange.
    pub async fn publish(&self, exchange: &str, envelope: Envelope) -> Result<(), AmqpError> {
        let Some(controller) = self.exchange(exchange) else {
            return Err(AmqpError::UndefinedPrimitive(
                "exchange".to_owned(),
                exchange.to_owned(),
            ));
        };
        controller.publish(envelope).await
    }

    /// Consumes a declared queue with `handler`.
    pub async fn consume(&self, queue: &str, handler: Arc<dyn MessageHandler>) -> Result<(), AmqpError> {
        let Some(controller) = self.queue(queue) else {
            return Err(AmqpError::UndefinedPrimitive(
                "queue".to_owned(),
                queue.to_owned(),
            ));
        };
        controller.subscribe(handler).await
    }

    /// Closes the connection after draining its queues and exchanges.
    pub async fn close(&self) -> Result<(), AmqpError> {
        if let Some(watcher) = self.inner.watcher.lock().take() {
            watcher.abort();
        }

        if let Err(err) = self.inner.control.release().await {
            warn!(error = err.to_string(), "failure to release control channel");
        }
        let result = self.inner.connection.close().await;

        self.inner.exchanges.lock().clear();
        self.inner.queues.lock().clear();
        self.inner.bindings.lock().clear();
        let _ = self.inner.events.send(TopologyEvent::Closed);

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::Message,
        transport::{
            fake::{delivery, eventually, FakeTransport},
            PublishConfirm, TransportEvent,
        },
    };
    use async_trait::async_trait;

    fn configs() -> RabbitMQConfigs {
        RabbitMQConfigs {
            reply_queue: ReplyQueue::Disabled,
            ack_interval_ms: 10,
            ..Default::default()
        }
    }

    fn setup() -> (Arc<FakeTransport>, Topology) {
        let transport = FakeTransport::new();
        let topology = Topology::new(transport.clone(), &configs());
        (transport, topology)
    }

    struct Acker;

    #[async_trait]
    impl MessageHandler for Acker {
        async fn handle(&self, message: &Message) -> Result<(), AmqpError> {
            message.ack();
            Ok(())
        }
    }

    #[tokio::test]
    async fn declares_each_primitive_once() {
        let (transport, topology) = setup();

        let (first, second) = tokio::join!(
            topology.create_exchange(ExchangeDefinition::new("events").topic()),
            topology.create_exchange(ExchangeDefinition::new("events").topic()),
        );
        first.unwrap();
        second.unwrap();
        topology.create_queue(QueueDefinition::new("orders")).await.unwrap();
        topology.create_queue(QueueDefinition::new("orders")).await.unwrap();

        assert_eq!(transport.count("declare_exchange:events"), 1);
        assert_eq!(transport.count("declare_queue:orders"), 1);
    }

    #[tokio::test]
    async fn bindings_are_deduplicated() {
        let (transport, topology) = setup();
        topology.create_exchange(ExchangeDefinition::new("events")).await.unwrap();
        topology.create_queue(QueueDefinition::new("orders")).await.unwrap();

        let binding = BindingDefinition::new("events", "orders").routing_key("order.*");
        let (first, second) = tokio::join!(
            topology.create_binding(binding.clone()),
            topology.create_binding(binding.clone()),
        );
        first.unwrap();
        second.unwrap();
        topology.create_binding(binding).await.unwrap();

        assert_eq!(transport.count("bind_queue:events->orders:order.*"), 1);
    }

    #[tokio::test]
    async fn binding_to_an_exchange_is_inferred() {
        let (transport, topology) = setup();
        topology
            .configure(
                TopologyDefinition::new()
                    .exchange(ExchangeDefinition::new("events"))
                    .exchange(ExchangeDefinition::new("audit").fanout())
                    .binding(BindingDefinition::new("events", "audit")),
            )
            .await
            .unwrap();

        assert_eq!(transport.count("bind_exchange:events->audit:"), 1);
    }

    #[tokio::test]
    async fn configure_reports_the_failing_stage() {
        let (transport, topology) = setup();
        transport.reject_declare("orders");

        let result = topology
            .configure(
                TopologyDefinition::new()
                    .exchange(ExchangeDefinition::new("events"))
                    .queue(QueueDefinition::new("orders"))
                    .binding(BindingDefinition::new("events", "orders")),
            )
            .await;

        match result {
            Err(AmqpError::ConfigurationError { stage, reason }) => {
                assert_eq!(stage, "queues");
                assert!(matches!(*reason, AmqpError::DeclareQueueError { .. }));
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(transport.count("bind_queue:"), 0);
    }

    #[tokio::test]
    async fn failed_queue_is_declared_again_with_its_first_definition() {
        let (transport, topology) = setup();
        transport.reject_declare("orders");

        assert!(topology.create_queue(QueueDefinition::new("orders").durable()).await.is_err());
        assert!(topology.create_queue(QueueDefinition::new("orders")).await.is_err());

        assert_eq!(transport.count("declare_queue:orders"), 2);
        assert!(topology.queue("orders").unwrap().definition().durable);
    }

    #[tokio::test]
    async fn publishing_to_an_unknown_exchange_fails() {
        let (_, topology) = setup();

        let result = topology.publish("missing", Envelope::new("", "x")).await;

        assert_eq!(
            result,
            Err(AmqpError::UndefinedPrimitive(
                "exchange".to_owned(),
                "missing".to_owned()
            ))
        );
    }

    #[tokio::test]
    async fn reconnection_rebinds_before_republishing() {
        let (transport, topology) = setup();
        let mut events = topology.subscribe();
        topology
            .configure(
                TopologyDefinition::new()
                    .exchange(ExchangeDefinition::new("events"))
                    .queue(QueueDefinition::new("orders"))
                    .binding(BindingDefinition::new("events", "orders")),
            )
            .await
            .unwrap();

        transport.hold_confirms(true);
        let publishing = {
            let topology = topology.clone();
            tokio::spawn(async move { topology.publish("events", Envelope::new("", "m1")).await })
        };
        assert!(eventually(|| transport.count("publish:events::m1") == 1).await);

        transport.clear_calls();
        transport
            .last_connection()
            .unwrap()
            .emit(TransportEvent::Error("connection reset".to_owned()));

        assert!(eventually(|| transport.count("publish:events::m1") == 1).await);
        assert_eq!(events.recv().await.unwrap(), TopologyEvent::BindingsCompleted);

        let declared = transport.position("declare_exchange:events").unwrap();
        let bound = transport.position("bind_queue:events->orders:").unwrap();
        let republished = transport.position("publish:events::m1").unwrap();
        assert!(declared < bound);
        assert!(bound < republished);

        transport.hold_confirms(false);
        transport.release_confirms(PublishConfirm::Ack);
        assert_eq!(publishing.await.unwrap(), Ok(()));
        assert_eq!(topology.exchange("events").unwrap().unconfirmed(), 0);
    }

    #[tokio::test]
    async fn forced_connection_close_rebinds_before_republishing() {
        let (transport, topology) = setup();
        let mut events = topology.subscribe();
        topology
            .configure(
                TopologyDefinition::new()
                    .exchange(ExchangeDefinition::new("events"))
                    .queue(QueueDefinition::new("orders"))
                    .binding(BindingDefinition::new("events", "orders")),
            )
            .await
            .unwrap();

        transport.hold_confirms(true);
        let publishing = {
            let topology = topology.clone();
            tokio::spawn(async move { topology.publish("events", Envelope::new("", "m1")).await })
        };
        assert!(eventually(|| transport.count("publish:events::m1") == 1).await);

        transport.clear_calls();
        transport
            .last_connection()
            .unwrap()
            .emit(TransportEvent::Close("CONNECTION_FORCED".to_owned()));
        for channel in transport.channels() {
            channel.emit(TransportEvent::Close("CONNECTION_FORCED".to_owned()));
        }

        assert_eq!(events.recv().await.unwrap(), TopologyEvent::BindingsCompleted);
        assert!(eventually(|| transport.count("publish:events::m1") == 1).await);

        let bound = transport.position("bind_queue:events->orders:").unwrap();
        let republished = transport.position("publish:events::m1").unwrap();
        assert!(bound < republished);
        assert_eq!(transport.count("publish:events::m1"), 1);

        transport.hold_confirms(false);
        transport.release_confirms(PublishConfirm::Ack);
        assert_eq!(publishing.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn bindings_outlive_a_failed_reconnection() {
        let (transport, topology) = setup();
        let mut events = topology.subscribe();
        topology
            .configure(
                TopologyDefinition::new()
                    .exchange(ExchangeDefinition::new("events"))
                    .queue(QueueDefinition::new("orders"))
                    .binding(BindingDefinition::new("events", "orders")),
            )
            .await
            .unwrap();

        transport.reject_declare("orders");
        transport.clear_calls();
        transport
            .last_connection()
            .unwrap()
            .emit(TransportEvent::Error("connection reset".to_owned()));

        assert_eq!(events.recv().await.unwrap(), TopologyEvent::BindingsCompleted);
        assert_eq!(topology.queue("orders").unwrap().state(), PrimitiveState::Failed);
        assert_eq!(transport.count("bind_queue:"), 0);
        assert_eq!(topology.inner.bindings.lock().len(), 1);

        transport.accept_declare("orders");
        topology.create_queue(QueueDefinition::new("orders")).await.unwrap();

        assert_eq!(transport.count("bind_queue:events->orders:"), 1);
    }

    #[tokio::test]
    async fn consumes_and_batches_acknowledgments() {
        let (transport, topology) = setup();
        topology.create_queue(QueueDefinition::new("orders")).await.unwrap();
        topology.consume("orders", Arc::new(Acker)).await.unwrap();

        transport.deliver("orders", delivery(1, "a"));
        transport.deliver("orders", delivery(2, "b"));

        assert!(eventually(|| topology.queue("orders").unwrap().unresolved() == 0).await);
        assert!(eventually(|| transport.count("ack:2:true") == 1).await);
    }

    #[tokio::test]
    async fn delete_forgets_the_queue_and_its_bindings() {
        let (transport, topology) = setup();
        topology.create_exchange(ExchangeDefinition::new("events")).await.unwrap();
        topology.create_queue(QueueDefinition::new("orders")).await.unwrap();
        topology
            .create_binding(BindingDefinition::new("events", "orders"))
            .await
            .unwrap();

        topology.delete_queue("orders").await.unwrap();

        assert!(topology.queue("orders").is_none());
        assert_eq!(transport.count("delete_queue:orders"), 1);

        topology.create_queue(QueueDefinition::new("orders")).await.unwrap();
        topology
            .create_binding(BindingDefinition::new("events", "orders"))
            .await
            .unwrap();
        assert_eq!(transport.count("declare_queue:orders"), 2);
        assert_eq!(transport.count("bind_queue:events->orders:"), 2);
    }

    #[tokio::test]
    async fn generated_reply_queue_is_exclusive_and_redeclared() {
        let transport = FakeTransport::new();
        let topology = Topology::new(
            transport.clone(),
            &RabbitMQConfigs {
                name: "billing".to_owned(),
                ..Default::default()
            },
        );
        let mut events = topology.subscribe();

        let name = topology.reply_queue().unwrap().to_owned();
        assert!(name.starts_with("billing.response."));
        topology.queue(&name).unwrap().check().await.unwrap();

        transport
            .last_connection()
            .unwrap()
            .emit(TransportEvent::Error("connection reset".to_owned()));

        assert_eq!(
            events.recv().await.unwrap(),
            TopologyEvent::ReplyQueueReady(name.clone())
        );
        assert_eq!(transport.count(&format!("declare_queue:{name}")), 2);
    }

    #[tokio::test]
    async fn close_drains_primitives_before_the_connection() {
        let (transport, topology) = setup();
        topology.create_exchange(ExchangeDefinition::new("events")).await.unwrap();
        topology.create_queue(QueueDefinition::new("orders")).await.unwrap();

        topology.close().await.unwrap();

        let closed = transport.position("close_connection").unwrap();
        let calls = transport.calls();
        assert!(calls[..closed].iter().any(|c| c.starts_with("close_channel:")));
        assert!(!calls[closed..].iter().any(|c| c.starts_with("close_channel:")));
        assert_eq!(topology.connection().state(), crate::connection::ConnectionState::Closed);
    }
}
