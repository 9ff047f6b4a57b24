// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Consumer
//!
//! Typed message processing: the handler registered for the message type
//! runs inside a consumer span, and failures follow the queue retry policy.
//! Messages are rejected into the retry queue until their `x-death` count
//! reaches the configured retries, then forwarded to the DLQ.

use crate::{
    dispatcher::{ConsumerHandler, ConsumerMessage},
    errors::AmqpError,
    message::Message,
    otel,
    queue::{MessageHandler, QueueDefinition},
};
use async_trait::async_trait;
use lapin::types::{AMQPValue, FieldTable};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, collections::HashMap, sync::Arc};
use tracing::{debug, error, warn};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

pub(crate) struct TypedHandler {
    def: QueueDefinition,
    handlers: HashMap<String, Arc<dyn ConsumerHandler>>,
}

impl TypedHandler {
    pub(crate) fn new(
        def: QueueDefinition,
        handlers: HashMap<String, Arc<dyn ConsumerHandler>>,
    ) -> TypedHandler {
        TypedHandler { def, handlers }
    }

    /// Applies the failure policy to a message its handler could not process.
    async fn on_failure(&self, message: &Message, count: i64) -> Result<(), AmqpError> {
        let Some(retries) = self.def.retries() else {
            message.reject();
            return Ok(());
        };

        if count < i64::from(retries) {
            warn!(
                queue = self.def.name(),
                attempt = count,
                "error while handling msg, requeuing for later"
            );
            message.reject();
            return Ok(());
        }

        let Some(dlq) = self.def.dlq_name() else {
            error!(queue = self.def.name(), "too many attempts, dropping msg");
            message.ack();
            return Ok(());
        };

        error!(queue = self.def.name(), dlq, "too many attempts, sending to dlq");
        message.forward("", dlq).await.map_err(|err| {
            error!(error = err.to_string(), "error while sending to dlq");
            AmqpError::PublishingToDQLError
        })?;
        message.ack();
        Ok(())
    }
}

#[async_trait]
impl MessageHandler for TypedHandler {
    async fn handle(&self, message: &Message) -> Result<(), AmqpError> {
        let msg_type = message.kind();
        let count = death_count(&message.headers());

        let tracer = global::tracer("amqp consumer");
        let (ctx, mut span) = otel::consumer_span(message.properties(), &tracer, &msg_type);

        debug!(
            msg_type,
            exchange = message.exchange(),
            queue = message.queue(),
            "received"
        );

        let Some(handler) = self.handlers.get(&msg_type) else {
            let reason = "removing message from queue - reason: unsupported msg type";
            span.record_error(&AmqpError::ConsumerError(reason.to_owned()));
            span.set_status(Status::Error {
                description: Cow::from(reason),
            });
            debug!(msg_type, "{}", reason);

            message.ack();
            return Ok(());
        };

        let msg = ConsumerMessage::new(message.queue(), &msg_type, message.data(), None);
        match handler.exec(&ctx, &msg).await {
            Ok(()) => {
                debug!(msg_type, "message successfully processed");
                span.set_status(Status::Ok);
                message.ack();
                Ok(())
            }
            Err(err) => {
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
                self.on_failure(message, count).await
            }
        }
    }
}

/// Number of times the message was dead-lettered, from the first `x-death` entry.
fn death_count(headers: &FieldTable) -> i64 {
    headers
        .inner()
        .get(AMQP_HEADERS_X_DEATH)
        .and_then(AMQPValue::as_array)
        .and_then(|deaths| deaths.as_slice().first())
        .and_then(AMQPValue::as_field_table)
        .and_then(|death| death.inner().get(AMQP_HEADERS_COUNT))
        .and_then(AMQPValue::as_long_long_int)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{RabbitMQConfigs, ReplyQueue},
        dispatcher::{DispatcherDefinition, MockConsumerHandler, RabbitMQDispatcher},
        topology::Topology,
        transport::{
            fake::{delivery, eventually, FakeTransport},
            Delivery,
        },
    };
    use lapin::{
        types::{FieldArray, ShortString},
        BasicProperties,
    };
    use std::collections::BTreeMap;

    fn typed(tag: u64, kind: &str, deaths: Option<i64>) -> Delivery {
        let mut headers = BTreeMap::new();
        if let Some(count) = deaths {
            let mut death = BTreeMap::new();
            death.insert(
                ShortString::from(AMQP_HEADERS_COUNT),
                AMQPValue::LongLongInt(count),
            );
            headers.insert(
                ShortString::from(AMQP_HEADERS_X_DEATH),
                AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(
                    FieldTable::from(death),
                )])),
            );
        }

        Delivery {
            properties: BasicProperties::default()
                .with_type(ShortString::from(kind))
                .with_headers(FieldTable::from(headers)),
            ..delivery(tag, "payload")
        }
    }

    async fn dispatch(
        def: QueueDefinition,
        succeed: bool,
    ) -> (Arc<FakeTransport>, RabbitMQDispatcher) {
        let transport = FakeTransport::new();
        let topology = Topology::new(
            transport.clone(),
            &RabbitMQConfigs {
                reply_queue: ReplyQueue::Disabled,
                ack_interval_ms: 10,
                ..Default::default()
            },
        );
        let queue = def.name().to_owned();
        topology.create_queue(def).await.unwrap();

        let mut handler = MockConsumerHandler::new();
        handler.expect_exec().returning(move |_, msg| {
            assert_eq!(msg.msg_type, "OrderCreated");
            if succeed {
                Ok(())
            } else {
                Err(AmqpError::ConsumerError("boom".to_owned()))
            }
        });

        let dispatcher = RabbitMQDispatcher::new(topology).register(
            &DispatcherDefinition::new(&queue, Some("OrderCreated")),
            Arc::new(handler),
        );
        dispatcher.consume().await.unwrap();

        (transport, dispatcher)
    }

    #[test]
    fn death_count_reads_the_first_entry() {
        let props = typed(1, "OrderCreated", Some(2)).properties;

        assert_eq!(death_count(&props.headers().clone().unwrap_or_default()), 2);
        assert_eq!(death_count(&FieldTable::default()), 0);
    }

    #[tokio::test]
    async fn processed_messages_are_acked() {
        let (transport, _dispatcher) = dispatch(QueueDefinition::new("orders"), true).await;

        transport.deliver("orders", typed(1, "OrderCreated", None));

        assert!(eventually(|| transport.count("ack:1:true") == 1).await);
    }

    #[tokio::test]
    async fn unsupported_types_are_acked_and_dropped() {
        let (transport, _dispatcher) = dispatch(QueueDefinition::new("orders"), true).await;

        transport.deliver("orders", typed(1, "Unknown", None));

        assert!(eventually(|| transport.count("ack:1:true") == 1).await);
    }

    #[tokio::test]
    async fn failures_without_retry_are_rejected() {
        let def = QueueDefinition::new("orders").with_dlq();
        let (transport, _dispatcher) = dispatch(def, false).await;

        transport.deliver("orders", typed(1, "OrderCreated", None));

        assert!(eventually(|| transport.count("nack:1:true:false") == 1).await);
    }

    #[tokio::test]
    async fn failures_under_the_retry_limit_go_to_the_retry_queue() {
        let def = QueueDefinition::new("orders").with_dlq().with_retry(1000, 3);
        let (transport, _dispatcher) = dispatch(def, false).await;

        transport.deliver("orders", typed(1, "OrderCreated", Some(2)));

        assert!(eventually(|| transport.count("nack:1:true:false") == 1).await);
        assert_eq!(transport.count("publish:"), 0);
    }

    #[tokio::test]
    async fn exhausted_retries_are_forwarded_to_the_dlq() {
        let def = QueueDefinition::new("orders").with_dlq().with_retry(1000, 3);
        let (transport, _dispatcher) = dispatch(def, false).await;

        transport.deliver("orders", typed(1, "OrderCreated", Some(3)));

        assert!(eventually(|| transport.count("ack:1:true") == 1).await);
        let forwarded = transport.position("publish::orders-dlq:payload").unwrap();
        assert!(forwarded < transport.position("ack:1:true").unwrap());
    }
}
