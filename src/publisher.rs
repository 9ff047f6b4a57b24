// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! [`RabbitMQPublisher`] publishes typed JSON messages through the exchanges
//! declared on a [`Topology`], propagating the OpenTelemetry context in the
//! message headers. Publishes resolve once the broker confirmed them.

use crate::{
    errors::AmqpError,
    message::{Envelope, JSON_CONTENT_TYPE},
    otel,
    topology::Topology,
};
use async_trait::async_trait;
use lapin::{
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
        ShortUInt,
    },
    BasicProperties,
};
use opentelemetry::Context;
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tracing::error;
use uuid::Uuid;

/// Typed header value of a published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValues {
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    Uint(u16),
    LongUint(u32),
    LongLongUint(u64),
}

impl From<HeaderValues> for AMQPValue {
    fn from(value: HeaderValues) -> Self {
        match value {
            HeaderValues::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValues::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValues::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValues::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValues::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValues::Uint(v) => AMQPValue::ShortUInt(ShortUInt::from(v)),
            HeaderValues::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
            // AMQP 0-9-1 tables carry no unsigned 64-bit integer.
            HeaderValues::LongLongUint(v) => {
                AMQPValue::LongLongInt(LongLongInt::try_from(v).unwrap_or(LongLongInt::MAX))
            }
        }
    }
}

/// A message to publish: destination exchange, routing key, type and body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishMessage {
    pub to: String,
    pub key: Option<String>,
    pub msg_type: Option<String>,
    pub data: Vec<u8>,
    pub headers: Option<HashMap<String, HeaderValues>>,
}

impl PublishMessage {
    pub fn new(to: &str, key: Option<&str>, msg_type: Option<&str>, data: &[u8]) -> PublishMessage {
        PublishMessage {
            to: to.to_owned(),
            key: key.map(str::to_owned),
            msg_type: msg_type.map(str::to_owned),
            data: data.to_vec(),
            headers: None,
        }
    }

    /// Serializes `payload` as JSON.
    pub fn json<T: Serialize>(
        to: &str,
        key: Option<&str>,
        msg_type: Option<&str>,
        payload: &T,
    ) -> Result<PublishMessage, AmqpError> {
        let data = serde_json::to_vec(payload).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::ParsePayloadError
        })?;

        Ok(PublishMessage {
            data,
            ..PublishMessage::new(to, key, msg_type, &[])
        })
    }

    pub fn header(mut self, key: &str, value: HeaderValues) -> Self {
        self.headers
            .get_or_insert_with(HashMap::new)
            .insert(key.to_owned(), value);
        self
    }
}

/// Publishes application messages.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, ctx: &Context, infos: &PublishMessage) -> Result<(), AmqpError>;
}

/// RabbitMQ implementation of the [`Publisher`] trait.
pub struct RabbitMQPublisher {
    topology: Topology,
}

impl RabbitMQPublisher {
    pub fn new(topology: Topology) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher { topology })
    }

    fn envelope(ctx: &Context, infos: &PublishMessage) -> Envelope {
        let mut btree = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject(ctx, &mut btree);

        if let Some(headers) = &infos.headers {
            for (key, value) in headers {
                btree.insert(ShortString::from(key.as_str()), value.clone().into());
            }
        }

        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_type(ShortString::from(infos.msg_type.clone().unwrap_or_default()))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(btree));

        Envelope::new(&infos.key.clone().unwrap_or_default(), infos.data.clone())
            .with_properties(properties)
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish(&self, ctx: &Context, infos: &PublishMessage) -> Result<(), AmqpError> {
        let envelope = RabbitMQPublisher::envelope(ctx, infos);

        self.topology
            .publish(&infos.to, envelope)
            .await
            .map_err(|err| {
                error!(exchange = infos.to, error = err.to_string(), "error publishing message");
                err
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{RabbitMQConfigs, ReplyQueue},
        exchange::ExchangeDefinition,
        transport::fake::FakeTransport,
    };

    #[test]
    fn envelope_carries_type_id_and_headers() {
        let infos = PublishMessage::new("events", Some("order.created"), Some("OrderCreated"), b"{}")
            .header("tenant", HeaderValues::ShortString("acme".to_owned()))
            .header("attempt", HeaderValues::LongLongUint(u64::MAX));

        let envelope = RabbitMQPublisher::envelope(&Context::new(), &infos);

        assert_eq!(envelope.routing_key, "order.created");
        let props = &envelope.properties;
        assert_eq!(props.kind().as_ref().map(|k| k.as_str()), Some("OrderCreated"));
        assert_eq!(
            props.content_type().as_ref().map(|c| c.as_str()),
            Some(JSON_CONTENT_TYPE)
        );
        assert!(props.message_id().is_some());

        let headers = props.headers().clone().unwrap_or_default();
        assert_eq!(
            headers.inner().get("tenant"),
            Some(&AMQPValue::ShortString(ShortString::from("acme")))
        );
        assert_eq!(
            headers.inner().get("attempt"),
            Some(&AMQPValue::LongLongInt(i64::MAX))
        );
    }

    #[test]
    fn json_serializes_the_payload() {
        let infos = PublishMessage::json("events", None, None, &vec![1, 2]).unwrap();

        assert_eq!(infos.data, b"[1,2]".to_vec());
        assert_eq!(infos.key, None);
    }

    #[tokio::test]
    async fn publishes_through_the_topology() {
        let transport = FakeTransport::new();
        let topology = Topology::new(
            transport.clone(),
            &RabbitMQConfigs {
                reply_queue: ReplyQueue::Disabled,
                ..Default::default()
            },
        );
        topology
            .create_exchange(ExchangeDefinition::new("events"))
            .await
            .unwrap();
        let publisher = RabbitMQPublisher::new(topology);

        let sent = publisher
            .publish(
                &Context::new(),
                &PublishMessage::new("events", Some("k"), Some("Kind"), b"body"),
            )
            .await;
        let missing = publisher
            .publish(&Context::new(), &PublishMessage::new("other", None, None, b"body"))
            .await;

        assert_eq!(sent, Ok(()));
        assert_eq!(transport.count("publish:events:k:body"), 1);
        assert!(matches!(missing, Err(AmqpError::UndefinedPrimitive(..))));
    }
}
