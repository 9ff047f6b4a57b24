// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! [`Envelope`] is what applications publish; [`Message`] is what consumers
//! receive, carrying the acknowledgment, reply and forward operations.

use crate::{
    ack::MessageHandle,
    connection::ChannelResource,
    errors::AmqpError,
    transport::{Delivery, PublishConfirm},
};
use lapin::{
    types::{FieldTable, ShortString},
    BasicProperties,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error};

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// A message to publish.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub properties: BasicProperties,
    /// Ask the broker to return the message when it cannot be routed.
    pub mandatory: bool,
}

impl Envelope {
    pub fn new(routing_key: &str, payload: impl Into<Vec<u8>>) -> Envelope {
        Envelope {
            routing_key: routing_key.to_owned(),
            payload: payload.into(),
            ..Default::default()
        }
    }

    /// Serializes `value` as JSON and sets the JSON content type.
    pub fn json<T: Serialize>(routing_key: &str, value: &T) -> Result<Envelope, AmqpError> {
        let payload = serde_json::to_vec(value).map_err(|err| {
            error!(error = err.to_string(), "failure to serialize payload");
            AmqpError::ParsePayloadError
        })?;

        Ok(Envelope::new(routing_key, payload).with_properties(
            BasicProperties::default().with_content_type(ShortString::from(JSON_CONTENT_TYPE)),
        ))
    }

    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }
}

/// A delivered message.
///
/// Acknowledgment calls only flip the message disposition; the broker is
/// informed by the queue's batch signal.
pub struct Message {
    queue: String,
    delivery: Delivery,
    handle: Option<MessageHandle>,
    channel: ChannelResource,
}

impl Message {
    pub(crate) fn new(
        queue: &str,
        delivery: Delivery,
        handle: Option<MessageHandle>,
        channel: ChannelResource,
    ) -> Message {
        Message {
            queue: queue.to_owned(),
            delivery,
            handle,
            channel,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery.delivery_tag
    }

    pub fn routing_key(&self) -> &str {
        &self.delivery.routing_key
    }

    pub fn exchange(&self) -> &str {
        &self.delivery.exchange
    }

    pub fn redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    pub fn data(&self) -> &[u8] {
        &self.delivery.data
    }

    pub fn properties(&self) -> &BasicProperties {
        &self.delivery.properties
    }

    pub fn headers(&self) -> FieldTable {
        self.delivery.properties.headers().clone().unwrap_or_default()
    }

    /// The message type carried in the `type` property.
    pub fn kind(&self) -> String {
        match self.delivery.properties.kind() {
            Some(value) => value.to_string(),
            _ => "".to_owned(),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.delivery.data).map_err(|err| {
            error!(error = err.to_string(), "failure to parse payload");
            AmqpError::ParsePayloadError
        })
    }

    /// Whether no disposition was applied yet.
    pub fn is_pending(&self) -> bool {
        self.handle.as_ref().is_some_and(MessageHandle::is_pending)
    }

    /// Returns false when the message already has a disposition or was
    /// consumed without acknowledgments.
    pub fn ack(&self) -> bool {
        self.handle.as_ref().is_some_and(MessageHandle::ack)
    }

    /// Negative acknowledgment, requeued by the broker.
    pub fn nack(&self) -> bool {
        self.handle.as_ref().is_some_and(MessageHandle::nack)
    }

    /// Negative acknowledgment, dead-lettered or dropped by the broker.
    pub fn reject(&self) -> bool {
        self.handle.as_ref().is_some_and(MessageHandle::reject)
    }

    /// Publishes `payload` to the `reply_to` queue through the default
    /// exchange, correlated with this message id.
    pub async fn reply(
        &self,
        payload: impl Into<Vec<u8>>,
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let Some(reply_to) = self.delivery.properties.reply_to().clone() else {
            return Err(AmqpError::MissingReplyTo);
        };

        let properties = match self.delivery.properties.message_id() {
            Some(id) => properties.with_correlation_id(id.clone()),
            None => properties,
        };

        debug!(queue = self.queue, reply_to = reply_to.as_str(), "replying");
        publish_on(
            &self.channel,
            "",
            reply_to.as_str(),
            payload.into(),
            properties,
        )
        .await
    }

    /// Publishes the same body and properties to another exchange.
    pub async fn forward(&self, exchange: &str, routing_key: &str) -> Result<(), AmqpError> {
        publish_on(
            &self.channel,
            exchange,
            routing_key,
            self.delivery.data.clone(),
            self.delivery.properties.clone(),
        )
        .await
    }
}

pub(crate) async fn publish_on(
    channel: &ChannelResource,
    exchange: &str,
    routing_key: &str,
    payload: Vec<u8>,
    properties: BasicProperties,
) -> Result<(), AmqpError> {
    let exchange = exchange.to_owned();
    let routing_key = routing_key.to_owned();

    channel
        .operate("publish", move |ch| async move {
            let confirm = ch
                .publish(&exchange, &routing_key, &payload, properties, false)
                .await?;
            match confirm.await? {
                PublishConfirm::Nack => Err(AmqpError::PublishNacked(exchange)),
                PublishConfirm::Ack | PublishConfirm::NotRequested => Ok(()),
            }
        })
        .await
}
