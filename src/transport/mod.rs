// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Primitive Provider
//!
//! The resilience layer never talks to the wire directly. It acquires
//! connections and channels through these traits, which expose an enumerated
//! set of broker operations plus the `close`/`error`/`blocked`/`unblocked`
//! events the lifecycle engine reacts to.
//!
//! [`LapinTransport`] is the production implementation.

mod lapin_transport;

#[cfg(test)]
pub(crate) mod fake;

pub use self::lapin_transport::LapinTransport;

use crate::errors::AmqpError;
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use lapin::{
    options::{ExchangeDeclareOptions, QueueDeclareOptions},
    types::FieldTable,
    BasicProperties, ExchangeKind,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Events raised by a connection or a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Transient failure; the owner should re-acquire.
    Error(String),
    /// The remote peer closed the resource.
    Close(String),
    /// Broker flow control engaged. Not raised by the lapin transport.
    Blocked(String),
    /// Broker flow control released.
    Unblocked,
}

/// Outcome of a publish on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishConfirm {
    Ack,
    Nack,
    /// The channel is not in confirm mode.
    NotRequested,
}

/// Resolves once the broker confirmed (or refused) a publish.
pub type ConfirmFuture = BoxFuture<'static, Result<PublishConfirm, AmqpError>>;

/// Stream of deliveries of one consumer.
pub type DeliveryStream = mpsc::UnboundedReceiver<Delivery>;

/// A message delivered by the broker to a consumer.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub data: Vec<u8>,
}

/// Result of a queue declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Consumer flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    pub no_ack: bool,
    pub exclusive: bool,
}

/// Behaviour shared by every externally acquired resource.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Subscribes to the resource events. Dropping the receiver unsubscribes.
    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    /// Closes the resource locally.
    async fn close(&self) -> Result<(), AmqpError>;
}

/// Opens connections.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, uri: &str, name: &str) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

#[async_trait]
pub trait AmqpConnection: Lifecycle {
    /// Opens a channel, in confirm mode when `confirm` is set.
    async fn create_channel(&self, confirm: bool) -> Result<Arc<dyn AmqpChannel>, AmqpError>;
}

/// Broker operations available on a channel.
#[async_trait]
pub trait AmqpChannel: Lifecycle {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<QueueInfo, AmqpError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        key: &str,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn bind_exchange(
        &self,
        target: &str,
        source: &str,
        key: &str,
        args: FieldTable,
    ) -> Result<(), AmqpError>;

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError>;

    /// Deletes a queue and returns the number of messages it held.
    async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError>;

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError>;

    /// Writes a message. The returned future resolves with the broker
    /// confirmation; awaiting it is independent from the write ordering.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
        mandatory: bool,
    ) -> Result<ConfirmFuture, AmqpError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), AmqpError>;
}
