// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the Resilient RabbitMQ Layer
//!
//! `AmqpError` covers every failure the lifecycle engine, the acknowledgment
//! batching and the topology manager can surface. User-visible variants carry
//! the primitive kind, its name, the connection name and the underlying reason
//! so a failure can be diagnosed without inspecting internals.
//!
//! The enum is `Clone` because failures fan out through broadcast channels to
//! every observer of a resource or primitive.

use thiserror::Error;

/// Represents errors that can occur during AMQP/RabbitMQ operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect `{0}`: {1}")]
    ConnectionError(String, String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel: {0}")]
    ChannelError(String),

    /// Transient transport failure: broken socket, dead channel, I/O error
    #[error("transport failure: {0}")]
    TransportError(String),

    /// The broker refused an operation at the protocol level
    #[error("rejected by the broker: {0}")]
    BrokerRejected(String),

    /// An operation was invoked on a resource that was explicitly released
    #[error("cannot invoke `{operation}` on released resource `{resource}`")]
    ReleasedResource { resource: String, operation: String },

    /// A primitive was destroyed and can no longer be used
    #[error("{0} was destroyed")]
    Destroyed(String),

    /// Error declaring an exchange
    #[error("failure to declare exchange `{name}` on connection `{connection}`: {reason}")]
    DeclareExchangeError {
        name: String,
        connection: String,
        reason: String,
    },

    /// Error declaring a queue
    #[error("failure to declare queue `{name}` on connection `{connection}`: {reason}")]
    DeclareQueueError {
        name: String,
        connection: String,
        reason: String,
    },

    /// Error binding a queue or an exchange to an exchange
    #[error("failure to bind `{target}` to exchange `{exchange}` on connection `{connection}`: {reason}")]
    BindingError {
        exchange: String,
        target: String,
        connection: String,
        reason: String,
    },

    /// Error deleting an exchange or a queue
    #[error("failure to delete {kind} `{name}`: {reason}")]
    DeleteError {
        kind: String,
        name: String,
        reason: String,
    },

    /// A primitive was referenced before being declared
    #[error("{0} `{1}` is not defined")]
    UndefinedPrimitive(String, String),

    /// A publish was not confirmed within the configured window
    #[error("publish to `{exchange}` was not confirmed within {timeout_ms}ms")]
    PublishTimeout { exchange: String, timeout_ms: u64 },

    /// The broker negatively confirmed a publish
    #[error("publish to `{0}` was nacked by the broker")]
    PublishNacked(String),

    /// Error parsing a message payload
    #[error("failure to parse payload")]
    ParsePayloadError,

    /// Error acknowledging a message
    #[error("failure to ack message: {0}")]
    AckMessageError(String),

    /// Error negative-acknowledging a message
    #[error("failure to nack message: {0}")]
    NackMessageError(String),

    /// A reply was requested for a message without `reply_to`
    #[error("message has no reply-to address")]
    MissingReplyTo,

    /// Error publishing a message to the Dead Letter Queue (DLQ)
    #[error("failure to publish to dlq")]
    PublishingToDQLError,

    /// Error configuring Quality of Service parameters
    #[error("failure to configure qos `{0}`")]
    QoSDeclarationError(String),

    /// Error declaring a consumer
    #[error("consumer declaration error: {0}")]
    ConsumerDeclarationError(String),

    /// Error consuming a message
    #[error("failure to consume message `{0}`")]
    ConsumerError(String),

    /// Invalid configuration values
    #[error("invalid configuration: {0}")]
    InvalidConfigs(String),

    /// A stage of the declarative topology setup failed
    #[error("failure to create {stage}: {reason}")]
    ConfigurationError {
        stage: String,
        reason: Box<AmqpError>,
    },
}

impl AmqpError {
    /// Whether the failure came from a broken transport rather than from the
    /// broker refusing the operation.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AmqpError::TransportError(_) | AmqpError::ChannelError(_) | AmqpError::ConnectionError(..)
        )
    }
}
