// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lapin Transport
//!
//! Connections and channels backed by `lapin`. Lapin errors are reported as
//! [`TransportEvent`]s: protocol errors raised by the broker are remote
//! closes, everything else is a transient error.
//!
//! Lapin 2.x surfaces no callback for `connection.blocked` and
//! `connection.unblocked`, so this transport never emits
//! [`TransportEvent::Blocked`] or [`TransportEvent::Unblocked`]. Publishes
//! to a blocked broker simply wait for their confirmation.

use super::{
    AmqpChannel, AmqpConnection, ConfirmFuture, ConsumeOptions, Delivery, DeliveryStream,
    Lifecycle, PublishConfirm, QueueInfo, Transport, TransportEvent,
};
use crate::errors::AmqpError;
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeBindOptions,
        ExchangeDeclareOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions,
    },
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

const EVENTS_CAPACITY: usize = 16;
const REPLY_SUCCESS: u16 = 200;

fn to_amqp_error(err: &lapin::Error) -> AmqpError {
    match err {
        lapin::Error::ProtocolError(reason) => AmqpError::BrokerRejected(reason.to_string()),
        other => AmqpError::TransportError(other.to_string()),
    }
}

fn to_event(err: &lapin::Error) -> TransportEvent {
    match err {
        lapin::Error::ProtocolError(reason) => TransportEvent::Close(reason.to_string()),
        other => TransportEvent::Error(other.to_string()),
    }
}

/// Opens lapin connections.
#[derive(Debug, Clone, Default)]
pub struct LapinTransport {}

impl LapinTransport {
    pub fn new() -> Arc<LapinTransport> {
        Arc::new(LapinTransport {})
    }
}

#[async_trait]
impl Transport for LapinTransport {
    async fn connect(&self, uri: &str, name: &str) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        debug!(name, "creating amqp connection...");
        let options =
            ConnectionProperties::default().with_connection_name(LongString::from(name.to_owned()));

        let conn = match Connection::connect(uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), name, "failure to connect");
                Err(AmqpError::ConnectionError(name.to_owned(), err.to_string()))
            }
        }?;
        debug!(name, "amqp connected");

        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        let sender = events.clone();
        conn.on_error(move |err| {
            warn!(error = err.to_string(), "amqp connection error");
            let _ = sender.send(to_event(&err));
        });

        Ok(Arc::new(LapinConnection { conn, events }))
    }
}

struct LapinConnection {
    conn: Connection,
    events: broadcast::Sender<TransportEvent>,
}

#[async_trait]
impl Lifecycle for LapinConnection {
    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| to_amqp_error(&err))
    }
}

#[async_trait]
impl AmqpConnection for LapinConnection {
    async fn create_channel(&self, confirm: bool) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        debug!("creating amqp channel...");
        let channel = match self.conn.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }?;

        if confirm {
            channel
                .confirm_select(ConfirmSelectOptions::default())
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error to enable publisher confirms");
                    AmqpError::ChannelError(err.to_string())
                })?;
        }

        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        let sender = events.clone();
        channel.on_error(move |err| {
            warn!(error = err.to_string(), "amqp channel error");
            let _ = sender.send(to_event(&err));
        });

        debug!(id = channel.id(), confirm, "channel created");
        Ok(Arc::new(LapinChannel { channel, events }))
    }
}

struct LapinChannel {
    channel: Channel,
    events: broadcast::Sender<TransportEvent>,
}

#[async_trait]
impl Lifecycle for LapinChannel {
    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(REPLY_SUCCESS, "closing")
            .await
            .map_err(|err| to_amqp_error(&err))
    }
}

#[async_trait]
impl AmqpChannel for LapinChannel {
    async fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_declare(name, kind, options, args)
            .await
            .map_err(|err| to_amqp_error(&err))
    }

    async fn declare_queue(
        &self,
        name: &str,
        options: QueueDeclareOptions,
        args: FieldTable,
    ) -> Result<QueueInfo, AmqpError> {
        let queue = self
            .channel
            .queue_declare(name, options, args)
            .await
            .map_err(|err| to_amqp_error(&err))?;

        Ok(QueueInfo {
            name: queue.name().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        key: &str,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .queue_bind(queue, exchange, key, QueueBindOptions { nowait: false }, args)
            .await
            .map_err(|err| to_amqp_error(&err))
    }

    async fn bind_exchange(
        &self,
        target: &str,
        source: &str,
        key: &str,
        args: FieldTable,
    ) -> Result<(), AmqpError> {
        self.channel
            .exchange_bind(target, source, key, ExchangeBindOptions { nowait: false }, args)
            .await
            .map_err(|err| to_amqp_error(&err))
    }

    async fn delete_exchange(&self, name: &str) -> Result<(), AmqpError> {
        self.channel
            .exchange_delete(name, ExchangeDeleteOptions::default())
            .await
            .map_err(|err| to_amqp_error(&err))
    }

    async fn delete_queue(&self, name: &str) -> Result<u32, AmqpError> {
        self.channel
            .queue_delete(name, QueueDeleteOptions::default())
            .await
            .map_err(|err| to_amqp_error(&err))
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|err| to_amqp_error(&err))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
        mandatory: bool,
    ) -> Result<ConfirmFuture, AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory,
                    immediate: false,
                },
                payload,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                to_amqp_error(&err)
            })?;

        Ok(async move {
            match confirm.await {
                Ok(Confirmation::Ack(_)) => Ok(PublishConfirm::Ack),
                Ok(Confirmation::Nack(_)) => Ok(PublishConfirm::Nack),
                Ok(Confirmation::NotRequested) => Ok(PublishConfirm::NotRequested),
                Err(err) => Err(to_amqp_error(&err)),
            }
        }
        .boxed())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
    ) -> Result<DeliveryStream, AmqpError> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: options.no_ack,
                    exclusive: options.exclusive,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                to_amqp_error(&err)
            })?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        let delivery = Delivery {
                            delivery_tag: delivery.delivery_tag,
                            exchange: delivery.exchange.to_string(),
                            routing_key: delivery.routing_key.to_string(),
                            redelivered: delivery.redelivered,
                            properties: delivery.properties,
                            data: delivery.data,
                        };
                        if tx.send(delivery).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        error!(error = err.to_string(), "errors consume msg");
                        break;
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| to_amqp_error(&err))
    }

    async fn ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple })
            .await
            .map_err(|err| AmqpError::AckMessageError(err.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, multiple: bool, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(delivery_tag, BasicNackOptions { multiple, requeue })
            .await
            .map_err(|err| AmqpError::NackMessageError(err.to_string()))
    }
}
