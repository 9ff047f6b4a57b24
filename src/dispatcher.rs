// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Dispatcher
//!
//! The dispatcher routes deliveries to [`ConsumerHandler`]s by queue and
//! message type. Consumption runs on the queue controllers of a
//! [`Topology`], so it survives channel and connection loss.

use crate::{
    consumer::TypedHandler,
    errors::AmqpError,
    topology::{Topology, TopologyEvent},
};
use async_trait::async_trait;
use opentelemetry::Context;
use serde::de::DeserializeOwned;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::broadcast;
use tracing::{error, info};

/// A delivered message handed to a [`ConsumerHandler`].
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerMessage {
    pub from: String,
    pub msg_type: String,
    pub data: Vec<u8>,
    pub headers: Option<HashMap<String, String>>,
}

impl ConsumerMessage {
    pub fn new(
        from: &str,
        msg_type: &str,
        data: &[u8],
        headers: Option<HashMap<String, String>>,
    ) -> ConsumerMessage {
        ConsumerMessage {
            from: from.to_owned(),
            msg_type: msg_type.to_owned(),
            data: data.to_vec(),
            headers,
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        serde_json::from_slice(&self.data).map_err(|err| {
            error!(error = err.to_string(), "failure to parse payload");
            AmqpError::ParsePayloadError
        })
    }
}

/// Processes messages of one type.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, ctx: &Context, msg: &ConsumerMessage) -> Result<(), AmqpError>;
}

/// Associates a message type received on a queue with a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherDefinition {
    pub name: String,
    pub msg_type: Option<String>,
}

impl DispatcherDefinition {
    pub fn new(queue: &str, msg_type: Option<&str>) -> DispatcherDefinition {
        DispatcherDefinition {
            name: queue.to_owned(),
            msg_type: msg_type.map(str::to_owned),
        }
    }
}

/// Routes deliveries of the declared queues to their handlers.
pub struct RabbitMQDispatcher {
    topology: Topology,
    pub(crate) routes: HashMap<String, HashMap<String, Arc<dyn ConsumerHandler>>>,
}

impl RabbitMQDispatcher {
    pub fn new(topology: Topology) -> Self {
        RabbitMQDispatcher {
            topology,
            routes: HashMap::default(),
        }
    }

    /// Registers `handler` for the messages of `def.msg_type` received on the
    /// `def.name` queue.
    pub fn register(mut self, def: &DispatcherDefinition, handler: Arc<dyn ConsumerHandler>) -> Self {
        self.routes
            .entry(def.name.clone())
            .or_default()
            .insert(def.msg_type.clone().unwrap_or_default(), handler);
        self
    }

    /// Starts consuming every queue with registered handlers.
    pub async fn consume(&self) -> Result<(), AmqpError> {
        for (queue, handlers) in &self.routes {
            let Some(controller) = self.topology.queue(queue) else {
                error!(queue, "consuming an undeclared queue");
                return Err(AmqpError::UndefinedPrimitive(
                    "queue".to_owned(),
                    queue.clone(),
                ));
            };

            let handler = TypedHandler::new(controller.definition().clone(), handlers.clone());
            controller
                .subscribe(Arc::new(handler))
                .await
                .map_err(|err| AmqpError::ConsumerDeclarationError(err.to_string()))?;
            info!(queue, types = handlers.len(), "dispatching");
        }

        Ok(())
    }

    /// Consumes until the topology is closed.
    pub async fn consume_blocking(&self) -> Result<(), AmqpError> {
        let mut events = self.topology.subscribe();
        self.consume().await?;

        loop {
            match events.recv().await {
                Ok(TopologyEvent::Closed) | Err(broadcast::error::RecvError::Closed) => {
                    return Ok(())
                }
                _ => {}
            }
        }
    }
}
