// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Configuration
//!
//! Connection parameters, retry policy and timing knobs for the resilient
//! layer. Every field has a default so partial JSON documents are accepted.

use crate::errors::AmqpError;
use serde::Deserialize;
use std::time::Duration;
use tracing::error;

/// Retry policy for connection and channel acquisition.
///
/// The wait starts at `min_ms`, grows by `increment_ms` after each
/// consecutive failure and never exceeds `max_ms`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryConfigs {
    pub min_ms: u64,
    pub max_ms: u64,
    pub increment_ms: u64,
}

impl Default for RetryConfigs {
    fn default() -> Self {
        RetryConfigs {
            min_ms: 0,
            max_ms: 5000,
            increment_ms: 100,
        }
    }
}

/// How the topology provisions its reply queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "name")]
pub enum ReplyQueue {
    /// A uniquely named, exclusive, auto-deleted queue.
    #[default]
    Generated,
    /// A queue with the given name.
    Named(String),
    /// No reply queue.
    Disabled,
}

/// Connection and behaviour settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    /// Connection name, reported to the broker and used in error messages.
    pub name: String,
    pub host: String,
    /// Failover hosts; when empty only `host` is used.
    pub hosts: Vec<String>,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
    pub retry: RetryConfigs,
    /// Interval of the acknowledgment signal driving batch resolution.
    pub ack_interval_ms: u64,
    /// Publishes not confirmed within this window are rejected locally.
    pub publish_timeout_ms: Option<u64>,
    pub reply_queue: ReplyQueue,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            name: "default".to_owned(),
            host: "localhost".to_owned(),
            hosts: vec![],
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            retry: RetryConfigs::default(),
            ack_interval_ms: 500,
            publish_timeout_ms: None,
            reply_queue: ReplyQueue::default(),
        }
    }
}

impl RabbitMQConfigs {
    /// Parses configs from a JSON document, filling missing fields with defaults.
    pub fn from_json(raw: &str) -> Result<Self, AmqpError> {
        let cfg: RabbitMQConfigs = serde_json::from_str(raw).map_err(|err| {
            error!(error = err.to_string(), "failure to parse rabbitmq configs");
            AmqpError::InvalidConfigs(err.to_string())
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.retry.min_ms > self.retry.max_ms {
            return Err(AmqpError::InvalidConfigs(format!(
                "retry.min_ms ({}) is greater than retry.max_ms ({})",
                self.retry.min_ms, self.retry.max_ms
            )));
        }

        if self.ack_interval_ms == 0 {
            return Err(AmqpError::InvalidConfigs(
                "ack_interval_ms must be greater than zero".to_owned(),
            ));
        }

        Ok(())
    }

    /// One `amqp://` URI per configured host, in failover order.
    pub fn uris(&self) -> Vec<String> {
        let vhost = if self.vhost == "/" {
            "%2f".to_owned()
        } else {
            self.vhost.trim_start_matches('/').to_owned()
        };

        let hosts = if self.hosts.is_empty() {
            vec![self.host.clone()]
        } else {
            self.hosts.clone()
        };

        hosts
            .iter()
            .map(|host| {
                format!(
                    "amqp://{}:{}@{}:{}/{}",
                    self.user, self.password, host, self.port, vhost
                )
            })
            .collect()
    }

    pub fn ack_interval(&self) -> Duration {
        Duration::from_millis(self.ack_interval_ms)
    }

    pub fn publish_timeout(&self) -> Option<Duration> {
        self.publish_timeout_ms.map(Duration::from_millis)
    }
}
