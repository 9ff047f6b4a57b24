// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Resilient RabbitMQ client: self-healing connections and channels,
//! batched acknowledgments, confirmed publishes replayed after reconnection
//! and a topology that re-declares itself when the broker goes away.

mod consumer;
mod otel;
mod primitive;

pub mod ack;
pub mod binding;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod message;
pub mod publish_log;
pub mod publisher;
pub mod queue;
pub mod resource;
pub mod topology;
pub mod transport;

pub use primitive::{PrimitiveEvent, PrimitiveState};
