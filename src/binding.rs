// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Bindings
//!
//! A [`BindingDefinition`] routes messages from a source exchange to a queue
//! or to another exchange, once per routing key.

use lapin::types::{AMQPValue, FieldTable, ShortString};
use std::collections::BTreeMap;

/// Definition of a binding between an exchange and a queue or exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindingDefinition {
    pub(crate) source: String,
    pub(crate) target: String,
    pub(crate) keys: Vec<String>,
    pub(crate) params: BTreeMap<ShortString, AMQPValue>,
    pub(crate) to_queue: Option<bool>,
}

impl BindingDefinition {
    /// Creates a binding from the `source` exchange to `target`.
    ///
    /// Without routing keys the binding uses the empty key. Whether `target`
    /// is a queue or an exchange is resolved against the declared primitives
    /// unless set with [`BindingDefinition::to_queue`] or
    /// [`BindingDefinition::to_exchange`].
    pub fn new(source: &str, target: &str) -> BindingDefinition {
        BindingDefinition {
            source: source.to_owned(),
            target: target.to_owned(),
            ..Default::default()
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Adds a routing key.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.keys.push(key.to_owned());
        self
    }

    pub fn routing_keys<I, K>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.keys.extend(keys.into_iter().map(Into::into));
        self
    }

    pub fn param(mut self, key: ShortString, value: AMQPValue) -> Self {
        self.params.insert(key, value);
        self
    }

    pub fn to_queue(mut self) -> Self {
        self.to_queue = Some(true);
        self
    }

    pub fn to_exchange(mut self) -> Self {
        self.to_queue = Some(false);
        self
    }

    /// Routing keys to bind with, the empty key when none was given.
    pub fn keys(&self) -> Vec<String> {
        if self.keys.is_empty() {
            return vec![String::new()];
        }
        self.keys.clone()
    }

    pub(crate) fn arguments(&self) -> FieldTable {
        FieldTable::from(self.params.clone())
    }

    /// Identity used to deduplicate bindings: `source->target` followed by
    /// the routing keys.
    pub fn id(&self) -> String {
        let mut id = format!("{}->{}", self.source, self.target);
        for key in self.keys() {
            id.push(':');
            id.push_str(&key);
        }
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_the_empty_routing_key() {
        let binding = BindingDefinition::new("events", "orders");

        assert_eq!(binding.keys(), vec!["".to_owned()]);
        assert_eq!(binding.id(), "events->orders:");
    }

    #[test]
    fn keys_take_part_in_the_identity() {
        let created = BindingDefinition::new("events", "orders").routing_key("order.created");
        let both = BindingDefinition::new("events", "orders")
            .routing_keys(["order.created", "order.paid"]);

        assert_ne!(created.id(), both.id());
        assert_eq!(both.id(), "events->orders:order.created:order.paid");
    }
}
