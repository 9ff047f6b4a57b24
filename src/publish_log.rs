// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Unconfirmed publishes, kept in sequence order until the broker confirms
//! them. After a reconnection [`PublishLog::reset`] hands back exactly the
//! messages that must be published again.

use std::collections::BTreeMap;

/// A message that can carry a publish sequence number.
pub trait Sequenced {
    fn sequence(&self) -> Option<u64>;
    fn set_sequence(&mut self, sequence: Option<u64>);
}

#[derive(Debug)]
pub struct PublishLog<M> {
    entries: BTreeMap<u64, M>,
    next: u64,
    epoch: u64,
}

impl<M> Default for PublishLog<M> {
    fn default() -> Self {
        PublishLog {
            entries: BTreeMap::new(),
            next: 0,
            epoch: 0,
        }
    }
}

impl<M: Sequenced + PartialEq> PublishLog<M> {
    pub fn new() -> PublishLog<M> {
        PublishLog::default()
    }

    /// Stores `message`, assigning the next sequence number unless it already
    /// carries one. Returns the sequence number.
    pub fn add(&mut self, mut message: M) -> u64 {
        let seq = match message.sequence() {
            Some(seq) => {
                self.next = self.next.max(seq + 1);
                seq
            }
            None => {
                let seq = self.next;
                self.next += 1;
                message.set_sequence(Some(seq));
                seq
            }
        };

        self.entries.insert(seq, message);
        seq
    }

    /// Forgets the entry, returns whether it existed.
    pub fn remove(&mut self, seq: u64) -> bool {
        self.entries.remove(&seq).is_some()
    }

    pub fn take(&mut self, seq: u64) -> Option<M> {
        self.entries.remove(&seq)
    }

    /// Removes `seq` only when it belongs to the current epoch, so a
    /// confirmation from before a reset cannot drop a replayed entry.
    pub fn take_in_epoch(&mut self, epoch: u64, seq: u64) -> Option<M> {
        if epoch != self.epoch {
            return None;
        }
        self.entries.remove(&seq)
    }

    /// Removes the entry equal to `message`, returns whether it existed.
    pub fn remove_message(&mut self, message: &M) -> bool {
        let seq = match message.sequence() {
            Some(seq) if self.entries.get(&seq) == Some(message) => Some(seq),
            _ => self
                .entries
                .iter()
                .find(|(_, m)| *m == message)
                .map(|(seq, _)| *seq),
        };

        match seq {
            Some(seq) => self.entries.remove(&seq).is_some(),
            None => false,
        }
    }

    pub fn get(&self, seq: u64) -> Option<&M> {
        self.entries.get(&seq)
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Empties the log and returns the surviving messages in publish order,
    /// stripped of their sequence numbers. Starts a new epoch.
    pub fn reset(&mut self) -> Vec<M> {
        let entries = std::mem::take(&mut self.entries);
        self.next = 0;
        self.epoch += 1;

        entries
            .into_values()
            .map(|mut message| {
                message.set_sequence(None);
                message
            })
            .collect()
    }
}
