// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Readiness bookkeeping shared by queue and exchange controllers.

use crate::errors::AmqpError;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveState {
    Initializing,
    Ready,
    Reconnecting,
    /// Declared again after a reconnection, waiting to settle.
    Reconnected,
    Failed,
    Destroyed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrimitiveEvent {
    Defined,
    Failed(AmqpError),
    Destroyed,
}

pub(crate) struct PrimitiveStatus {
    name: String,
    state: watch::Sender<PrimitiveState>,
    failure: Mutex<Option<AmqpError>>,
    events: broadcast::Sender<PrimitiveEvent>,
}

impl PrimitiveStatus {
    pub(crate) fn new(name: &str) -> PrimitiveStatus {
        let (state, _) = watch::channel(PrimitiveState::Initializing);
        let (events, _) = broadcast::channel(16);

        PrimitiveStatus {
            name: name.to_owned(),
            state,
            failure: Mutex::new(None),
            events,
        }
    }

    pub(crate) fn get(&self) -> PrimitiveState {
        *self.state.borrow()
    }

    pub(crate) fn set(&self, state: PrimitiveState) {
        self.state.send_replace(state);
    }

    /// Moves to `to` only from `from`, returns whether it moved.
    pub(crate) fn transition(&self, from: PrimitiveState, to: PrimitiveState) -> bool {
        self.state.send_if_modified(|state| {
            if *state != from {
                return false;
            }
            *state = to;
            true
        })
    }

    pub(crate) fn failure(&self) -> Option<AmqpError> {
        self.failure.lock().clone()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<PrimitiveEvent> {
        self.events.subscribe()
    }

    pub(crate) fn define(&self) {
        *self.failure.lock() = None;
        self.set(PrimitiveState::Ready);
        let _ = self.events.send(PrimitiveEvent::Defined);
    }

    pub(crate) fn fail(&self, err: AmqpError) {
        *self.failure.lock() = Some(err.clone());
        self.set(PrimitiveState::Failed);
        let _ = self.events.send(PrimitiveEvent::Failed(err));
    }

    pub(crate) fn destroy(&self) {
        self.set(PrimitiveState::Destroyed);
        let _ = self.events.send(PrimitiveEvent::Destroyed);
    }

    /// Whether the primitive reached a state no rebuild can leave.
    pub(crate) fn stopped(&self) -> bool {
        matches!(
            self.get(),
            PrimitiveState::Failed | PrimitiveState::Destroyed
        )
    }

    /// Resolves once declared, including right after a reconnection.
    pub(crate) async fn check(&self) -> Result<(), AmqpError> {
        self.wait(|state| matches!(state, PrimitiveState::Ready | PrimitiveState::Reconnected))
            .await
    }

    /// Resolves once fully settled.
    pub(crate) async fn ready(&self) -> Result<(), AmqpError> {
        self.wait(|state| state == PrimitiveState::Ready).await
    }

    async fn wait<F: Fn(PrimitiveState) -> bool>(&self, accept: F) -> Result<(), AmqpError> {
        let mut rx = self.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            if accept(state) {
                return Ok(());
            }
            match state {
                PrimitiveState::Failed => {
                    return Err(self.failure().unwrap_or(AmqpError::InternalError));
                }
                PrimitiveState::Destroyed => {
                    return Err(AmqpError::Destroyed(self.name.clone()));
                }
                _ => {}
            }

            rx.changed().await.map_err(|_| AmqpError::InternalError)?;
        }
    }
}
