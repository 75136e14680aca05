// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-participant message delivery between the round driver and the parties.
//!
//! `send` addresses a message *to* a participant; `receive` never blocks and
//! yields `None` when nothing is queued. Waiting is the caller's business.

mod socket;

use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::Mutex;

pub use socket::{
    Connection, ControlInterceptor, Frame, Interception, SocketTransport, CLOSE_NORMAL,
    CLOSE_PROTOCOL_ERROR,
};

use crate::error::{Result, TandemError};
use crate::types::Participant;

/// Messages an inbox holds before further pushes are refused.
pub const INBOX_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub participant: Participant,
    pub payload: Vec<u8>,
}

impl TransportMessage {
    pub fn new(participant: Participant, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            participant,
            payload: payload.into(),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: TransportMessage) -> Result<()>;
    async fn receive(&self, participant: Participant) -> Result<Option<Vec<u8>>>;
}

/// One bounded FIFO inbox per participant.
#[derive(Default)]
pub(crate) struct Inboxes {
    queues: [Mutex<VecDeque<Vec<u8>>>; 2],
}

impl Inboxes {
    pub(crate) fn push(&self, to: Participant, payload: Vec<u8>) -> Result<()> {
        let mut queue = self.queues[to.index()].lock();
        if queue.len() >= INBOX_CAPACITY {
            return Err(TandemError::Transport(format!("inbox for {to} is full")));
        }
        queue.push_back(payload);
        Ok(())
    }

    pub(crate) fn pop(&self, to: Participant) -> Option<Vec<u8>> {
        self.queues[to.index()].lock().pop_front()
    }

    pub(crate) fn len(&self, to: Participant) -> usize {
        self.queues[to.index()].lock().len()
    }

    pub(crate) fn clear(&self) {
        for queue in &self.queues {
            queue.lock().clear();
        }
    }
}

/// Both inboxes in process memory. Used for tests and when one process plays both parties.
#[derive(Default)]
pub struct InMemoryTransport {
    inboxes: Inboxes,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self, participant: Participant) -> usize {
        self.inboxes.len(participant)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, message: TransportMessage) -> Result<()> {
        self.inboxes.push(message.participant, message.payload)
    }

    async fn receive(&self, participant: Participant) -> Result<Option<Vec<u8>>> {
        Ok(self.inboxes.pop(participant))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_fifo_per_participant() {
        let transport = InMemoryTransport::new();
        transport
            .send(TransportMessage::new(Participant::Server, b"one".to_vec()))
            .await
            .unwrap();
        transport
            .send(TransportMessage::new(Participant::Server, b"two".to_vec()))
            .await
            .unwrap();
        transport
            .send(TransportMessage::new(Participant::Device, b"three".to_vec()))
            .await
            .unwrap();

        assert_eq!(transport.pending(Participant::Server), 2);
        assert_eq!(
            transport.receive(Participant::Server).await.unwrap(),
            Some(b"one".to_vec())
        );
        assert_eq!(
            transport.receive(Participant::Device).await.unwrap(),
            Some(b"three".to_vec())
        );
        assert_eq!(
            transport.receive(Participant::Server).await.unwrap(),
            Some(b"two".to_vec())
        );
    }

    #[tokio::test]
    async fn test_full_inbox_refuses_send() {
        let transport = InMemoryTransport::new();
        for i in 0..INBOX_CAPACITY {
            transport
                .send(TransportMessage::new(Participant::Server, vec![i as u8]))
                .await
                .unwrap();
        }
        let err = transport
            .send(TransportMessage::new(Participant::Server, vec![0]))
            .await
            .unwrap_err();
        assert!(matches!(err, TandemError::Transport(_)));
        assert_eq!(transport.pending(Participant::Server), INBOX_CAPACITY);
        assert_eq!(transport.pending(Participant::Device), 0);

        transport.receive(Participant::Server).await.unwrap();
        transport
            .send(TransportMessage::new(Participant::Server, vec![1]))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_receive_empty_is_none() {
        let transport = InMemoryTransport::new();
        assert!(transport.receive(Participant::Device).await.unwrap().is_none());
    }
}
