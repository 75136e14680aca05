// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{Inboxes, Transport, TransportMessage};
use crate::error::{Result, TandemError};
use crate::types::Participant;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// Outbound unit written to a participant's socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

/// Write side of one participant connection.
///
/// The socket task owns the receiving half of the channel and writes frames
/// to the wire; once it stops, the connection reports closed.
#[derive(Debug, Clone)]
pub struct Connection {
    outbound: mpsc::UnboundedSender<Frame>,
    open: Arc<AtomicBool>,
}

impl Connection {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: tx,
                open: Arc::new(AtomicBool::new(true)),
            },
            rx,
        )
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire) && !self.outbound.is_closed()
    }

    pub fn send(&self, frame: Frame) -> Result<()> {
        if !self.is_open() {
            return Err(TandemError::Transport("connection is not open".into()));
        }
        self.outbound
            .send(frame)
            .map_err(|_| TandemError::Transport("connection writer has shut down".into()))
    }

    /// Sends a close frame once; later calls do nothing.
    pub fn close(&self, code: u16, reason: &str) {
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.outbound.send(Frame::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }

    /// Records that the peer went away without writing anything.
    pub fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub fn same_as(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.open, &other.open)
    }
}

pub enum Interception {
    /// Not a control message; deliver as protocol payload.
    Forward,
    /// Consumed, optionally with a reply for the sender.
    Handled(Option<Frame>),
}

/// Inspects device-channel bytes before they reach the round driver.
#[async_trait]
pub trait ControlInterceptor: Send + Sync {
    async fn intercept(&self, payload: &[u8]) -> Interception;
}

/// Transport whose participants are live socket connections.
///
/// Sending fails immediately when the target has no open connection; nothing
/// is buffered for participants that have not attached yet. Bytes read from a
/// participant's socket land in the *other* participant's inbox.
#[derive(Default)]
pub struct SocketTransport {
    inboxes: Inboxes,
    connections: RwLock<[Option<Connection>; 2]>,
    interceptor: RwLock<Option<Arc<dyn ControlInterceptor>>>,
    closed: AtomicBool,
}

impl SocketTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_interceptor(&self, interceptor: Arc<dyn ControlInterceptor>) {
        *self.interceptor.write() = Some(interceptor);
    }

    /// Returns the connection it replaced, if any.
    pub fn attach(&self, participant: Participant, connection: Connection) -> Option<Connection> {
        debug!(%participant, "connection attached");
        self.connections.write()[participant.index()].replace(connection)
    }

    /// Detaches `connection` if it is still the one attached for `participant`.
    pub fn detach(&self, participant: Participant, connection: &Connection) -> bool {
        let mut connections = self.connections.write();
        let slot = &mut connections[participant.index()];
        let attached = slot.as_ref().is_some_and(|c| c.same_as(connection));
        if attached {
            *slot = None;
            debug!(%participant, "connection detached");
        }
        attached
    }

    pub fn connection(&self, participant: Participant) -> Option<Connection> {
        self.connections.read()[participant.index()].clone()
    }

    pub fn pending(&self, participant: Participant) -> usize {
        self.inboxes.len(participant)
    }

    /// Routes bytes read from `from`'s socket.
    pub async fn on_inbound(&self, from: Participant, payload: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            return Err(TandemError::Transport("transport closed".into()));
        }
        if from == Participant::Device {
            let interceptor = self.interceptor.read().clone();
            if let Some(interceptor) = interceptor {
                if let Interception::Handled(reply) = interceptor.intercept(&payload).await {
                    if let Some(frame) = reply {
                        let connection = self.connection(from).ok_or_else(|| {
                            TandemError::Transport(format!("no connection attached for {from}"))
                        })?;
                        connection.send(frame)?;
                    }
                    return Ok(());
                }
            }
        }
        self.inboxes.push(from.peer(), payload)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes every attached connection and drops queued messages. Receives
    /// fail from then on.
    pub fn close(&self, code: u16, reason: &str) {
        self.closed.store(true, Ordering::Release);
        let mut connections = self.connections.write();
        for slot in connections.iter_mut() {
            if let Some(connection) = slot.take() {
                connection.close(code, reason);
            }
        }
        drop(connections);
        self.inboxes.clear();
    }
}

#[async_trait]
impl Transport for SocketTransport {
    async fn send(&self, message: TransportMessage) -> Result<()> {
        let participant = message.participant;
        let connection = self.connection(participant).ok_or_else(|| {
            TandemError::Transport(format!("no connection attached for {participant}"))
        })?;
        if !connection.is_open() {
            warn!(%participant, "send on closed connection");
            return Err(TandemError::Transport(format!(
                "connection for {participant} is not open"
            )));
        }
        connection.send(Frame::Binary(message.payload))
    }

    async fn receive(&self, participant: Participant) -> Result<Option<Vec<u8>>> {
        if self.is_closed() {
            return Err(TandemError::Transport("transport closed".into()));
        }
        Ok(self.inboxes.pop(participant))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::INBOX_CAPACITY;

    struct EchoControl;

    #[async_trait]
    impl ControlInterceptor for EchoControl {
        async fn intercept(&self, payload: &[u8]) -> Interception {
            if payload.starts_with(b"{") {
                Interception::Handled(Some(Frame::Text("ack".into())))
            } else {
                Interception::Forward
            }
        }
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let transport = SocketTransport::new();
        let err = transport
            .send(TransportMessage::new(Participant::Device, vec![1]))
            .await
            .unwrap_err();
        assert!(matches!(err, TandemError::Transport(_)));
    }

    #[tokio::test]
    async fn test_send_on_closed_connection_fails() {
        let transport = SocketTransport::new();
        let (conn, rx) = Connection::channel();
        transport.attach(Participant::Device, conn);
        drop(rx);
        assert!(transport
            .send(TransportMessage::new(Participant::Device, vec![1]))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_send_writes_binary_frame() {
        let transport = SocketTransport::new();
        let (conn, mut rx) = Connection::channel();
        transport.attach(Participant::Device, conn);
        transport
            .send(TransportMessage::new(Participant::Device, vec![9, 9]))
            .await
            .unwrap();
        assert_eq!(rx.recv().await, Some(Frame::Binary(vec![9, 9])));
    }

    #[tokio::test]
    async fn test_inbound_goes_to_peer_inbox() {
        let transport = SocketTransport::new();
        transport
            .on_inbound(Participant::Device, b"from-device".to_vec())
            .await
            .unwrap();
        transport
            .on_inbound(Participant::Server, b"from-server".to_vec())
            .await
            .unwrap();
        assert_eq!(
            transport.receive(Participant::Server).await.unwrap(),
            Some(b"from-device".to_vec())
        );
        assert_eq!(
            transport.receive(Participant::Device).await.unwrap(),
            Some(b"from-server".to_vec())
        );
    }

    #[tokio::test]
    async fn test_control_messages_are_diverted() {
        let transport = SocketTransport::new();
        transport.set_interceptor(Arc::new(EchoControl));
        let (conn, mut rx) = Connection::channel();
        transport.attach(Participant::Device, conn);

        transport
            .on_inbound(Participant::Device, b"{\"type\":\"x\"}".to_vec())
            .await
            .unwrap();
        assert_eq!(transport.pending(Participant::Server), 0);
        assert_eq!(rx.recv().await, Some(Frame::Text("ack".into())));

        // server channel is never intercepted
        transport
            .on_inbound(Participant::Server, b"{\"type\":\"x\"}".to_vec())
            .await
            .unwrap();
        assert_eq!(transport.pending(Participant::Device), 1);
    }

    #[tokio::test]
    async fn test_detach_only_matching_connection() {
        let transport = SocketTransport::new();
        let (old, _old_rx) = Connection::channel();
        let (new, _new_rx) = Connection::channel();
        transport.attach(Participant::Device, old.clone());
        let replaced = transport.attach(Participant::Device, new.clone());
        assert!(replaced.unwrap().same_as(&old));

        assert!(!transport.detach(Participant::Device, &old));
        assert!(transport.detach(Participant::Device, &new));
        assert!(transport.connection(Participant::Device).is_none());
    }

    #[tokio::test]
    async fn test_close_sends_close_frame_once() {
        let transport = SocketTransport::new();
        let (conn, mut rx) = Connection::channel();
        transport.attach(Participant::Device, conn.clone());
        transport.close(CLOSE_NORMAL, "done");
        conn.close(CLOSE_NORMAL, "again");
        assert_eq!(
            rx.recv().await,
            Some(Frame::Close {
                code: CLOSE_NORMAL,
                reason: "done".into()
            })
        );
        assert!(rx.try_recv().is_err());
        assert!(!conn.is_open());
    }

    #[tokio::test]
    async fn test_closed_transport_refuses_io() {
        let transport = SocketTransport::new();
        transport
            .on_inbound(Participant::Device, b"queued".to_vec())
            .await
            .unwrap();
        transport.close(CLOSE_NORMAL, "done");

        assert!(transport.is_closed());
        assert_eq!(transport.pending(Participant::Server), 0);
        assert!(matches!(
            transport.receive(Participant::Server).await,
            Err(TandemError::Transport(_))
        ));
        assert!(transport
            .on_inbound(Participant::Device, b"late".to_vec())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_undrained_inbox_is_bounded() {
        let transport = SocketTransport::new();
        for _ in 0..INBOX_CAPACITY {
            transport
                .on_inbound(Participant::Server, vec![0])
                .await
                .unwrap();
        }
        assert!(transport
            .on_inbound(Participant::Server, vec![0])
            .await
            .is_err());
        assert_eq!(
            transport.pending(Participant::Device),
            INBOX_CAPACITY
        );
    }
}
