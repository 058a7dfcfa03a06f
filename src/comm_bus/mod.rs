//! The transport the runtime hands its serialized messages to.
//!
//! The runtime never opens sockets; every entity (name node, server thread,
//! bg worker) registers an inbox on a [`CommBus`] and sends bytes addressed by
//! entity id. The bus must deliver messages between any two entities in
//! order and without loss.

mod in_proc;

use std::fmt::Debug;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

pub use in_proc::InProcCommBus;

use crate::config_models::entity_id::EntityId;
use crate::errors::PsError;
use crate::errors::PsResult;
use crate::protocol::PsMsg;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub from: EntityId,
    pub payload: Bytes,
}

impl Envelope {
    pub fn decode(&self) -> PsResult<PsMsg> {
        PsMsg::decode(&self.payload)
    }
}

/// Receiving end of one entity's mailbox.
#[derive(Debug)]
pub struct BusInbox {
    id: EntityId,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl BusInbox {
    pub fn new(id: EntityId, rx: mpsc::UnboundedReceiver<Envelope>) -> Self {
        Self { id, rx }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    /// `None` once every sender is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// `None` on timeout or once every sender is gone.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Envelope> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

pub trait CommBus: Send + Sync + Debug {
    /// Claim the inbox of `id`. Messages sent to `id` before registration are
    /// kept and delivered.
    fn register(&self, id: EntityId) -> PsResult<BusInbox>;

    /// Send to an entity living in this process. Returns the bytes sent.
    fn send_in_proc(&self, from: EntityId, to: EntityId, payload: Bytes) -> PsResult<usize>;

    /// Send to an entity of another process. Returns the bytes sent.
    fn send_inter_proc(&self, from: EntityId, to: EntityId, payload: Bytes) -> PsResult<usize>;

    fn is_local_entity(&self, id: EntityId) -> bool;

    fn send_any(&self, from: EntityId, to: EntityId, payload: Bytes) -> PsResult<usize> {
        if self.is_local_entity(to) {
            self.send_in_proc(from, to, payload)
        } else {
            self.send_inter_proc(from, to, payload)
        }
    }

    fn send_msg(&self, from: EntityId, to: EntityId, msg: &PsMsg) -> PsResult<usize> {
        let payload = Bytes::from(msg.encode()?);
        self.send_any(from, to, payload)
    }
}

pub(crate) fn closed_inbox(to: EntityId) -> PsError {
    PsError::Bus(format!("inbox of entity {} is closed", to))
}
