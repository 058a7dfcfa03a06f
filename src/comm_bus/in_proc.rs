use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

use super::closed_inbox;
use super::BusInbox;
use super::CommBus;
use super::Envelope;
use crate::config_models::entity_id::client_id_of;
use crate::config_models::entity_id::EntityId;
use crate::errors::PsError;
use crate::errors::PsResult;

#[derive(Debug)]
struct Mailbox {
    tx: mpsc::UnboundedSender<Envelope>,
    rx: Option<mpsc::UnboundedReceiver<Envelope>>,
}

impl Mailbox {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

#[derive(Debug, Default)]
struct Registry {
    mailboxes: Mutex<HashMap<EntityId, Mailbox>>,
    in_proc_bytes: AtomicU64,
    inter_proc_bytes: AtomicU64,
}

/// Comm bus over tokio channels, for clusters whose clients all live in one
/// OS process. Each client process gets its own handle via
/// [`InProcCommBus::for_client`]; all handles share one set of mailboxes, and
/// sends between different clients count as inter-process traffic.
#[derive(Debug, Clone)]
pub struct InProcCommBus {
    client_id: i32,
    registry: Arc<Registry>,
}

impl InProcCommBus {
    pub fn new(client_id: i32) -> Self {
        Self {
            client_id,
            registry: Arc::new(Registry::default()),
        }
    }

    /// Handle for another client on the same set of mailboxes.
    pub fn for_client(&self, client_id: i32) -> Self {
        Self {
            client_id,
            registry: self.registry.clone(),
        }
    }

    pub fn client_id(&self) -> i32 {
        self.client_id
    }

    pub fn in_proc_bytes(&self) -> u64 {
        self.registry.in_proc_bytes.load(Ordering::Relaxed)
    }

    pub fn inter_proc_bytes(&self) -> u64 {
        self.registry.inter_proc_bytes.load(Ordering::Relaxed)
    }

    fn deliver(&self, from: EntityId, to: EntityId, payload: Bytes) -> PsResult<usize> {
        let num_bytes = payload.len();
        let mut mailboxes = self.registry.mailboxes.lock();
        let mailbox = mailboxes.entry(to).or_insert_with(Mailbox::new);
        mailbox
            .tx
            .send(Envelope { from, payload })
            .map_err(|_| closed_inbox(to))?;
        trace!("bus: {} -> {}, {} bytes", from, to, num_bytes);
        Ok(num_bytes)
    }
}

impl CommBus for InProcCommBus {
    fn register(&self, id: EntityId) -> PsResult<BusInbox> {
        let mut mailboxes = self.registry.mailboxes.lock();
        let mailbox = mailboxes.entry(id).or_insert_with(Mailbox::new);
        let rx = mailbox
            .rx
            .take()
            .ok_or_else(|| PsError::Bus(format!("entity {} registered twice", id)))?;
        Ok(BusInbox::new(id, rx))
    }

    fn send_in_proc(&self, from: EntityId, to: EntityId, payload: Bytes) -> PsResult<usize> {
        let num_bytes = self.deliver(from, to, payload)?;
        self.registry
            .in_proc_bytes
            .fetch_add(num_bytes as u64, Ordering::Relaxed);
        Ok(num_bytes)
    }

    fn send_inter_proc(&self, from: EntityId, to: EntityId, payload: Bytes) -> PsResult<usize> {
        let num_bytes = self.deliver(from, to, payload)?;
        self.registry
            .inter_proc_bytes
            .fetch_add(num_bytes as u64, Ordering::Relaxed);
        Ok(num_bytes)
    }

    fn is_local_entity(&self, id: EntityId) -> bool {
        client_id_of(id) == self.client_id
    }
}
