//! Per-session virtual-client mailboxes.
//!
//! The tunnel reader pushes `Data` payloads into the mailbox for their
//! client id; the forwarding handler that opened the mailbox drains it in
//! arrival order. An empty chunk, or the table dropping the sender, ends the
//! stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError, UnboundedReceiver, UnboundedSender};

use crate::observability::metrics;
use crate::tunnel::frame::Frame;

#[derive(Debug, Default)]
pub struct MailboxTable {
    boxes: DashMap<u64, UnboundedSender<Bytes>>,
    closed: AtomicBool,
}

impl MailboxTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a mailbox under a fresh random id. Dropping the returned guard
    /// removes it and tells the satellite the client is gone.
    pub fn open(self: &Arc<Self>, outbound: mpsc::Sender<Frame>) -> Mailbox {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = loop {
            let candidate: u64 = rand::random();
            if let dashmap::mapref::entry::Entry::Vacant(slot) = self.boxes.entry(candidate) {
                slot.insert(tx.clone());
                break candidate;
            }
        };
        // Opened after the session ended: nothing will ever answer.
        if self.closed.load(Ordering::SeqCst) {
            let _ = tx.send(Bytes::new());
        }
        metrics::record_virtual_clients(1.0);
        Mailbox {
            id,
            rx,
            table: Arc::clone(self),
            outbound,
        }
    }

    /// Queue a chunk for `id`. False if no such mailbox is open.
    pub fn deliver(&self, id: u64, chunk: Bytes) -> bool {
        match self.boxes.get(&id) {
            Some(tx) => tx.send(chunk).is_ok(),
            None => false,
        }
    }

    /// Push a terminator into every open mailbox, and into any opened later.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let mut terminated = 0;
        for entry in self.boxes.iter() {
            if entry.value().send(Bytes::new()).is_ok() {
                terminated += 1;
            }
        }
        terminated
    }

    pub fn len(&self) -> usize {
        self.boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    fn remove(&self, id: u64) {
        if self.boxes.remove(&id).is_some() {
            metrics::record_virtual_clients(-1.0);
        }
    }
}

/// Receiving end of one virtual client's mailbox.
#[derive(Debug)]
pub struct Mailbox {
    id: u64,
    rx: UnboundedReceiver<Bytes>,
    table: Arc<MailboxTable>,
    outbound: mpsc::Sender<Frame>,
}

impl Mailbox {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next non-empty chunk, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<Bytes> {
        match self.rx.recv().await {
            Some(chunk) if !chunk.is_empty() => Some(chunk),
            _ => None,
        }
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.table.remove(self.id);
        let frame = Frame::Disconnect { client_id: self.id };
        match self.outbound.try_send(frame) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(frame)) => {
                let outbound = self.outbound.clone();
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        let _ = outbound.send(frame).await;
                    });
                }
            }
        }
    }
}
