//! Request Slot (RS): one per slot index in a tunnel's Request Table.

use crate::egress::{EgressEvent, EgressSocket};
use bytes::Bytes;
use tokio::sync::mpsc;

/// An event forwarded from a slot's egress socket, tagged with the
/// `(idx, tag)` it belongs to so the tunnel's single event loop can route it
/// without the slot holding a back-reference to the tunnel itself.
#[derive(Debug)]
pub struct SlotEvent {
    pub idx: u16,
    pub tag: u16,
    pub event: EgressEvent,
}

/// One position in a `RequestTable`. `tag` is the generation counter: it is
/// bumped (wrapping) on every `free`, so stale peer frames addressed to a
/// reused `idx` with the old `tag` are rejected by `RequestTable::get`.
pub struct RequestSlot {
    pub idx: u16,
    pub tag: u16,
    pub in_use: bool,
    egress: Option<EgressSocket>,
}

impl RequestSlot {
    pub fn new(idx: u16) -> Self {
        Self {
            idx,
            tag: idx,
            in_use: false,
            egress: None,
        }
    }

    /// Precondition: `egress.is_none()`. Initiates the outbound connect;
    /// subsequent egress events arrive on `events`, tagged with this slot's
    /// current `(idx, tag)`.
    pub fn proxy(&mut self, addr: String, events: mpsc::UnboundedSender<SlotEvent>) {
        debug_assert!(self.egress.is_none());
        let idx = self.idx;
        let tag = self.tag;
        let (inner_tx, mut inner_rx) = mpsc::unbounded_channel::<EgressEvent>();
        tokio::spawn(async move {
            while let Some(event) = inner_rx.recv().await {
                if events.send(SlotEvent { idx, tag, event }).is_err() {
                    break;
                }
            }
        });
        self.egress = Some(EgressSocket::connect(addr, inner_tx));
    }

    /// Writes `data` to the egress socket; a no-op if there is none.
    pub fn on_client_data(&self, data: &[u8]) {
        if let Some(egress) = &self.egress {
            egress.write(Bytes::copy_from_slice(data));
        }
    }

    /// Half-closes the egress socket's write side, best-effort.
    pub fn on_client_finished(&self) {
        if let Some(egress) = &self.egress {
            egress.shutdown_write();
        }
    }

    /// Closes the egress socket (if any) and clears it. Invoked exclusively
    /// by the owning `RequestTable`.
    pub fn free(&mut self) {
        if let Some(egress) = self.egress.take() {
            egress.close();
        }
    }
}
