//! Session side of the relay room.
//!
//! Outbound frames go through an unbounded queue drained by a transport pump.
//! A shared gauge counts the bytes still queued, which is what chunk
//! streaming throttles against.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use limeshare_types::{RelayFrame, RelayMessage};
use tokio::sync::mpsc;

use crate::error::TransferError;

/// A frame waiting for the pump, with the bytes it holds in the gauge.
#[derive(Debug)]
pub struct QueuedFrame {
    pub frame: RelayFrame,
    len: usize,
}

/// Cloneable handle for writing to the relay room.
#[derive(Debug, Clone)]
pub struct RelaySender {
    tx: mpsc::UnboundedSender<QueuedFrame>,
    buffered: Arc<AtomicUsize>,
}

impl RelaySender {
    pub fn send(&self, frame: RelayFrame) -> Result<(), TransferError> {
        let len = frame.wire_len();
        self.buffered.fetch_add(len, Ordering::AcqRel);
        self.tx.send(QueuedFrame { frame, len }).map_err(|rejected| {
            self.buffered.fetch_sub(rejected.0.len, Ordering::AcqRel);
            TransferError::RelayClosed
        })
    }

    pub fn send_control(&self, msg: RelayMessage) -> Result<(), TransferError> {
        self.send(RelayFrame::Control(msg))
    }

    /// Bytes queued but not yet written by the pump.
    pub fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }
}

/// Pump side of a `RelaySender`.
#[derive(Debug)]
pub struct RelayOutbound {
    rx: mpsc::UnboundedReceiver<QueuedFrame>,
    buffered: Arc<AtomicUsize>,
}

impl RelayOutbound {
    pub async fn recv(&mut self) -> Option<QueuedFrame> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<QueuedFrame> {
        self.rx.try_recv().ok()
    }

    /// Release a frame's bytes from the gauge once it left the process.
    pub fn written(&self, queued: &QueuedFrame) {
        self.buffered.fetch_sub(queued.len, Ordering::AcqRel);
    }
}

/// Create a connected sender/pump pair.
pub fn relay_pipe() -> (RelaySender, RelayOutbound) {
    let (tx, rx) = mpsc::unbounded_channel();
    let buffered = Arc::new(AtomicUsize::new(0));
    (
        RelaySender {
            tx,
            buffered: buffered.clone(),
        },
        RelayOutbound { rx, buffered },
    )
}

/// An open relay room as seen by a session task.
///
/// `inbound` yielding `None` means the relay connection is gone.
#[derive(Debug)]
pub struct RelayChannel {
    pub sender: RelaySender,
    pub inbound: mpsc::UnboundedReceiver<RelayFrame>,
}
