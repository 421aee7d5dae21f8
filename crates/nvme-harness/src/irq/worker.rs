//! Bottom-half worker: a single thread draining a bounded work queue.

use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::error::{Error, Result};

use super::IrqShared;

pub(super) enum Work {
    Fired(u16),
    /// Acknowledged once everything queued before it has run.
    Flush(SyncSender<()>),
}

pub(super) struct Worker {
    handle: JoinHandle<()>,
}

impl Worker {
    /// Start the worker. The returned sender is the only one; the thread exits
    /// once it and all its clones are dropped.
    pub fn spawn(shared: Arc<IrqShared>, depth: usize) -> Result<(Worker, SyncSender<Work>)> {
        let (tx, rx) = mpsc::sync_channel(depth);
        let handle = thread::Builder::new()
            .name("nvme-irq-bh".into())
            .spawn(move || run(shared, rx))
            .map_err(|err| Error::ResourceExhausted(format!("interrupt worker: {err}")))?;
        Ok((Worker { handle }, tx))
    }

    pub fn join(self) {
        if self.handle.join().is_err() {
            warn!("interrupt worker panicked");
        }
    }
}

fn run(shared: Arc<IrqShared>, rx: Receiver<Work>) {
    for work in rx {
        match work {
            Work::Fired(line) => shared.bottom_half(line),
            Work::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("interrupt worker stopped");
}

pub(super) fn flush(tx: &SyncSender<Work>) -> Result<()> {
    let (ack_tx, ack_rx) = mpsc::sync_channel(1);
    tx.send(Work::Flush(ack_tx))
        .map_err(|_| Error::ProtocolViolation("interrupt worker is not running".into()))?;
    ack_rx
        .recv()
        .map_err(|_| Error::ProtocolViolation("interrupt worker stopped during flush".into()))
}
