//! Single-slot permission inbox: the one place the loop blocks on a
//! human decision.

use codewright_core::{CancellationToken, PermissionReply};
use std::sync::{Mutex, mpsc};
use std::time::Duration;

/// How often the waiting side re-checks the cancellation token.
const WAIT_SLICE: Duration = Duration::from_millis(50);

/// A single-slot buffered channel between the loop (waiting) and the
/// caller (answering). One outstanding question at a time: permission
/// checks are strictly sequential, so a capacity of one is exact, and a
/// stray second answer is dropped rather than queued against a future
/// question.
pub struct PermissionGate {
    tx: mpsc::SyncSender<PermissionReply>,
    rx: Mutex<mpsc::Receiver<PermissionReply>>,
}

impl PermissionGate {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::sync_channel(1);
        Self {
            tx,
            rx: Mutex::new(rx),
        }
    }

    /// Deliver the caller's answer to the pending permission request.
    pub fn answer(&self, reply: PermissionReply) {
        let _ = self.tx.try_send(reply);
    }

    /// Block until an answer arrives or the token is cancelled.
    /// `None` means cancelled.
    pub(crate) fn wait(&self, cancel: &CancellationToken) -> Option<PermissionReply> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            let Ok(receiver) = self.rx.lock() else {
                return None;
            };
            match receiver.recv_timeout(WAIT_SLICE) {
                Ok(reply) => return Some(reply),
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => return None,
            }
        }
    }
}

impl Default for PermissionGate {
    fn default() -> Self {
        Self::new()
    }
}
