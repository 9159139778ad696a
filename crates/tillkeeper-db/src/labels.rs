//! # Label Requests
//!
//! Receiving a purchase queues one label per unit. Printing happens
//! elsewhere; a full or closed queue loses the request with a warning and
//! the receipt still succeeds.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use tillkeeper_core::LabelRequest;

/// Sending half of the label channel.
#[derive(Debug, Clone, Default)]
pub struct LabelQueue {
    tx: Option<mpsc::Sender<LabelRequest>>,
}

impl LabelQueue {
    /// A bounded queue and its receiving end.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<LabelRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (LabelQueue { tx: Some(tx) }, rx)
    }

    /// A queue that discards everything.
    pub fn disabled() -> Self {
        LabelQueue { tx: None }
    }

    /// Queues `request` without waiting. Returns whether it was accepted.
    pub fn submit(&self, request: LabelRequest) -> bool {
        let Some(tx) = &self.tx else {
            debug!(code = %request.unit_code, "Label queue disabled");
            return false;
        };

        match tx.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(req)) => {
                warn!(code = %req.unit_code, "Label queue full, request dropped");
                false
            }
            Err(TrySendError::Closed(req)) => {
                warn!(code = %req.unit_code, "Label queue closed, request dropped");
                false
            }
        }
    }

    /// Queues every request; returns how many were accepted.
    pub fn submit_all(&self, requests: impl IntoIterator<Item = LabelRequest>) -> usize {
        requests
            .into_iter()
            .map(|r| self.submit(r))
            .filter(|accepted| *accepted)
            .count()
    }
}
