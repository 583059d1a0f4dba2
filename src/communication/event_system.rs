use crate::hardware::{PinChange, PinObserver};
use tokio::sync::mpsc::{Receiver, Sender, channel, error::TrySendError};

/// Tokio-based pin event forwarding.
///
/// Observers run synchronously inside `PinTable::set_state`, so the sender never awaits:
/// a full buffer drops the event with a warning instead of stalling the table.
pub struct PinEventChannel {
    sender: Sender<PinChange>,
}

impl PinEventChannel {
    pub fn new(buffer: usize) -> (Self, Receiver<PinChange>) {
        let (sender, receiver) = channel(buffer);
        (Self { sender }, receiver)
    }
}

impl PinObserver for PinEventChannel {
    fn on_change(&mut self, change: &PinChange) {
        match self.sender.try_send(change.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => {
                tracing::warn!("Pin event buffer full, dropping change on pin {}", dropped.index);
            }
            Err(TrySendError::Closed(_)) => {
                tracing::trace!("Pin event receiver closed");
            }
        }
    }
}
