//! Persistence queue
//!
//! Decouples history writes from the live relay path. Sessions enqueue
//! with `try_send`; one worker drains the queue into the gateway, so
//! records land in the order the server accepted them. Failures and
//! overflow are logged and the record is dropped.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::store::{ChatRecord, PersistenceGateway};

/// Sending side of the persistence worker
#[derive(Debug, Clone)]
pub struct PersistenceQueue {
    sender: mpsc::Sender<ChatRecord>,
}

impl PersistenceQueue {
    /// Start the worker for `gateway` with room for `capacity` records
    ///
    /// The worker exits once every queue handle is dropped.
    pub fn spawn<P: PersistenceGateway>(gateway: Arc<P>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(gateway, receiver));
        (Self { sender }, worker)
    }

    /// Queue a record without waiting
    pub fn submit(&self, record: ChatRecord) {
        match self.sender.try_send(record) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(record)) => {
                warn!(
                    "Persistence queue full, dropping message from user {} in room {}",
                    record.user_id, record.room_id
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Persistence worker stopped, message not saved");
            }
        }
    }
}

async fn run_worker<P: PersistenceGateway>(gateway: Arc<P>, mut receiver: mpsc::Receiver<ChatRecord>) {
    debug!("Persistence worker started");
    while let Some(record) = receiver.recv().await {
        if let Err(e) = gateway.append(&record).await {
            warn!(
                "Failed to save message from user {} in room {}: {}",
                record.user_id, record.room_id, e
            );
        }
    }
    debug!("Persistence worker stopped");
}
