//! Transfer progress reporting

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Which way a transfer flows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    Outbound,
    Inbound,
}

/// Transfer lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    Started,
    InProgress,
    Completed,
    /// Checksum or validation failure
    Failed,
    /// Session closed before the transfer finished
    Aborted,
}

/// Snapshot handed to progress callbacks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    pub transfer_id: u64,
    pub direction: TransferDirection,
    pub filename: String,
    pub status: TransferStatus,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub chunks_done: u64,
    pub chunks_total: u64,
}

impl TransferProgress {
    /// Completion percentage (100 for an empty file)
    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            return 100.0;
        }
        self.bytes_done as f64 / self.bytes_total as f64 * 100.0
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Aborted
        )
    }
}

pub type ProgressCallback = Arc<dyn Fn(&TransferProgress) + Send + Sync>;

/// Callbacks keyed by transfer id, plus callbacks for every transfer
#[derive(Clone, Default)]
pub struct ProgressRegistry {
    per_transfer: Arc<DashMap<u64, Vec<ProgressCallback>>>,
    global: Arc<RwLock<Vec<ProgressCallback>>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, transfer_id: u64, callback: ProgressCallback) {
        self.per_transfer
            .entry(transfer_id)
            .or_default()
            .push(callback);
    }

    pub fn register_global(&self, callback: ProgressCallback) {
        self.global.write().push(callback);
    }

    /// Deliver `progress` to every interested callback.
    ///
    /// Callbacks run without any registry lock held, so they may register
    /// further callbacks. Per-transfer callbacks are dropped once the transfer
    /// finishes.
    pub fn notify(&self, progress: &TransferProgress) {
        let mut callbacks: Vec<ProgressCallback> = self.global.read().clone();
        if progress.is_finished() {
            if let Some((_, registered)) = self.per_transfer.remove(&progress.transfer_id) {
                callbacks.extend(registered);
            }
        } else if let Some(registered) = self.per_transfer.get(&progress.transfer_id) {
            callbacks.extend(registered.iter().cloned());
        }

        for callback in callbacks {
            callback(progress);
        }
    }

    pub fn pending_transfers(&self) -> usize {
        self.per_transfer.len()
    }
}

impl std::fmt::Debug for ProgressRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressRegistry")
            .field("per_transfer", &self.per_transfer.len())
            .field("global", &self.global.read().len())
            .finish()
    }
}
