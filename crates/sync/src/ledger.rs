use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use core_crate::{SyncError, SyncedBlock};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A single key/value write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Bytes,
}

/// Kind of state change recorded by a [`ReceiptLog`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReceiptKind {
    /// A synced block was written to the ledger
    BlockSynced,
}

/// A log entry describing a state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptLog {
    pub kind: ReceiptKind,
    pub data: Bytes,
}

/// The writes and logs produced by applying one record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Receipt {
    pub kv: Vec<KeyValue>,
    pub logs: Vec<ReceiptLog>,
}

#[derive(Serialize)]
struct BlockSyncedLog<'a> {
    height: u64,
    hash: &'a str,
}

/// A trait for ledger operations
///
/// The ledger consumes the results of a sync: every block whose height was
/// reported done has been written through it.
#[async_trait]
pub trait Ledger: Debug + Send + Sync {
    /// Derive the storage key for an identifier within a domain
    fn storage_key(&self, domain: &str, id: &str) -> Vec<u8> {
        format!("mavl-{}-{}", domain, id).into_bytes()
    }

    /// Append key/value writes
    async fn append(&self, kv: &[KeyValue]) -> Result<(), SyncError>;

    /// Append the logs of an applied receipt
    async fn append_logs(&self, logs: &[ReceiptLog]) -> Result<(), SyncError>;

    /// Read the latest value written under a key
    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, SyncError>;
}

/// Build the receipt for storing a synced block
pub fn block_receipt(ledger: &dyn Ledger, block: &SyncedBlock) -> Result<Receipt, SyncError> {
    let key = ledger.storage_key("block", &block.height.to_string());
    let value = Bytes::from(serde_json::to_vec(block)?);

    let hash = block.hash.to_hex();
    let log = serde_json::to_vec(&BlockSyncedLog {
        height: block.height,
        hash: &hash,
    })?;

    Ok(Receipt {
        kv: vec![KeyValue { key, value }],
        logs: vec![ReceiptLog {
            kind: ReceiptKind::BlockSynced,
            data: Bytes::from(log),
        }],
    })
}

/// In-memory ledger implementation
///
/// Keeps the latest value per key, the number of writes it has seen and
/// every receipt log in append order. Useful for testing and simulation; nothing survives a restart.
#[derive(Default)]
pub struct InMemoryLedger {
    entries: Mutex<HashMap<Vec<u8>, Bytes>>,
    writes: Mutex<u64>,
    logs: Mutex<Vec<ReceiptLog>>,
}

impl InMemoryLedger {
    /// Create an empty in-memory ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct keys stored
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing has been stored yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of key/value writes, including overwrites
    pub fn writes(&self) -> u64 {
        *self.writes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receipt logs appended so far, oldest first
    pub fn logs(&self) -> Vec<ReceiptLog> {
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Debug for InMemoryLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryLedger")
            .field("keys", &self.len())
            .field("writes", &self.writes())
            .field(
                "logs",
                &self.logs.lock().unwrap_or_else(PoisonError::into_inner).len(),
            )
            .finish()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn append(&self, kv: &[KeyValue]) -> Result<(), SyncError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        for pair in kv {
            debug!(key = %String::from_utf8_lossy(&pair.key), "Writing ledger entry");
            entries.insert(pair.key.clone(), pair.value.clone());
        }
        *self.writes.lock().unwrap_or_else(PoisonError::into_inner) += kv.len() as u64;
        Ok(())
    }

    async fn append_logs(&self, logs: &[ReceiptLog]) -> Result<(), SyncError> {
        debug!(count = logs.len(), "Appending receipt logs");
        self.logs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(logs);
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Bytes>, SyncError> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }
}

/// Factory for creating ledger instances
#[derive(Debug)]
pub struct LedgerFactory;

impl LedgerFactory {
    /// Create a new in-memory ledger
    pub fn create_memory_ledger() -> Arc<dyn Ledger> {
        Arc::new(InMemoryLedger::new())
    }
}
