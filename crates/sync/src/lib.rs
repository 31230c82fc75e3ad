// Sync module for block range synchronization
//
// This crate tracks completion of height ranges fetched out of order, stops
// ranges that stall, and drives windows of blocks through a pipeline into
// the ledger.

mod config;
mod ledger;
mod pipeline;
mod service;
mod task;
mod types;

// Re-export public API
pub use config::{RangeSyncConfig, RangeSyncServiceBuilder};
pub use ledger::{
    block_receipt, InMemoryLedger, KeyValue, Ledger, LedgerFactory, Receipt, ReceiptKind,
    ReceiptLog,
};
pub use pipeline::{BlockSyncPipeline, DefaultBlockSyncPipeline, StandardBlockPipeline};
pub use service::{BlockSource, RangeSyncService, SyncReport};
pub use task::{RangeSnapshot, RangeTask};
pub use types::PipelineState;
