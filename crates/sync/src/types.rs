use core_crate::Height;

/// Counters kept by a block sync pipeline
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineState {
    /// The number of blocks written to the ledger
    pub blocks_processed: u64,

    /// The number of blocks that failed validation
    pub blocks_rejected: u64,

    /// The number of receipt logs emitted
    pub receipt_logs: u64,

    /// The highest height written so far
    pub highest_height: Option<Height>,
}
