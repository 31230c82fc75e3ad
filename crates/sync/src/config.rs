use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use core_crate::SyncError;
use tracing::{debug, info};

use crate::ledger::{Ledger, LedgerFactory};
use crate::pipeline::{BlockSyncPipeline, StandardBlockPipeline};
use crate::service::RangeSyncService;

/// Configuration for the range sync service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSyncConfig {
    /// How long a window may go without any reported height before it is
    /// stopped and retried
    pub timeout: Duration,

    /// Number of heights tracked per range task episode
    pub window_size: u64,

    /// Number of blocks fetched concurrently within a window
    pub fetch_concurrency: usize,

    /// Consecutive stalled attempts without progress before giving up
    pub max_stalls: u32,
}

impl Default for RangeSyncConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            window_size: 128,
            fetch_concurrency: 16,
            max_stalls: 3,
        }
    }
}

impl RangeSyncConfig {
    /// Reject settings the service cannot run with
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.window_size == 0 {
            return Err(SyncError::InvalidConfig(
                "window_size must be at least 1".to_string(),
            ));
        }
        if self.fetch_concurrency == 0 {
            return Err(SyncError::InvalidConfig(
                "fetch_concurrency must be at least 1".to_string(),
            ));
        }
        if self.max_stalls == 0 {
            return Err(SyncError::InvalidConfig(
                "max_stalls must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// A builder for the range sync service
///
/// This follows the builder pattern to allow flexible configuration
/// with reasonable defaults.
pub struct RangeSyncServiceBuilder {
    /// The configuration being built
    config: RangeSyncConfig,

    /// Custom pipeline, replacing the standard one
    pipeline: Option<Box<dyn BlockSyncPipeline>>,

    /// Ledger used by the standard pipeline
    ledger: Option<Arc<dyn Ledger>>,
}

impl RangeSyncServiceBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        debug!("Creating new RangeSyncServiceBuilder with default configuration");

        Self {
            config: RangeSyncConfig::default(),
            pipeline: None,
            ledger: None,
        }
    }

    /// Start from an existing configuration
    pub fn with_config(mut self, config: RangeSyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the idle timeout of each window
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        debug!(?timeout, "Setting window timeout");
        self.config.timeout = timeout;
        self
    }

    /// Set the number of heights per window
    pub fn with_window_size(mut self, window_size: u64) -> Self {
        debug!(window_size, "Setting window size");
        self.config.window_size = window_size;
        self
    }

    /// Set the number of concurrent fetches
    pub fn with_fetch_concurrency(mut self, fetch_concurrency: usize) -> Self {
        debug!(fetch_concurrency, "Setting fetch concurrency");
        self.config.fetch_concurrency = fetch_concurrency;
        self
    }

    /// Set the number of consecutive stalls tolerated
    pub fn with_max_stalls(mut self, max_stalls: u32) -> Self {
        debug!(max_stalls, "Setting stall limit");
        self.config.max_stalls = max_stalls;
        self
    }

    /// Set a custom pipeline
    pub fn with_pipeline(mut self, pipeline: Box<dyn BlockSyncPipeline>) -> Self {
        debug!("Setting custom pipeline");
        self.pipeline = Some(pipeline);
        self
    }

    /// Set the ledger the standard pipeline writes to
    pub fn with_ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        debug!("Setting ledger");
        self.ledger = Some(ledger);
        self
    }

    /// Build the range sync service.
    ///
    /// Must be called from within a tokio runtime, which hosts the range
    /// task's watchdog.
    pub fn build(self) -> Result<RangeSyncService, SyncError> {
        self.config.validate()?;
        info!(config = ?self.config, "Building RangeSyncService");

        let pipeline = match self.pipeline {
            Some(pipeline) => pipeline,
            None => {
                let ledger = self
                    .ledger
                    .unwrap_or_else(LedgerFactory::create_memory_ledger);
                Box::new(StandardBlockPipeline::new(ledger))
            }
        };

        Ok(RangeSyncService::new(self.config, pipeline))
    }

    /// Build and return as Arc for shared ownership
    pub fn build_shared(self) -> Result<Arc<RangeSyncService>, SyncError> {
        self.build().map(Arc::new)
    }
}

impl Default for RangeSyncServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}
