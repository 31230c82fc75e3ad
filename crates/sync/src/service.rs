use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use core_crate::{Height, HeightRange, SyncError, SyncedBlock};
use futures::stream::{self, StreamExt};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::RangeSyncConfig;
use crate::pipeline::BlockSyncPipeline;
use crate::task::RangeTask;
use crate::types::PipelineState;

/// A source of blocks, typically a set of peers
#[async_trait]
pub trait BlockSource: Debug + Send + Sync {
    /// Fetch the block at `height`
    async fn fetch_block(&self, height: Height) -> Result<SyncedBlock, SyncError>;
}

/// Summary of a finished sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Number of windows synced
    pub windows: u64,

    /// Number of range task episodes started, including retries
    pub attempts: u64,

    /// Number of episodes stopped by the watchdog
    pub stalls: u64,

    /// Number of blocks fetched and processed.
    ///
    /// A retry after a stall fetches every height from the cursor onward, so
    /// heights that were already stored ahead of the cursor count again.
    pub blocks_processed: u64,
}

/// Synchronizes height ranges window by window.
///
/// Each window is tracked by the service's [`RangeTask`]: blocks are fetched
/// concurrently, pushed through the pipeline and reported done in whatever
/// order they finish. A window that goes quiet for the configured timeout is
/// restarted from the first unfinished height.
///
/// The service owns one range task, so only one sync runs at a time.
#[derive(Debug)]
pub struct RangeSyncService {
    /// Service configuration
    config: RangeSyncConfig,

    /// The block processing pipeline
    pipeline: Arc<dyn BlockSyncPipeline>,

    /// Tracks completion of the current window
    task: RangeTask,
}

impl RangeSyncService {
    /// Create a new RangeSyncService
    pub fn new(config: RangeSyncConfig, pipeline: Box<dyn BlockSyncPipeline>) -> Self {
        info!(
            window_size = config.window_size,
            fetch_concurrency = config.fetch_concurrency,
            "Creating new RangeSyncService"
        );

        let task = RangeTask::new(config.timeout);
        Self {
            config,
            pipeline: Arc::from(pipeline),
            task,
        }
    }

    /// The service configuration
    pub fn config(&self) -> &RangeSyncConfig {
        &self.config
    }

    /// The range task tracking the current window
    pub fn task(&self) -> &RangeTask {
        &self.task
    }

    /// Get the pipeline counters
    pub async fn pipeline_state(&self) -> Result<PipelineState, SyncError> {
        self.pipeline.get_state().await
    }

    /// Sync every height in `range` from `source`.
    ///
    /// Fails with [`SyncError::Stalled`] once a window times out
    /// `max_stalls` times in a row without its cursor moving.
    pub async fn sync_range(
        &self,
        range: HeightRange,
        source: &dyn BlockSource,
    ) -> Result<SyncReport, SyncError> {
        info!(%range, "Starting range sync");

        let mut report = SyncReport::default();
        for window in range.windows(self.config.window_size) {
            self.sync_window(window, source, &mut report).await?;
            report.windows += 1;
        }

        info!(
            %range,
            windows = report.windows,
            attempts = report.attempts,
            stalls = report.stalls,
            blocks = report.blocks_processed,
            "Range sync finished"
        );
        Ok(report)
    }

    async fn sync_window(
        &self,
        window: HeightRange,
        source: &dyn BlockSource,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let mut cursor = window.start();
        let mut stalls = 0;

        loop {
            let pending = HeightRange::new(cursor, window.end())?;
            let (tx, finished) = oneshot::channel();
            self.task.start(pending.start(), pending.end(), move || {
                let _ = tx.send(());
            })?;
            report.attempts += 1;

            report.blocks_processed += self.drive(pending, source, finished).await;

            // The callback does not say why the episode ended; the cursor does.
            let snapshot = self.task.snapshot();
            if snapshot.complete {
                debug!(%window, "Window synced");
                return Ok(());
            }

            report.stalls += 1;
            if snapshot.start == cursor {
                stalls += 1;
            } else {
                stalls = 0;
            }

            warn!(
                %window,
                cursor = snapshot.start,
                stalls,
                "Window stalled, retrying from cursor"
            );

            if stalls >= self.config.max_stalls {
                return Err(SyncError::Stalled {
                    height: snapshot.start,
                    attempts: stalls,
                });
            }
            cursor = snapshot.start;
        }
    }

    /// Fetch and apply `range` until the episode ends. Returns the number of
    /// blocks processed; fetches still in flight are dropped.
    async fn drive(
        &self,
        range: HeightRange,
        source: &dyn BlockSource,
        mut finished: oneshot::Receiver<()>,
    ) -> u64 {
        let mut fetches = stream::iter(range.heights())
            .map(|height| self.fetch_and_apply(height, source))
            .buffer_unordered(self.config.fetch_concurrency);
        let mut processed = 0;

        loop {
            tokio::select! {
                _ = &mut finished => break,
                Some(result) = fetches.next() => {
                    if let Some(height) = result {
                        processed += 1;
                        self.task.done(height);
                    }
                }
            }
        }

        processed
    }

    async fn fetch_and_apply(&self, height: Height, source: &dyn BlockSource) -> Option<Height> {
        let block = match source.fetch_block(height).await {
            Ok(block) => block,
            Err(e) => {
                warn!(height, error = %e, "Failed to fetch block");
                return None;
            }
        };

        if block.height != height {
            warn!(
                requested = height,
                received = block.height,
                "Source returned a block for the wrong height"
            );
            return None;
        }

        match self.pipeline.process_block(block).await {
            Ok(()) => Some(height),
            Err(e) => {
                warn!(height, error = %e, "Failed to process block");
                None
            }
        }
    }
}
