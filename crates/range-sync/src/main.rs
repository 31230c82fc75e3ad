use std::process::exit;
use std::time::Duration;

use async_trait::async_trait;
use core_crate::{init_default_logging, BlockHash, Height, HeightRange, SyncError, SyncedBlock};
use rand::Rng;
use structopt::StructOpt;
use sync::{BlockSource, RangeSyncServiceBuilder};
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Debug, StructOpt)]
#[structopt(name = "range-sync", about = "Simulated block range synchronization")]
struct Opt {
    /// First height to sync
    #[structopt(long, default_value = "1", env = "START_HEIGHT")]
    start: u64,

    /// Last height to sync (inclusive)
    #[structopt(long, default_value = "1000", env = "TARGET_HEIGHT")]
    target: u64,

    /// Heights tracked per window
    #[structopt(long, default_value = "128", env = "WINDOW_SIZE")]
    window_size: u64,

    /// Idle timeout of a window in milliseconds
    #[structopt(long, default_value = "2000", env = "TIMEOUT_MS")]
    timeout_ms: u64,

    /// Blocks fetched concurrently
    #[structopt(long, default_value = "16", env = "CONCURRENCY")]
    concurrency: usize,

    /// Consecutive stalls without progress before giving up
    #[structopt(long, default_value = "3", env = "MAX_STALLS")]
    max_stalls: u32,

    /// Probability that a single fetch never answers
    #[structopt(long, default_value = "0.001", env = "STALL_RATE")]
    stall_rate: f64,

    /// Upper bound of the simulated per-block latency in milliseconds
    #[structopt(long, default_value = "20", env = "MAX_LATENCY_MS")]
    max_latency_ms: u64,
}

/// Serves blocks after a random delay and occasionally never answers
#[derive(Debug)]
struct SimulatedSource {
    stall_rate: f64,
    max_latency_ms: u64,
}

#[async_trait]
impl BlockSource for SimulatedSource {
    async fn fetch_block(&self, height: Height) -> Result<SyncedBlock, SyncError> {
        let (latency, stalls) = {
            let mut rng = rand::thread_rng();
            (
                rng.gen_range(0..=self.max_latency_ms),
                rng.gen_bool(self.stall_rate),
            )
        };

        if stalls {
            warn!(height, "Simulated peer stopped answering");
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(Duration::from_millis(latency)).await;

        let payload: [u8; 32] = rand::random();
        Ok(SyncedBlock::new(
            height,
            BlockHash::default(),
            payload.to_vec(),
        ))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file if present
    dotenv::dotenv().ok();

    // Initialize logging
    let _ = init_default_logging();

    // Parse command line arguments
    let opt = Opt::from_args();
    info!("Starting range sync simulation with options: {:?}", opt);

    if !(0.0..=1.0).contains(&opt.stall_rate) {
        error!(stall_rate = opt.stall_rate, "Stall rate must be between 0 and 1");
        exit(1);
    }

    let range = match HeightRange::new(opt.start, opt.target) {
        Ok(range) => range,
        Err(e) => {
            error!(error = %e, "Invalid height range");
            exit(1);
        }
    };

    let service = RangeSyncServiceBuilder::new()
        .with_timeout(Duration::from_millis(opt.timeout_ms))
        .with_window_size(opt.window_size)
        .with_fetch_concurrency(opt.concurrency)
        .with_max_stalls(opt.max_stalls)
        .build()?;

    let source = SimulatedSource {
        stall_rate: opt.stall_rate,
        max_latency_ms: opt.max_latency_ms,
    };

    tokio::select! {
        result = service.sync_range(range, &source) => {
            let report = result?;
            let state = service.pipeline_state().await?;
            info!(
                windows = report.windows,
                attempts = report.attempts,
                stalls = report.stalls,
                blocks = report.blocks_processed,
                highest = ?state.highest_height,
                "Sync complete"
            );
        }
        _ = wait_for_shutdown() => {
            info!(snapshot = ?service.task().snapshot(), "Sync interrupted");
        }
    }

    Ok(())
}

/// Wait for Ctrl+C signal
async fn wait_for_shutdown() {
    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, initiating shutdown...");
        }
        Err(err) => {
            error!("Error waiting for Ctrl+C: {}", err);
        }
    }
}
