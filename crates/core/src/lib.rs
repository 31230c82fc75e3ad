// Core module for range synchronization
mod error;
mod logging;
mod types;

// Re-export public API
pub use error::SyncError;
pub use logging::{init_default_logging, init_logging, init_subscriber};
pub use types::{BlockHash, Height, HeightRange, SyncedBlock, Windows};
