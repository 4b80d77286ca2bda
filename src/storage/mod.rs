pub mod aggregation;
pub mod latest_cache;
pub mod migrations;
pub mod models;
pub mod sqlite_manager;

pub use latest_cache::LatestCache;
pub use models::{AggregatedBucket, DailySummary, DailyUsage, DatabaseStats, Reading, StoredReading};
pub use sqlite_manager::SqliteManager;
