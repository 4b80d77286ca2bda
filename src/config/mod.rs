pub mod settings;

pub use settings::{ApiConfig, Config, ConfigOverrides, MeterConfig, ParityConfig, PollConfig, SqliteConfig};
