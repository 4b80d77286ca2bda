//! Power meter logging library
//!
//! Polls two (or more) Modbus RTU power meters sharing one RS485 line at a
//! fixed cadence, stores every sample in SQLite with no gaps, and serves
//! latest values, time-bucketed history and daily summaries over HTTP.

pub mod cli;
pub mod config;
pub mod devices;
pub mod modbus;
pub mod output;
pub mod services;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use devices::{DeviceProfile, MeterClient, PowerMeter, RegisterSpec, WordOrder};
pub use modbus::{ModbusClient, ModbusClientTrait};
pub use output::{ConsoleFormatter, CsvFormatter, DataFormatter, HexFormatter, JsonFormatter};
pub use services::{PollScheduler, SchedulerHandle};
pub use storage::{DatabaseStats, LatestCache, Reading, SqliteManager};
pub use utils::error::{InitError, ModbusError, ReadError, StoreError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
