use chrono::{NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Storage and display format for timestamps (second resolution, local clock).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One sample for one device at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: String,
    pub timestamp: NaiveDateTime,
    pub voltage: f64,
    pub current: f64,
    /// Kilowatts.
    pub active_power: f64,
    /// Kilowatt-hours, cumulative.
    pub accumulated_energy: f64,
}

impl Reading {
    /// The quiet-fail sample: all metrics zero, stamped with the tick time.
    pub fn zeroed(device_id: &str, timestamp: NaiveDateTime) -> Self {
        Self {
            device_id: device_id.to_string(),
            timestamp: truncate_to_second(timestamp),
            voltage: 0.0,
            current: 0.0,
            active_power: 0.0,
            accumulated_energy: 0.0,
        }
    }

    pub fn is_zeroed(&self) -> bool {
        self.voltage == 0.0
            && self.current == 0.0
            && self.active_power == 0.0
            && self.accumulated_energy == 0.0
    }
}

/// A persisted row, carrying its sequence id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct StoredReading {
    pub id: i64,
    pub timestamp: NaiveDateTime,
    pub device_id: String,
    pub voltage: f64,
    pub current: f64,
    pub power: f64,
    pub energy: f64,
}

impl From<StoredReading> for Reading {
    fn from(row: StoredReading) -> Self {
        Self {
            device_id: row.device_id,
            timestamp: row.timestamp,
            voltage: row.voltage,
            current: row.current,
            active_power: row.power,
            accumulated_energy: row.energy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedBucket {
    pub bucket_start: NaiveDateTime,
    pub avg_voltage: f64,
    pub avg_current: f64,
    /// Largest (latest) cumulative energy seen in the bucket.
    pub energy_at_bucket_end: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct DailySummary {
    pub device_id: String,
    pub date: NaiveDate,
    pub avg_current: f64,
    pub energy_used: f64,
    pub energy_total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyUsage {
    pub date: NaiveDate,
    pub energy_used: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceRowCount {
    pub device_id: String,
    pub readings: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatabaseStats {
    pub total_readings: i64,
    pub devices: Vec<DeviceRowCount>,
    pub earliest: Option<NaiveDateTime>,
    pub latest: Option<NaiveDateTime>,
}

pub fn truncate_to_second(ts: NaiveDateTime) -> NaiveDateTime {
    ts.with_nanosecond(0).unwrap_or(ts)
}
