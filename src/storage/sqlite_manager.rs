use chrono::{Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime};
use log::{debug, info, warn};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;

use super::aggregation::{bucket_minutes, range_bounds};
use super::migrations::DatabaseMigrations;
use super::models::{
    AggregatedBucket, DailySummary, DailyUsage, DatabaseStats, DeviceRowCount, Reading, StoredReading,
    TIMESTAMP_FORMAT,
};
use crate::config::settings::SqliteConfig;
use crate::utils::error::StoreError;

const DATE_FORMAT: &str = "%Y-%m-%d";

const READING_COLUMNS: &str = "id, timestamp, device_id, voltage, current, power, energy";

/// Append-only time series of meter readings.
///
/// One scheduler writes, any number of API/CLI callers read. WAL mode keeps
/// readers off the writer's lock; `busy_timeout` plus bounded retries in
/// [`SqliteManager::append`] keep a writer from waiting forever.
#[derive(Clone)]
pub struct SqliteManager {
    pool: SqlitePool,
    config: SqliteConfig,
}

fn positive_window(
    amount: i64,
    unit: &str,
    to_delta: fn(i64) -> Option<ChronoDuration>,
) -> Result<ChronoDuration, StoreError> {
    if amount <= 0 {
        return Err(StoreError::InvalidParameter(format!("{} must be positive, got {}", unit, amount)));
    }
    to_delta(amount).ok_or_else(|| StoreError::InvalidParameter(format!("{} {} is out of range", amount, unit)))
}

/// `now - window`, or `InvalidParameter` when that falls off the calendar.
fn cutoff_before_now(window: ChronoDuration, unit: &str, amount: i64) -> Result<NaiveDateTime, StoreError> {
    Local::now()
        .naive_local()
        .checked_sub_signed(window)
        .ok_or_else(|| StoreError::InvalidParameter(format!("{} {} reaches before the earliest date", amount, unit)))
}

fn fmt_ts(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

fn parse_ts(raw: &str) -> Result<NaiveDateTime, StoreError> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .map_err(|e| StoreError::InvalidParameter(format!("bad timestamp '{}': {}", raw, e)))
}

fn parse_date(raw: &str) -> Result<NaiveDate, StoreError> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|e| StoreError::InvalidParameter(format!("bad date '{}': {}", raw, e)))
}

impl SqliteManager {
    pub async fn new(config: SqliteConfig) -> Result<Self, StoreError> {
        if let Some(parent) = Path::new(&config.database_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        info!("🗄️  Initializing SQLite database: {}", config.database_path);

        let options = SqliteConnectOptions::new()
            .filename(&config.database_path)
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))
            .journal_mode(if config.enable_wal {
                SqliteJournalMode::Wal
            } else {
                SqliteJournalMode::Delete
            })
            .synchronous(match config.sync_mode.to_ascii_uppercase().as_str() {
                "OFF" => SqliteSynchronous::Off,
                "FULL" => SqliteSynchronous::Full,
                _ => SqliteSynchronous::Normal,
            })
            .pragma("cache_size", format!("-{}", config.cache_size));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?;

        DatabaseMigrations::run_migrations(&pool).await?;

        info!("✅ SQLite database initialized successfully");
        Ok(Self { pool, config })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn insert_reading(&self, reading: &Reading) -> Result<i64, StoreError> {
        let result = sqlx::query(
            "INSERT INTO readings (timestamp, device_id, voltage, current, power, energy) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(fmt_ts(reading.timestamp))
        .bind(&reading.device_id)
        .bind(reading.voltage)
        .bind(reading.current)
        .bind(reading.active_power)
        .bind(reading.accumulated_energy)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    /// Durably appends one row; returns its sequence id.
    ///
    /// Lock contention is retried `write_retries` times, then reported as
    /// [`StoreError::Busy`]. Other failures return immediately.
    pub async fn append(&self, reading: &Reading) -> Result<i64, StoreError> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match self.insert_reading(reading).await {
                Ok(id) => return Ok(id),
                Err(e) if e.is_contention() && attempts <= self.config.write_retries => {
                    warn!(
                        "⏳ Database busy writing {} (attempt {}/{})",
                        reading.device_id,
                        attempts,
                        self.config.write_retries + 1
                    );
                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                }
                Err(e) if e.is_contention() => return Err(StoreError::Busy { attempts }),
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn query_latest(&self, device_id: &str) -> Result<Option<Reading>, StoreError> {
        let row = sqlx::query_as::<_, StoredReading>(&format!(
            "SELECT {} FROM readings WHERE device_id = ? ORDER BY timestamp DESC, id DESC LIMIT 1",
            READING_COLUMNS
        ))
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Reading::from))
    }

    /// Time-bucketed view of `start..=end` (whole days). Empty buckets are
    /// omitted.
    pub async fn query_range(
        &self,
        device_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<AggregatedBucket>, StoreError> {
        let (lo, hi) = range_bounds(start, end)?;
        let width = bucket_minutes(start, end);
        debug!("Range query {} {}..={} at {} min buckets", device_id, start, end, width);

        let rows = sqlx::query(
            r#"
            SELECT strftime('%Y-%m-%d %H:', timestamp)
                       || printf('%02d', (CAST(strftime('%M', timestamp) AS INTEGER) / ?) * ?)
                       || ':00' AS bucket,
                   AVG(voltage) AS avg_voltage,
                   AVG(current) AS avg_current,
                   MAX(energy) AS max_energy
            FROM readings
            WHERE device_id = ? AND timestamp >= ? AND timestamp < ?
            GROUP BY bucket
            ORDER BY bucket
            "#,
        )
        .bind(width as i64)
        .bind(width as i64)
        .bind(device_id)
        .bind(fmt_ts(lo))
        .bind(fmt_ts(hi))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<AggregatedBucket, StoreError> {
                let bucket: String = row.try_get("bucket")?;
                Ok(AggregatedBucket {
                    bucket_start: parse_ts(&bucket)?,
                    avg_voltage: row.try_get("avg_voltage")?,
                    avg_current: row.try_get("avg_current")?,
                    energy_at_bucket_end: row.try_get("max_energy")?,
                })
            })
            .collect()
    }

    /// Every `skip`-th raw row of the range, counted per device from zero.
    pub async fn query_downsampled(
        &self,
        device_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        skip: u32,
    ) -> Result<Vec<StoredReading>, StoreError> {
        if skip == 0 {
            return Err(StoreError::InvalidParameter("skip must be at least 1".into()));
        }
        let (lo, hi) = range_bounds(start, end)?;

        let rows = sqlx::query_as::<_, StoredReading>(&format!(
            r#"
            SELECT {cols} FROM (
                SELECT {cols}, ROW_NUMBER() OVER (ORDER BY id) - 1 AS seq
                FROM readings
                WHERE device_id = ? AND timestamp >= ? AND timestamp < ?
            )
            WHERE seq % ? = 0
            ORDER BY id
            "#,
            cols = READING_COLUMNS
        ))
        .bind(device_id)
        .bind(fmt_ts(lo))
        .bind(fmt_ts(hi))
        .bind(skip as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn query_since(&self, device_id: &str, since: NaiveDateTime) -> Result<Vec<StoredReading>, StoreError> {
        let rows = sqlx::query_as::<_, StoredReading>(&format!(
            "SELECT {} FROM readings WHERE device_id = ? AND timestamp >= ? ORDER BY timestamp ASC, id ASC",
            READING_COLUMNS
        ))
        .bind(device_id)
        .bind(fmt_ts(since))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Raw rows from the trailing `hours` of wall-clock time.
    pub async fn query_recent(&self, device_id: &str, hours: i64) -> Result<Vec<StoredReading>, StoreError> {
        let window = positive_window(hours, "hours", ChronoDuration::try_hours)?;
        self.query_since(device_id, cutoff_before_now(window, "hours", hours)?).await
    }

    pub async fn purge_before(&self, cutoff: NaiveDateTime) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM readings WHERE timestamp < ?")
            .bind(fmt_ts(cutoff))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn purge_older_than(&self, days: i64) -> Result<u64, StoreError> {
        let window = positive_window(days, "days", ChronoDuration::try_days)?;
        let cutoff = cutoff_before_now(window, "days", days)?;
        let deleted = self.purge_before(cutoff).await?;
        info!("🧹 Cleaned up {} readings older than {} days", deleted, days);
        Ok(deleted)
    }

    pub async fn stats(&self) -> Result<DatabaseStats, StoreError> {
        let totals = sqlx::query("SELECT COUNT(*) AS n, MIN(timestamp) AS first, MAX(timestamp) AS last FROM readings")
            .fetch_one(&self.pool)
            .await?;
        let first: Option<String> = totals.try_get("first")?;
        let last: Option<String> = totals.try_get("last")?;

        let devices = sqlx::query("SELECT device_id, COUNT(*) AS n FROM readings GROUP BY device_id ORDER BY device_id")
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(|row| -> Result<DeviceRowCount, sqlx::Error> {
                Ok(DeviceRowCount {
                    device_id: row.try_get("device_id")?,
                    readings: row.try_get("n")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        Ok(DatabaseStats {
            total_readings: totals.try_get("n")?,
            devices,
            earliest: first.as_deref().map(parse_ts).transpose()?,
            latest: last.as_deref().map(parse_ts).transpose()?,
        })
    }

    /// Per-day figures for one device. Zero rows written while the meter
    /// was offline are left out of the energy delta.
    pub async fn daily_summary(&self, device_id: &str, date: NaiveDate) -> Result<DailySummary, StoreError> {
        let (lo, hi) = range_bounds(date, date)?;
        let row = sqlx::query(
            r#"
            SELECT AVG(ABS(current)) AS avg_current,
                   MAX(CASE WHEN energy > 0 THEN energy END) AS max_energy,
                   MIN(CASE WHEN energy > 0 THEN energy END) AS min_energy
            FROM readings
            WHERE device_id = ? AND timestamp >= ? AND timestamp < ?
            "#,
        )
        .bind(device_id)
        .bind(fmt_ts(lo))
        .bind(fmt_ts(hi))
        .fetch_one(&self.pool)
        .await?;

        let avg_current: Option<f64> = row.try_get("avg_current")?;
        let max_energy: Option<f64> = row.try_get("max_energy")?;
        let min_energy: Option<f64> = row.try_get("min_energy")?;

        Ok(DailySummary {
            device_id: device_id.to_string(),
            date,
            avg_current: avg_current.unwrap_or(0.0),
            energy_used: match (max_energy, min_energy) {
                (Some(max), Some(min)) => max - min,
                _ => 0.0,
            },
            energy_total: max_energy.unwrap_or(0.0),
        })
    }

    pub async fn record_daily_summary(&self, summary: &DailySummary) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT OR REPLACE INTO daily_summaries (device_id, date, avg_current, energy_used, energy_total)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&summary.device_id)
        .bind(summary.date.format(DATE_FORMAT).to_string())
        .bind(summary.avg_current)
        .bind(summary.energy_used)
        .bind(summary.energy_total)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn query_daily_summaries(
        &self,
        device_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailySummary>, StoreError> {
        range_bounds(start, end)?;
        let rows = sqlx::query(
            r#"
            SELECT device_id, date, avg_current, energy_used, energy_total
            FROM daily_summaries
            WHERE device_id = ? AND date >= ? AND date <= ?
            ORDER BY date
            "#,
        )
        .bind(device_id)
        .bind(start.format(DATE_FORMAT).to_string())
        .bind(end.format(DATE_FORMAT).to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<DailySummary, StoreError> {
                let date: String = row.try_get("date")?;
                Ok(DailySummary {
                    device_id: row.try_get("device_id")?,
                    date: parse_date(&date)?,
                    avg_current: row.try_get("avg_current")?,
                    energy_used: row.try_get("energy_used")?,
                    energy_total: row.try_get("energy_total")?,
                })
            })
            .collect()
    }

    /// Energy consumed per calendar day, for weekly and monthly charts.
    pub async fn daily_usage(
        &self,
        device_id: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyUsage>, StoreError> {
        let (lo, hi) = range_bounds(start, end)?;
        let rows = sqlx::query(
            r#"
            SELECT substr(timestamp, 1, 10) AS day, MAX(energy) - MIN(energy) AS used
            FROM readings
            WHERE device_id = ? AND timestamp >= ? AND timestamp < ? AND energy > 0
            GROUP BY day
            ORDER BY day
            "#,
        )
        .bind(device_id)
        .bind(fmt_ts(lo))
        .bind(fmt_ts(hi))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<DailyUsage, StoreError> {
                let day: String = row.try_get("day")?;
                Ok(DailyUsage {
                    date: parse_date(&day)?,
                    energy_used: row.try_get("used")?,
                })
            })
            .collect()
    }

    /// Rewrites negative current/power of one device to absolute values.
    pub async fn correct_reversed_polarity(&self, device_id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE readings SET current = ABS(current), power = ABS(power) WHERE device_id = ? AND (current < 0 OR power < 0)",
        )
        .bind(device_id)
        .execute(&self.pool)
        .await?;
        info!("🔧 Corrected polarity on {} rows for {}", result.rows_affected(), device_id);
        Ok(result.rows_affected())
    }

    pub async fn close(&self) {
        info!("🔒 Closing SQLite database connections");
        self.pool.close().await;
    }
}
