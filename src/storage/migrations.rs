use log::info;
use sqlx::SqlitePool;

use crate::utils::error::StoreError;

pub struct DatabaseMigrations;

impl DatabaseMigrations {
    pub async fn run_migrations(pool: &SqlitePool) -> Result<(), StoreError> {
        info!("🔄 Running database migrations");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS migrations (
                id INTEGER PRIMARY KEY,
                version TEXT NOT NULL UNIQUE,
                applied_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
        "#,
        )
        .execute(pool)
        .await?;

        Self::apply(pool, "v1", "readings table", MIGRATION_V1).await?;
        Self::apply(pool, "v2", "daily_summaries table", MIGRATION_V2).await?;

        info!("✅ All migrations completed");
        Ok(())
    }

    async fn apply(pool: &SqlitePool, version: &str, label: &str, statements: &[&str]) -> Result<(), StoreError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM migrations WHERE version = ?)")
            .bind(version)
            .fetch_one(pool)
            .await?;
        if exists {
            return Ok(());
        }

        info!("📦 Applying migration {}: {}", version, label);
        let mut tx = pool.begin().await?;
        for sql in statements {
            sqlx::query(sql).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT INTO migrations (version) VALUES (?)")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn applied_versions(pool: &SqlitePool) -> Result<Vec<String>, StoreError> {
        Ok(sqlx::query_scalar("SELECT version FROM migrations ORDER BY id")
            .fetch_all(pool)
            .await?)
    }
}

const MIGRATION_V1: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS readings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        device_id TEXT NOT NULL,
        voltage REAL NOT NULL,
        current REAL NOT NULL,
        power REAL NOT NULL,
        energy REAL NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_readings_device_time ON readings(device_id, timestamp)",
];

const MIGRATION_V2: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS daily_summaries (
        device_id TEXT NOT NULL,
        date TEXT NOT NULL,
        avg_current REAL NOT NULL,
        energy_used REAL NOT NULL,
        energy_total REAL NOT NULL,
        PRIMARY KEY (device_id, date)
    )
    "#];
