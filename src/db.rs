use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::error::Result;

/// Database connection pool wrapper
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Create a new database connection
    pub async fn new(path: &str) -> Result<Self> {
        let url = format!("sqlite:{}?mode=rwc", path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        Ok(Self { pool })
    }

    /// Private in-memory database, migrated and ready to use.
    ///
    /// Every pooled connection to `sqlite::memory:` would see its own empty
    /// database, so the pool is pinned to one connection.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// Get the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS file_records (
                id TEXT PRIMARY KEY,
                cid TEXT NOT NULL UNIQUE,
                uploader_address TEXT NOT NULL,
                file_size INTEGER NOT NULL,
                is_encrypted INTEGER NOT NULL DEFAULT 0,
                file_name TEXT NOT NULL,
                content_type TEXT NOT NULL DEFAULT 'application/octet-stream',
                metadata TEXT NOT NULL DEFAULT '{}',
                storage_provider TEXT NOT NULL,
                tx_hash TEXT,
                reward_tx_hash TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                retired_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS access_grants (
                id TEXT PRIMARY KEY,
                cid TEXT NOT NULL,
                grantee_address TEXT NOT NULL,
                granter_address TEXT NOT NULL,
                expiry_kind TEXT NOT NULL,
                expires_at INTEGER,
                is_active INTEGER NOT NULL DEFAULT 1,
                revoke_pending INTEGER NOT NULL DEFAULT 0,
                tx_hash TEXT,
                last_event_block INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (cid, grantee_address)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS encryption_keys (
                user_address TEXT PRIMARY KEY,
                key_material TEXT NOT NULL,
                key_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rate_limit_counters (
                bucket_key TEXT PRIMARY KEY,
                window_start INTEGER NOT NULL,
                count INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Create indexes
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_file_records_uploader ON file_records(uploader_address)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_file_records_tx_hash ON file_records(tx_hash)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_file_records_status ON file_records(status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_access_grants_grantee ON access_grants(grantee_address)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_rate_limit_window ON rate_limit_counters(window_start)")
            .execute(&self.pool)
            .await?;

        tracing::info!("Database migrations completed");
        Ok(())
    }
}
