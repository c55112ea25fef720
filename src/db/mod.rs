use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    Row, Sqlite,
    migrate::MigrateDatabase,
    sqlite::{SqlitePool, SqlitePoolOptions},
};

use crate::error::StoreError;
use crate::models::{Poll, PollOption};
use crate::store::{CounterStore, OptionTotal, PollCatalog};

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(db_url: &str) -> Result<Self, StoreError> {
        // Create database if it doesn't exist
        if !Sqlite::database_exists(db_url).await.unwrap_or(false) {
            Sqlite::create_database(db_url).await?;
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?;

        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    // A private in-memory database. One connection, never recycled, since each
    // SQLite memory connection is its own database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::init_schema(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS polls (
                id TEXT PRIMARY KEY,
                question TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS poll_options (
                id TEXT PRIMARY KEY,
                poll_id TEXT NOT NULL,
                text TEXT NOT NULL,
                position INTEGER NOT NULL,
                votes INTEGER NOT NULL DEFAULT 0 CHECK (votes >= 0),
                FOREIGN KEY (poll_id) REFERENCES polls(id) ON DELETE CASCADE
            );
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    // Seed a poll and its options. Administrative, not part of the vote path.
    pub async fn create_poll(&self, poll: &Poll) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO polls (id, question, created_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(&poll.id)
        .bind(&poll.question)
        .bind(poll.created_at.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        for (i, option) in poll.options.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO poll_options (id, poll_id, text, position, votes)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(&option.id)
            .bind(&poll.id)
            .bind(&option.text)
            .bind(i as i64)
            .bind(option.votes)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_poll(&self, poll_id: &str) -> Result<Poll, StoreError> {
        let poll_row = sqlx::query(
            r#"
            SELECT id, question, created_at
            FROM polls
            WHERE id = ?
            "#,
        )
        .bind(poll_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("poll {}", poll_id)))?;

        let created_at_str = poll_row.get::<String, _>("created_at");
        let created_at = DateTime::parse_from_rfc3339(&created_at_str)
            .map_err(|e| StoreError::Unavailable(format!("Failed to parse created_at: {}", e)))?
            .with_timezone(&Utc);

        let options = sqlx::query(
            r#"
            SELECT id, text, votes
            FROM poll_options
            WHERE poll_id = ?
            ORDER BY position
            "#,
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(|row| PollOption {
            id: row.get::<String, _>("id"),
            text: row.get::<String, _>("text"),
            votes: row.get::<i64, _>("votes"),
        })
        .collect();

        Ok(Poll {
            id: poll_row.get::<String, _>("id"),
            question: poll_row.get::<String, _>("question"),
            options,
            created_at,
        })
    }

    pub async fn option_votes(&self, option_id: &str) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT votes FROM poll_options WHERE id = ?")
            .bind(option_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("option {}", option_id)))?;
        Ok(row.get::<i64, _>("votes"))
    }
}

#[async_trait]
impl CounterStore for Database {
    async fn increment_and_get(
        &self,
        option_id: &str,
        delta: i64,
    ) -> Result<OptionTotal, StoreError> {
        // Single statement, so concurrent writers compose to the sum of deltas
        let row = sqlx::query(
            r#"
            UPDATE poll_options
            SET votes = votes + ?
            WHERE id = ?
            RETURNING poll_id, votes
            "#,
        )
        .bind(delta)
        .bind(option_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StoreError::NotFound(format!("option {}", option_id)))?;

        Ok(OptionTotal {
            option_id: option_id.to_string(),
            poll_id: row.get::<String, _>("poll_id"),
            total: row.get::<i64, _>("votes"),
        })
    }
}

#[async_trait]
impl PollCatalog for Database {
    async fn option_in_poll(&self, poll_id: &str, option_id: &str) -> Result<bool, StoreError> {
        let found = sqlx::query("SELECT 1 FROM poll_options WHERE id = ? AND poll_id = ?")
            .bind(option_id)
            .bind(poll_id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        Ok(found)
    }
}
