use super::{BirthdayStore, StoreError};
use crate::models::Birthday;
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;

/// PostgreSQL-backed store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a small pool and apply embedded migrations
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        sqlx::migrate!("./db/migrations").run(&pool).await?;
        tracing::info!("Database connected and migrations applied");

        Ok(Self { pool })
    }
}

#[async_trait]
impl BirthdayStore for PgStore {
    async fn upsert_if_absent(
        &self,
        id: &str,
        birthday: Option<NaiveDate>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO birthdays (id, birthday)
            VALUES ($1, $2)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(id)
        .bind(birthday)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete_if_present(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM birthdays WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get(&self, id: &str) -> Result<Option<Birthday>, StoreError> {
        let record =
            sqlx::query_as::<_, Birthday>("SELECT id, birthday FROM birthdays WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(record)
    }

    async fn list_all(&self) -> Result<Vec<Birthday>, StoreError> {
        let records =
            sqlx::query_as::<_, Birthday>("SELECT id, birthday FROM birthdays ORDER BY id")
                .fetch_all(&self.pool)
                .await?;

        Ok(records)
    }

    async fn update_birthday(
        &self,
        id: &str,
        birthday: Option<NaiveDate>,
    ) -> Result<Option<Birthday>, StoreError> {
        let record = sqlx::query_as::<_, Birthday>(
            r#"
            UPDATE birthdays
            SET birthday = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING id, birthday
            "#,
        )
        .bind(id)
        .bind(birthday)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}
