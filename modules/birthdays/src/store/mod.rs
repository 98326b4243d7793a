//! Record store seam shared by the event consumer and the HTTP routes
//!
//! Implementations provide their own concurrency control; callers never add
//! locking around store calls.

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use crate::models::Birthday;
use async_trait::async_trait;
use chrono::NaiveDate;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

#[async_trait]
pub trait BirthdayStore: Send + Sync {
    /// Insert a record unless one with this id exists
    ///
    /// Returns `true` when a record was created, `false` when the existing one
    /// was left untouched.
    async fn upsert_if_absent(
        &self,
        id: &str,
        birthday: Option<NaiveDate>,
    ) -> Result<bool, StoreError>;

    /// Remove a record; `false` when there was none
    async fn delete_if_present(&self, id: &str) -> Result<bool, StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Birthday>, StoreError>;

    /// All records ordered by id
    async fn list_all(&self) -> Result<Vec<Birthday>, StoreError>;

    /// Set the date of an existing record; `None` when no record has this id
    async fn update_birthday(
        &self,
        id: &str,
        birthday: Option<NaiveDate>,
    ) -> Result<Option<Birthday>, StoreError>;
}
