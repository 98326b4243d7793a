//! Idempotent store mutations for lifecycle events
//!
//! Deliveries are at-least-once and unordered across producers, so every
//! handler must reach the same end state no matter how often, or in which
//! order relative to its counterpart, it runs.

use super::user_events::UserEvent;
use crate::models::UserRef;
use crate::store::{BirthdayStore, StoreError};

/// What a handler did to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    AlreadyPresent,
    Deleted,
    AlreadyAbsent,
}

/// Apply an event to the store
pub async fn dispatch(store: &dyn BirthdayStore, event: &UserEvent) -> Result<Applied, StoreError> {
    match event {
        UserEvent::Created(user) => handle_user_created(store, user).await,
        UserEvent::Deleted(user) => handle_user_deleted(store, user).await,
    }
}

/// Handle userCreated event
///
/// Creates an empty record only when none exists; a redelivery after the
/// birthday was set through the API leaves the record alone.
pub async fn handle_user_created(
    store: &dyn BirthdayStore,
    user: &UserRef,
) -> Result<Applied, StoreError> {
    if store.upsert_if_absent(&user.id, None).await? {
        tracing::info!(user_id = %user.id, "Birthday record created");
        Ok(Applied::Created)
    } else {
        tracing::debug!(user_id = %user.id, "Birthday record already exists");
        Ok(Applied::AlreadyPresent)
    }
}

/// Handle userDeleted event
pub async fn handle_user_deleted(
    store: &dyn BirthdayStore,
    user: &UserRef,
) -> Result<Applied, StoreError> {
    if store.delete_if_present(&user.id).await? {
        tracing::info!(user_id = %user.id, "Birthday record deleted");
        Ok(Applied::Deleted)
    } else {
        tracing::debug!(user_id = %user.id, "No birthday record to delete");
        Ok(Applied::AlreadyAbsent)
    }
}
