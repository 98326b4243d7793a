use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

// ============================================================================
// Birthday Record
// ============================================================================

/// One record per external user id
///
/// `birthday` stays `None` until set through the API; lifecycle events never
/// touch it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Birthday {
    pub id: String,
    pub birthday: Option<NaiveDate>,
}

impl Birthday {
    pub fn new(id: impl Into<String>, birthday: Option<NaiveDate>) -> Self {
        Self {
            id: id.into(),
            birthday,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateBirthdayRequest {
    /// Generated when absent
    pub id: Option<String>,
    pub birthday: Option<NaiveDate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateBirthdayRequest {
    /// `null` clears the date
    pub birthday: Option<NaiveDate>,
}

// ============================================================================
// Event Payloads
// ============================================================================

/// Payload of userCreated / userDeleted, and of birthdayDeleted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
}

// ============================================================================
// Error
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
