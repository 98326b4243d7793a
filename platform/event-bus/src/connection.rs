//! Broker connection with bounded retry

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{BusError, BusResult, Connector, EventBus};
use std::sync::Arc;

/// Connect to the broker, absorbing transient unavailability
///
/// Each failed attempt is logged with its attempt number and error, then the
/// configured backoff elapses before the next one. Only the terminal
/// [`BusError::RetriesExhausted`] is ever returned; callers decide whether
/// that ends the process.
pub async fn connect_with_retry(
    connector: &dyn Connector,
    retry: &RetryConfig,
) -> BusResult<Arc<dyn EventBus>> {
    let endpoint = connector.endpoint();
    tracing::info!(
        endpoint = %endpoint,
        max_attempts = retry.max_attempts,
        strategy = ?retry.strategy,
        "Connecting to broker"
    );

    retry_with_backoff(|| connector.connect(), retry, "broker_connect")
        .await
        .map_err(|(attempts, last)| {
            tracing::error!(
                endpoint = %endpoint,
                attempts = attempts,
                error = %last,
                "Failed to connect to broker"
            );
            BusError::RetriesExhausted {
                attempts,
                last_error: last.to_string(),
            }
        })
}
