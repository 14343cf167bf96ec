//! Bounded waits for every call that leaves the process.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{Result, ReviewError};

/// Per-collaborator deadlines.
#[derive(Debug, Clone, Copy)]
pub struct Deadlines {
    pub store: Duration,
    pub analysis: Duration,
    pub generator: Duration,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self {
            store: Duration::from_secs(10),
            analysis: Duration::from_secs(60),
            generator: Duration::from_secs(30),
        }
    }
}

/// Run `fut` under `limit`. Dropping the inner future on expiry aborts the call.
pub async fn within<T, F>(limit: Duration, operation: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(operation, seconds = limit.as_secs(), "deadline exceeded");
            Err(ReviewError::Timeout {
                operation: operation.to_string(),
                seconds: limit.as_secs(),
            })
        }
    }
}
