/*!
 * Utility functions and helpers for actorlink.
 */
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::timeout;

/// Lock a mutex, recovering the data if a previous holder panicked
///
/// All state guarded this way is left consistent between statements, so a
/// poisoned lock carries no torn data.
pub fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run a future with an optional limit
///
/// `None` waits forever. Returns `None` if the limit expired first; the
/// future is dropped at that point, so nothing it would have done later
/// can still happen.
pub async fn with_optional_limit<F, T>(limit: Option<Duration>, future: F) -> Option<T>
where
    F: Future<Output = T>,
{
    match limit {
        Some(duration) => timeout(duration, future).await.ok(),
        None => Some(future.await),
    }
}

/// Treat a zero duration as "no limit"
pub fn nonzero(duration: Option<Duration>) -> Option<Duration> {
    duration.filter(|d| !d.is_zero())
}

/// Convert milliseconds to an optional limit, where 0 means no limit
pub fn millis_to_limit(millis: u64) -> Option<Duration> {
    nonzero(Some(Duration::from_millis(millis)))
}
