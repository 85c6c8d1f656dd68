//! Fail-open helper for infrastructure side effects
//!
//! Audit writes and workspace cleanup must never change the outcome of a
//! build session. Control decisions (retry, abort, success) never go
//! through here.

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Run an infrastructure operation, logging and swallowing its error
///
/// ```no_run
/// use scforge_core::fail_open::fail_open;
/// use scforge_core::Result;
///
/// async fn append_audit_record() -> Result<()> {
///     Ok(())
/// }
///
/// async fn example() {
///     let written = fail_open("session_store::append", || append_audit_record()).await;
///     assert!(written.is_some());
/// }
/// ```
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}
