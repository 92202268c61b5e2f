//! Session metrics
//!
//! - `session_refresh_total` (counter): labels `trigger`, `outcome`
//! - `session_refresh_waiters` (histogram): callers that joined a refresh
//! - `session_forced_logout_total` (counter)
//! - `session_request_retries_total` (counter)
//!
//! Without an installed recorder every call is a no-op.

use crate::policy::RefreshTrigger;

/// Record a finished refresh. `outcome` is `success`, `fatal`, `deferred`,
/// or `abandoned`.
pub fn record_refresh(trigger: RefreshTrigger, outcome: &'static str) {
    metrics::counter!(
        "session_refresh_total",
        "trigger" => trigger.label(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record how many queued callers a refresh resolved.
pub fn record_refresh_waiters(count: usize) {
    metrics::histogram!("session_refresh_waiters").record(count as f64);
}

pub fn record_forced_logout() {
    metrics::counter!("session_forced_logout_total").increment(1);
}

/// Record a request resent after a 401.
pub fn record_request_retry() {
    metrics::counter!("session_request_retries_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_functions_do_not_panic_without_recorder() {
        record_refresh(RefreshTrigger::Reactive, "success");
        record_refresh_waiters(3);
        record_forced_logout();
        record_request_retry();
    }
}
