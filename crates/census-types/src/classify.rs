//! Deadlock-class error detection.
//!
//! Storage engines abort one side of a cyclic lock wait and report it with
//! an engine-specific code. Those failures are transient: running the same
//! work again usually succeeds. Everything else is not retried.
//!
//! | Engine | Code | Meaning |
//! |--------|------|---------|
//! | `PostgreSQL` | `40P01` | `deadlock_detected` |
//! | `PostgreSQL` | `55P03` | `lock_not_available` (`lock_timeout` expired) |
//! | `MySQL` | `1213` / `ER_LOCK_DEADLOCK` | deadlock found when trying to get lock |
//! | `MySQL` | `1205` / `ER_LOCK_WAIT_TIMEOUT` | lock wait timeout exceeded |

/// Error codes reported for engine deadlocks and lock-wait timeouts.
const DEADLOCK_CODES: &[&str] = &[
    "40P01",
    "55P03",
    "1213",
    "1205",
    "ER_LOCK_DEADLOCK",
    "ER_LOCK_WAIT_TIMEOUT",
];

/// Message fragments that identify a deadlock when no code is available.
const DEADLOCK_MESSAGES: &[&str] = &[
    "Deadlock found",
    "deadlock detected",
    "Lock wait timeout exceeded",
];

/// An error that can tell whether it reports a storage-engine deadlock.
///
/// The retry executor only retries errors for which [`is_deadlock`]
/// returns `true`; all other errors surface to the caller unmodified.
///
/// [`is_deadlock`]: DeadlockClassify::is_deadlock
pub trait DeadlockClassify {
    /// Whether this error is a deadlock or lock-wait timeout.
    fn is_deadlock(&self) -> bool;
}

/// Classify a raw engine error from its code and message.
///
/// Either signal is sufficient: drivers that lose the code still carry
/// the engine's message text.
pub fn is_deadlock_signal(code: Option<&str>, message: &str) -> bool {
    if code.is_some_and(|c| DEADLOCK_CODES.contains(&c)) {
        return true;
    }
    DEADLOCK_MESSAGES.iter().any(|m| message.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn postgres_deadlock_code() {
        assert!(is_deadlock_signal(Some("40P01"), "whatever"));
        assert!(is_deadlock_signal(Some("55P03"), ""));
    }

    #[test]
    fn mysql_errno_and_symbol() {
        assert!(is_deadlock_signal(Some("1213"), ""));
        assert!(is_deadlock_signal(Some("ER_LOCK_WAIT_TIMEOUT"), ""));
    }

    #[test]
    fn message_without_code() {
        assert!(is_deadlock_signal(
            None,
            "Deadlock found when trying to get lock; try restarting transaction"
        ));
        assert!(is_deadlock_signal(None, "Lock wait timeout exceeded"));
        assert!(is_deadlock_signal(None, "ERROR: deadlock detected"));
    }

    #[test]
    fn unrelated_errors_are_not_deadlocks() {
        assert!(!is_deadlock_signal(Some("23505"), "duplicate key value"));
        assert!(!is_deadlock_signal(None, "connection refused"));
    }
}
