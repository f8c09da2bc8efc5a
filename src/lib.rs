pub mod github;
pub mod logs;
pub use logs::LogLevel;
/*
 * This file provides the fire-and-forget macros for logging:
 * 1) `log_info!`, `log_warn!`, `log_error!`, `log_critical!` for free-text
 *    messages (markup is stripped before the entry is written).
 * 2) `log_exception!` for recording an error together with its cause chain.
 *
 * Each macro formats its message eagerly, then spawns the append (and the
 * remote archival when `LOG_ARCHIVE_REPO`/`LOG_ARCHIVE_BRANCH` are set) on
 * the current tokio runtime so the calling task is never blocked on I/O.
 * Callers that need the rendered line back should use the functions in
 * `logs` directly.
 */

/// A macro for recording an informational message without awaiting the
/// append. Requires a running tokio runtime.
///
/// # Usage
/// ```ignore
/// log_info!("Order {} accepted", order_id);
/// ```
#[macro_export]
macro_rules! log_info {
    ($($arg:tt)+) => {{
        let message = format!($($arg)+);
        tokio::spawn(async move {
            let _ = $crate::logs::info(&message).await;
        });
    }};
}

/// A macro for recording a warning without awaiting the append.
///
/// # Usage
/// ```ignore
/// log_warn!("Retrying connection to {}", endpoint);
/// ```
#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)+) => {{
        let message = format!($($arg)+);
        tokio::spawn(async move {
            let _ = $crate::logs::warn(&message).await;
        });
    }};
}

/// A macro for recording an error message without awaiting the append.
///
/// # Usage
/// ```ignore
/// log_error!("Payment rejected for order {}", order_id);
/// ```
#[macro_export]
macro_rules! log_error {
    ($($arg:tt)+) => {{
        let message = format!($($arg)+);
        tokio::spawn(async move {
            let _ = $crate::logs::error(&message).await;
        });
    }};
}

/// A macro for recording a critical message without awaiting the append.
///
/// # Usage
/// ```ignore
/// log_critical!("Database unreachable: {}", detail);
/// ```
#[macro_export]
macro_rules! log_critical {
    ($($arg:tt)+) => {{
        let message = format!($($arg)+);
        tokio::spawn(async move {
            let _ = $crate::logs::critical(&message).await;
        });
    }};
}

/// A macro for recording an error value and its cause chain without awaiting
/// the append. The chain is rendered before the task is spawned, so the error
/// itself does not need to cross the task boundary.
///
/// # Usage
/// ```ignore
/// if let Err(e) = restore_backup().await {
///     log_exception!(e);
/// }
/// ```
#[macro_export]
macro_rules! log_exception {
    ($err:expr) => {{
        let message = $crate::logs::error_chain(&$err);
        tokio::spawn(async move {
            let _ = $crate::logs::write(&message, "EXCEPTION").await;
        });
    }};
}
