//! Compile-time gated debug logging for the resolution path.

/// Emit resolver debug logs only when the `scope_debug_logs` Cargo feature is
/// enabled.
///
/// With the feature disabled (default), this macro compiles to a no-op while
/// still type-checking format arguments.
#[macro_export]
macro_rules! scope_debug_log {
    ($($arg:tt)*) => {{
        #[cfg(feature = "scope_debug_logs")]
        {
            $crate::__log::debug!(target: "mockscope::resolve", $($arg)*);
        }
        #[cfg(not(feature = "scope_debug_logs"))]
        {
            let _ = format_args!($($arg)*);
        }
    }};
}
