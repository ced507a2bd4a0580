//! Logging macros. Every line is prefixed with the identity of the process
//! that printed it, e.g. `(c)` for a coordinator, so interleaved output of a
//! coordinator and its admin tooling stays readable.

use std::sync::OnceLock;

use env_logger::Env;

/// Identity of this process, used as the logging prefix. Unset prints `-`.
pub static ME: OnceLock<String> = OnceLock::new();

/// Shared body of the `pf_*` macros.
#[doc(hidden)]
#[macro_export]
macro_rules! pf_log {
    ($level:ident, $($fmt_args:tt)*) => {
        log::$level!(
            "({}) {}",
            $crate::ME.get().map_or("-", |me| me.as_str()),
            format!($($fmt_args)*)
        )
    };
}

/// Log TRACE message with prefix. Per-record replay chatter goes here.
///
/// Example:
/// ```no_compile
/// pf_trace!("replaying entry {}: {}", entry_id, record);
/// ```
#[macro_export]
macro_rules! pf_trace {
    ($($fmt_args:tt)*) => { $crate::pf_log!(trace, $($fmt_args)*) };
}

/// Log DEBUG message with prefix.
#[macro_export]
macro_rules! pf_debug {
    ($($fmt_args:tt)*) => { $crate::pf_log!(debug, $($fmt_args)*) };
}

/// Log INFO message with prefix. Membership changes are logged at this
/// level.
///
/// Example:
/// ```no_compile
/// pf_info!("enlisted server {}", server_id);
/// ```
#[macro_export]
macro_rules! pf_info {
    ($($fmt_args:tt)*) => { $crate::pf_log!(info, $($fmt_args)*) };
}

/// Log WARN message with prefix.
#[macro_export]
macro_rules! pf_warn {
    ($($fmt_args:tt)*) => { $crate::pf_log!(warn, $($fmt_args)*) };
}

/// Log ERROR message with prefix.
#[macro_export]
macro_rules! pf_error {
    ($($fmt_args:tt)*) => { $crate::pf_log!(error, $($fmt_args)*) };
}

/// Sets up `env_logger` once per process: level from `RUST_LOG`, `info` by
/// default, no timestamps or module paths.
pub fn logger_init() {
    let _ =
        env_logger::Builder::from_env(Env::default().default_filter_or("info"))
            .format_timestamp(None)
            .format_module_path(false)
            .format_target(false)
            .try_init();
}

/// Logs an error and evaluates to an `Err(CohortError)` carrying the same
/// message. Rejected requests go through here.
///
/// Example:
/// ```no_compile
/// return logged_err!("enlist rejected: locator '{}' already in use", loc);
/// ```
#[macro_export]
macro_rules! logged_err {
    ($($fmt_args:tt)*) => {
        {
            $crate::pf_error!($($fmt_args)*);
            Err($crate::CohortError::msg(format!($($fmt_args)*)))
        }
    };
}
