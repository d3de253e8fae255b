//! ---
//! tach_section: "03-persistence-logging"
//! tach_subsection: "module"
//! tach_type: "source"
//! tach_scope: "code"
//! tach_description: "Structured logging adapters and sinks."
//! tach_version: "v0.0.0-prealpha"
//! tach_owner: "tbd"
//! ---
#[doc(hidden)]
#[macro_export]
macro_rules! __tach_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        $crate::tracing::event!(
            $level,
            scenario = ctx.scenario.unwrap_or(""),
            run_id = ctx.run_id.unwrap_or(""),
            checkpoint = ctx.checkpoint.unwrap_or(""),
            worker = ctx.worker.unwrap_or_default(),
            message = %format_args!($($arg)+)
        );
    }};
}

/// Emit an informational log enriched with run context.
#[macro_export]
macro_rules! tach_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__tach_event!($crate::tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__tach_event!($crate::tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with run context.
#[macro_export]
macro_rules! tach_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__tach_event!($crate::tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__tach_event!($crate::tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a warning enriched with run context.
#[macro_export]
macro_rules! tach_warn {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__tach_event!($crate::tracing::Level::WARN, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__tach_event!($crate::tracing::Level::WARN, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with run context.
#[macro_export]
macro_rules! tach_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::__tach_event!($crate::tracing::Level::ERROR, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::__tach_event!($crate::tracing::Level::ERROR, $crate::LogContext::default(), $($arg)+)
    };
}
