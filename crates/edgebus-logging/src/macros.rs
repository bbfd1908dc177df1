//! ---
//! eb_section: "03-logging"
//! eb_subsection: "module"
//! eb_type: "source"
//! eb_scope: "code"
//! eb_description: "Message-context logging adapters."
//! eb_version: "v0.0.0-prealpha"
//! eb_owner: "tbd"
//! ---
/// Emit an event at the given level enriched with a [`MessageContext`](crate::MessageContext).
#[macro_export]
macro_rules! bus_event {
    ($level:expr, context = $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            $level,
            protocol = ctx.protocol.unwrap_or(""),
            topic = ctx.topic.unwrap_or(""),
            correlation_id = ctx.correlation_id.unwrap_or(""),
            route = ctx.route.unwrap_or(""),
            message = %format_args!($($arg)+)
        );
    }};
    ($level:expr, $($arg:tt)+) => {{
        $crate::bus_event!($level, context = $crate::MessageContext::default(), $($arg)+)
    }};
}

/// Emit a debug log enriched with message context.
#[macro_export]
macro_rules! bus_debug {
    ($($arg:tt)+) => {
        $crate::bus_event!(tracing::Level::DEBUG, $($arg)+)
    };
}

/// Emit an informational log enriched with message context.
#[macro_export]
macro_rules! bus_info {
    ($($arg:tt)+) => {
        $crate::bus_event!(tracing::Level::INFO, $($arg)+)
    };
}

/// Emit a warning log enriched with message context.
#[macro_export]
macro_rules! bus_warn {
    ($($arg:tt)+) => {
        $crate::bus_event!(tracing::Level::WARN, $($arg)+)
    };
}

/// Emit an error log enriched with message context.
#[macro_export]
macro_rules! bus_error {
    ($($arg:tt)+) => {
        $crate::bus_event!(tracing::Level::ERROR, $($arg)+)
    };
}
