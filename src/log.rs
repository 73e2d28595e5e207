//! Logging/tracing support, hidden behind the `tracing` feature.

#[cfg(feature = "tracing")]
pub(crate) use tracing::debug;
#[cfg(feature = "tracing")]
pub(crate) use tracing::warn;

#[cfg(not(feature = "tracing"))]
macro_rules! debug {
    ($($args:tt)*) => {{
        if false {
            // Make sure to use arguments to prevent "unused" warnings.
            let _ = format_args!($($args)*);
        }
    }};
}

#[cfg(not(feature = "tracing"))]
macro_rules! warn_ {
    ($($args:tt)*) => {{
        if false {
            let _ = format_args!($($args)*);
        }
    }};
}

#[cfg(not(feature = "tracing"))]
pub(crate) use {debug, warn_ as warn};
