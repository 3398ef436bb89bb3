//! Observability utilities.

mod logging;

pub use logging::{default_directive, init_logging, LogFormat, SpanTimer};
