//! Observability utilities.

mod tracing;

pub use self::tracing::{init_tracing, log_transition, try_init_tracing};
