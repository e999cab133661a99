//! Observability for the node process.

mod logging;

pub use logging::{init_logging, LogFormat};
