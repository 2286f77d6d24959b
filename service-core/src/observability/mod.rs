pub mod logging;

pub use logging::{TracingConfig, init_tracing, shutdown_tracing};
