//! Utility functions and helpers.

mod conn_id;
mod logging;

pub use conn_id::ConnId;
pub use logging::{init_logging, LogFormat};
