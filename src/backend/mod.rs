//! Backend health tracking and least-connections selection.

mod pool;
mod prober;

pub use pool::{Backend, BackendError, BackendPool};
pub use prober::HealthProber;
