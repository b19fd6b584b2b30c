//! Connection proxying.

mod tcp;

pub use tcp::{
    dial_backend, handle_connection, relay_bidirectional, Direction, RelayDone, TcpProxyError,
    MAX_DIAL_RETRIES,
};
