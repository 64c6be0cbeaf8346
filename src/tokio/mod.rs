//! Tokio runtime integration: one background task per session, plus a pool.

mod conn;
mod driver;
mod pool;
mod stream;

pub use conn::Conn;
pub use pool::{BoxFuture, Connect, Pool, PoolStatus, PooledConn};
pub use stream::Stream;
