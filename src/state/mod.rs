//! Sans-I/O connection state.
//!
//! Nothing in here touches a socket. A [`Session`] is fed received bytes and
//! accumulates bytes to send; the tokio driver moves them between the session
//! and the transport.

pub mod cache;
pub mod queue;
pub mod session;
pub mod startup;

pub use cache::StatementCache;
pub use queue::CommandQueue;
pub use session::{CloseMode, Session, SessionState};
pub use startup::{CancelKey, Handshake, NoHandshake, PgStartup};
