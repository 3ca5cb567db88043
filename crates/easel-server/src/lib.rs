//! # easel-server
//!
//! Connection core of the drawing server: per-connection state, session
//! membership, outbound batching, and the tokio driver that moves bytes
//! between sockets and queues.

pub mod batcher;
pub mod connection;
pub mod dispatch;
pub mod driver;
pub mod membership;
pub mod output;
pub mod registry;
pub mod server;
pub mod session;

pub use batcher::{flush, flush_all, FlushReport, FlushSummary};
pub use connection::{AccessLevel, Connection, ConnectionState, ProtocolLayer, SyncTarget};
pub use dispatch::Hub;
pub use membership::{Membership, SessionData};
pub use output::OutputBuffer;
pub use registry::{ConnectionHandle, ConnectionRegistry, RegistryConfig};
pub use server::{start, ServerHandle};
pub use session::{Session, SessionRegistry};
