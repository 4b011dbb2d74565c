//! Connection and request-dispatch layer of a database server.
//!
//! Clients connect over TCP, announce a client class and exchange framed
//! packets (22-byte header plus optional payload). The server admits each
//! client into a fixed slot, queues its packets per request id and hands
//! commands to a partitioned worker pool. An HA role machine gates
//! admission and write access, and shutdown drains workers in two phases.
//!
//! ```text
//!   accept ─► admission ─► ConnectionEntry ─► dispatcher ─► queues
//!                                                  │
//!                 worker pool ◄── dispatch bridge ◄┘
//!                     │
//!                 receive_command / receive_data ─► send_reply
//! ```

pub mod admission;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod ha;
pub mod observability;
pub mod protocol;
pub mod receive;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod transport;
pub mod worker;

#[cfg(test)]
mod verification;

pub use admission::{AdmissionController, AdmissionRule, ClientClass, RuleKind};
pub use config::ServerConfig;
pub use connection::{ConnectionEntry, ConnectionHandle, ConnectionRegistry};
pub use error::{ConfigError, ConnError};
pub use ha::{HaController, HaState};
pub use protocol::{ConnectReason, Frame, NetHeader, PacketCodec, PacketType};
pub use receive::{ConnectionRef, DataPacket, RequestHeader};
pub use server::Server;
pub use session::{TransactionManager, TransactionTable};
pub use shutdown::{ShutdownCoordinator, ShutdownReport};
pub use transport::{open_client, ClientConnection, Reply};
pub use worker::{CommandHandler, DispatchBridge, Handlers, TaskPool, WorkerPool};
