//! Worker pools and the bridge that feeds them from the dispatcher.

mod bridge;
mod pool;

pub use bridge::{
    current_connection, ConnectHandler, CommandHandler, ConnectionErrorHandler, DispatchBridge,
    EchoHandler, HandlerFuture, Handlers, LogErrorHandler, Request,
};
pub use pool::{Task, TaskFuture, TaskKind, TaskPool, WorkerContext, WorkerFilter, WorkerPool};
