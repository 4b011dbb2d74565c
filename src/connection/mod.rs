//! Connection entries and the registry that owns them.
//!
//! ```text
//!   ConnectionRegistry
//!   ├── free:   RwLock<Vec<slot>>      acquire pops, release pushes
//!   ├── active: RwLock<Vec<slot>>      activate pushes, release removes
//!   └── slots:  [Arc<ConnectionEntry>; capacity]
//!                  └── Mutex<ConnInner>
//!                        request / data / wait / abort / buffer / error queues
//!                        entry + wait free lists
//! ```

mod buffer_pool;
mod entry;
mod free_list;
mod registry;

pub use buffer_pool::BufferPool;
pub use entry::{
    BoxedWriter, ConnInner, ConnStatus, ConnectionEntry, ConnectionHandle, ConnectionSummary,
    EntryStatus, QueueEntry, SocketId, UserBuffer, WaitEntry,
};
pub use free_list::{FreeList, Recycle};
pub use registry::{ConnectionRegistry, RegistrySnapshot, CLIENT_ID_MAX};
