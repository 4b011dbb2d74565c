//! Bridge from the dispatcher to the worker pools.
//!
//! A new connection gets one long-running task on the connection pool.
//! Every queued command gets one task on the request pool, partitioned by
//! slot index so the commands of one connection land on the same
//! partition. The pending-request counter is raised at submission and
//! lowered when the task ends, however it ends.

use super::pool::{Task, TaskKind, WorkerPool};
use crate::admission::ClientClass;
use crate::connection::{ConnectionEntry, ConnectionHandle};
use crate::error::ConnError;
use crate::receive::{ConnectionRef, DataPacket, RequestHeader};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn, Instrument};

tokio::task_local! {
    static CURRENT_CONNECTION: Arc<ConnectionEntry>;
}

/// Connection bound to the running worker task, if any.
pub fn current_connection() -> Option<Arc<ConnectionEntry>> {
    CURRENT_CONNECTION.try_with(|conn| conn.clone()).ok()
}

/// A dequeued command with its data frame.
#[derive(Debug)]
pub struct Request {
    pub header: RequestHeader,
    pub data: Option<DataPacket>,
}

pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ConnError>> + Send + 'a>>;

/// Serves one command. Replies go out through the connection's send
/// helpers, which stop working once the client is gone.
pub trait CommandHandler: Send + Sync {
    fn handle<'a>(&'a self, conn: &'a ConnectionRef, request: Request) -> HandlerFuture<'a>;

    /// Shutdown drains log-writer tasks last.
    fn task_kind(&self, class: ClientClass, _function_code: Option<u16>) -> TaskKind {
        if class.is_log_writer() {
            TaskKind::LogWriter
        } else {
            TaskKind::Normal
        }
    }
}

/// Called when a connection-level error ends or fails a task.
pub trait ConnectionErrorHandler: Send + Sync {
    fn on_error(&self, conn: &ConnectionEntry, err: &ConnError);
}

/// Called once after the handshake, before the connection is served.
pub trait ConnectHandler: Send + Sync {
    fn on_connect(&self, conn: &ConnectionEntry) -> Result<(), ConnError>;
}

/// Replies to each command with its own data, or an empty reply.
#[derive(Debug, Default)]
pub struct EchoHandler;

impl CommandHandler for EchoHandler {
    fn handle<'a>(&'a self, conn: &'a ConnectionRef, request: Request) -> HandlerFuture<'a> {
        Box::pin(async move {
            let payload = request.data.map(|d| d.payload).unwrap_or_default();
            conn.send_reply(request.header.request_id, &payload).await
        })
    }
}

#[derive(Debug, Default)]
pub struct LogErrorHandler;

impl ConnectionErrorHandler for LogErrorHandler {
    fn on_error(&self, conn: &ConnectionEntry, err: &ConnError) {
        warn!(conn = conn.index(), client_id = conn.client_id(), error = %err, "connection error");
    }
}

/// Registered hooks.
#[derive(Clone)]
pub struct Handlers {
    pub connect: Option<Arc<dyn ConnectHandler>>,
    pub command: Arc<dyn CommandHandler>,
    pub error: Arc<dyn ConnectionErrorHandler>,
}

impl Default for Handlers {
    fn default() -> Self {
        Handlers {
            connect: None,
            command: Arc::new(EchoHandler),
            error: Arc::new(LogErrorHandler),
        }
    }
}

impl Handlers {
    pub fn with_command(mut self, handler: Arc<dyn CommandHandler>) -> Self {
        self.command = handler;
        self
    }

    pub fn with_error(mut self, handler: Arc<dyn ConnectionErrorHandler>) -> Self {
        self.error = handler;
        self
    }

    pub fn with_connect(mut self, handler: Arc<dyn ConnectHandler>) -> Self {
        self.connect = Some(handler);
        self
    }
}

/// Lowers the pending-request counter when the task is done or dropped.
struct PendingGuard {
    conn: Arc<ConnectionEntry>,
    handle: ConnectionHandle,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if self.conn.is_current(self.handle) {
            self.conn.finish_request();
        }
    }
}

pub struct DispatchBridge {
    connection_pool: Arc<dyn WorkerPool>,
    request_pool: Arc<dyn WorkerPool>,
    handlers: Handlers,
}

impl DispatchBridge {
    pub fn new(
        connection_pool: Arc<dyn WorkerPool>,
        request_pool: Arc<dyn WorkerPool>,
        handlers: Handlers,
    ) -> Self {
        DispatchBridge {
            connection_pool,
            request_pool,
            handlers,
        }
    }

    pub fn handlers(&self) -> &Handlers {
        &self.handlers
    }

    pub fn connection_pool(&self) -> &Arc<dyn WorkerPool> {
        &self.connection_pool
    }

    pub fn request_pool(&self) -> &Arc<dyn WorkerPool> {
        &self.request_pool
    }

    /// Run `serve` as the connection's handler task.
    pub fn submit_connection_task<F, Fut>(
        &self,
        conn: &Arc<ConnectionEntry>,
        serve: F,
    ) -> Result<(), ConnError>
    where
        F: FnOnce(Arc<ConnectionEntry>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = conn.handle();
        let kind = self.handlers.command.task_kind(conn.client_class(), None);
        let conn = conn.clone();
        let index = conn.index();
        let task = Task::new(kind, move |_ctx| {
            CURRENT_CONNECTION.scope(conn.clone(), serve(conn))
        })
        .for_connection(handle);
        self.connection_pool.submit(index, task)
    }

    /// Queue a task that serves the oldest queued command.
    pub fn submit_command_task(&self, conn: &Arc<ConnectionEntry>) -> Result<(), ConnError> {
        conn.begin_request();
        let handle = conn.handle();
        let guard = PendingGuard {
            conn: conn.clone(),
            handle,
        };
        let kind = self
            .handlers
            .command
            .task_kind(conn.client_class(), conn.peek_command());
        let handlers = self.handlers.clone();
        let span = tracing::debug_span!("command", conn = conn.index(), client_id = conn.client_id());

        let task = Task::new(kind, move |_ctx| {
            let conn = ConnectionRef::new(guard.conn.clone(), handle);
            CURRENT_CONNECTION.scope(
                guard.conn.clone(),
                async move {
                    run_command(&conn, &handlers).await;
                    drop(guard);
                }
                .instrument(span),
            )
        })
        .for_connection(handle);

        // A rejected task is dropped with its guard, lowering the counter.
        self.request_pool.submit(conn.index(), task)
    }
}

async fn run_command(conn: &ConnectionRef, handlers: &Handlers) {
    let header = match conn.receive_command() {
        Ok(header) => header,
        Err(ConnError::NoDataAvailable) => return,
        Err(ConnError::ConnectionClosed) => {
            debug!(conn = conn.index(), "command task for a closed connection skipped");
            return;
        }
        Err(e) => {
            handlers.error.on_error(conn.entry(), &e);
            return;
        }
    };
    let rid = header.request_id;

    let result = async {
        let data = if header.buffer_size > 0 {
            Some(conn.receive_data(rid, None).await?)
        } else {
            None
        };
        handlers.command.handle(conn, Request { header, data }).await
    }
    .await;

    if let Err(e) = result {
        if !conn.is_current() {
            debug!(conn = conn.index(), rid, error = %e, "client gone before reply");
            return;
        }
        handlers.error.on_error(conn.entry(), &e);
        if e.is_fatal_for_connection() {
            conn.end_request();
        } else if let Err(send_err) = conn.send_error(rid, e.status_code(), &[]).await {
            debug!(conn = conn.index(), rid, error = %send_err, "error reply failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnStatus;
    use crate::dispatch::queue_frame;
    use crate::protocol::{Frame, FrameReader, NetHeader, PacketCodec, PacketType};
    use crate::worker::TaskPool;
    use bytes::BytesMut;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn open_conn() -> Arc<ConnectionEntry> {
        let conn = Arc::new(ConnectionEntry::new(1, 4));
        conn.with_lock(|c| c.status = ConnStatus::Open);
        conn
    }

    fn bridge(handlers: Handlers) -> DispatchBridge {
        let connection_pool = Arc::new(TaskPool::new("conn", 2, 1));
        let request_pool = Arc::new(TaskPool::new("req", 2, 2));
        connection_pool.start_all();
        request_pool.start_all();
        DispatchBridge::new(connection_pool, request_pool, handlers)
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(u16, u16, Vec<u8>, bool)>>,
    }

    impl CommandHandler for Recorder {
        fn handle<'a>(&'a self, _conn: &'a ConnectionRef, request: Request) -> HandlerFuture<'a> {
            Box::pin(async move {
                let bound = current_connection().is_some();
                let bytes = request.data.map(|d| d.payload.to_vec()).unwrap_or_default();
                self.seen.lock().push((
                    request.header.request_id,
                    request.header.function_code,
                    bytes,
                    bound,
                ));
                Ok(())
            })
        }
    }

    #[derive(Default)]
    struct CountingErrors(Mutex<Vec<i32>>);

    impl ConnectionErrorHandler for CountingErrors {
        fn on_error(&self, _conn: &ConnectionEntry, err: &ConnError) {
            self.0.lock().push(err.status_code());
        }
    }

    async fn wait_idle(conn: &ConnectionEntry) {
        for _ in 0..200 {
            if conn.pending_requests() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pending requests never drained");
    }

    #[tokio::test]
    async fn test_command_task_runs_handler_with_data() {
        let recorder = Arc::new(Recorder::default());
        let bridge = bridge(Handlers::default().with_command(recorder.clone()));
        let conn = open_conn();

        queue_frame(&conn, Frame::header_only(NetHeader::command(1, 30, 3)));
        queue_frame(&conn, Frame::new(NetHeader::data(1, 3), BytesMut::from(&b"abc"[..])));
        bridge.submit_command_task(&conn).unwrap();
        wait_idle(&conn).await;

        let seen = recorder.seen.lock();
        assert_eq!(seen.as_slice(), &[(1, 30, b"abc".to_vec(), true)]);
    }

    #[tokio::test]
    async fn test_overflowed_data_goes_to_error_handler() {
        let errors = Arc::new(CountingErrors::default());
        let bridge = bridge(Handlers::default().with_error(errors.clone()));
        let conn = open_conn();

        queue_frame(&conn, Frame::header_only(NetHeader::command(2, 30, 8)));
        let mut overflow = Frame::header_only(NetHeader::data(2, 8));
        overflow.overflowed = true;
        queue_frame(&conn, overflow);

        bridge.submit_command_task(&conn).unwrap();
        wait_idle(&conn).await;
        assert_eq!(errors.0.lock().as_slice(), &[-4]);
    }

    #[tokio::test]
    async fn test_connection_task_binds_connection() {
        let bridge = bridge(Handlers::default());
        let conn = open_conn();
        let (tx, rx) = tokio::sync::oneshot::channel();
        bridge
            .submit_connection_task(&conn, move |c| async move {
                let bound = current_connection().map(|cur| cur.index());
                let _ = tx.send((bound, c.index()));
            })
            .unwrap();
        assert_eq!(rx.await.unwrap(), (Some(1), 1));
    }

    /// Holds the request until released, then tries to answer it.
    struct HeldReply {
        release: Mutex<Option<tokio::sync::oneshot::Receiver<()>>>,
        outcome: Mutex<Option<tokio::sync::oneshot::Sender<Result<(), ConnError>>>>,
    }

    impl CommandHandler for HeldReply {
        fn handle<'a>(&'a self, conn: &'a ConnectionRef, request: Request) -> HandlerFuture<'a> {
            Box::pin(async move {
                let release = self.release.lock().take();
                if let Some(rx) = release {
                    let _ = rx.await;
                }
                let res = conn.send_reply(request.header.request_id, b"stale").await;
                if let Some(tx) = self.outcome.lock().take() {
                    let _ = tx.send(res);
                }
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn test_reply_after_slot_reuse_is_refused() {
        use crate::admission::AdmissionController;
        use crate::connection::{ConnectionRegistry, SocketId};
        use tokio::io::AsyncReadExt;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel();
        let (outcome_tx, outcome_rx) = tokio::sync::oneshot::channel();
        let handler = Arc::new(HeldReply {
            release: Mutex::new(Some(release_rx)),
            outcome: Mutex::new(Some(outcome_tx)),
        });
        let bridge = bridge(Handlers::default().with_command(handler));
        let reg = ConnectionRegistry::new(1, 4, AdmissionController::new(4, vec![]));

        let old = reg.acquire(SocketId(1), ClientClass::Normal, String::new()).unwrap();
        let conn = reg.get(old).unwrap();
        queue_frame(&conn, Frame::header_only(NetHeader::command(4, 30, 0)));
        bridge.submit_command_task(&conn).unwrap();
        while conn.with_lock(|c| !c.request_queue.is_empty()) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        reg.release(old).unwrap();
        let new = reg.acquire(SocketId(2), ClientClass::Normal, String::new()).unwrap();
        let (mut client, server) = tokio::io::duplex(1024);
        reg.get(new).unwrap().attach_writer(Box::new(server)).await;

        release_tx.send(()).unwrap();
        assert!(matches!(outcome_rx.await.unwrap(), Err(ConnError::ConnectionClosed)));

        drop(conn.writer.lock().await.take());
        let mut written = Vec::new();
        client.read_to_end(&mut written).await.unwrap();
        assert!(written.is_empty(), "stale reply reached the next client");
    }

    #[tokio::test]
    async fn test_echo_reply_written_to_client() {
        let bridge = bridge(Handlers::default());
        let conn = open_conn();
        let (client, server) = tokio::io::duplex(1024);
        conn.attach_writer(Box::new(server)).await;

        queue_frame(&conn, Frame::header_only(NetHeader::command(9, 5, 2)));
        queue_frame(&conn, Frame::new(NetHeader::data(9, 2), BytesMut::from(&b"hi"[..])));
        bridge.submit_command_task(&conn).unwrap();

        let pool = Arc::new(crate::connection::BufferPool::new(2, 64));
        let mut reader = FrameReader::new(client, PacketCodec::new(1024), pool);
        let frame = reader.expect_frame().await.unwrap();
        assert_eq!(frame.header.packet_type, PacketType::Data);
        assert_eq!(frame.header.request_id, 9);
        assert_eq!(&frame.payload[..], b"hi");
        wait_idle(&conn).await;
    }
}
