//! TCP front end: accept loop, connect handshake and the per-connection
//! handler loop.
//!
//! ```text
//!   accept ──► handshake (class, HA gate, admission) ──► reply reason code
//!                                 │
//!                                 ▼
//!            connection task: read frame ──► dispatch ──► command tasks
//!                 │ idle poll: ToBeStandby refusal, stop_talk
//!                 ▼
//!            wait for pending commands ──► release slot
//! ```

use crate::admission::ClientClass;
use crate::config::ServerConfig;
use crate::connection::{BoxedWriter, BufferPool, ConnStatus, ConnectionEntry, ConnectionHandle, ConnectionRegistry};
use crate::dispatch::dispatch_frame;
use crate::error::ConnError;
use crate::ha::{ClientEvent, HaController, HaState};
use crate::observability::connection_span;
use crate::protocol::{ConnectReason, FrameReader, NetHeader, PacketCodec, PacketType, HEADER_SIZE};
use crate::session::TransactionManager;
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::transport::connect_reply;
use crate::worker::{DispatchBridge, Handlers, TaskPool, WorkerPool};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

const DRAIN_POLL: Duration = Duration::from_millis(10);

type Reader = FrameReader<OwnedReadHalf>;

pub struct Server {
    config: ServerConfig,
    registry: Arc<ConnectionRegistry>,
    ha: Arc<HaController>,
    txn: Arc<dyn TransactionManager>,
    bridge: DispatchBridge,
    connection_pool: Arc<TaskPool>,
    request_pool: Arc<TaskPool>,
    buffers: Arc<BufferPool>,
    accept: CancellationToken,
}

impl Server {
    pub fn new(config: ServerConfig, txn: Arc<dyn TransactionManager>, handlers: Handlers) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry::from_config(&config));
        let ha = Arc::new(HaController::new(&config.ha, txn.clone()));
        let connection_pool = Arc::new(TaskPool::new(
            "connection",
            config.workers.connection_workers,
            config.workers.partitions,
        ));
        let request_pool = Arc::new(TaskPool::new(
            "request",
            config.workers.request_workers,
            config.workers.partitions,
        ));
        let bridge = DispatchBridge::new(connection_pool.clone(), request_pool.clone(), handlers);
        let buffers = Arc::new(BufferPool::new(
            config.registry.buffer_pool_size,
            config.registry.read_buffer_size,
        ));

        Arc::new(Server {
            config,
            registry,
            ha,
            txn,
            bridge,
            connection_pool,
            request_pool,
            buffers,
            accept: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn ha(&self) -> &Arc<HaController> {
        &self.ha
    }

    pub fn connection_pool(&self) -> &Arc<TaskPool> {
        &self.connection_pool
    }

    pub fn request_pool(&self) -> &Arc<TaskPool> {
        &self.request_pool
    }

    /// Cancelled when shutdown begins.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.accept.clone()
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn serve(self: Arc<Self>) -> Result<(), ConnError> {
        let listener = TcpListener::bind(self.config.listen_addr()).await?;
        self.run(listener).await
    }

    /// Accept on `listener` until shutdown begins.
    pub async fn run(self: Arc<Self>, listener: TcpListener) -> Result<(), ConnError> {
        self.connection_pool.start_all();
        self.request_pool.start_all();
        info!(addr = %listener.local_addr()?, ha = %self.ha.state(), "listening");

        loop {
            let accepted = tokio::select! {
                _ = self.accept.cancelled() => break,
                res = listener.accept() => res,
            };
            match accepted {
                Ok((stream, peer)) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handshake(stream, peer).await {
                            debug!(%peer, error = %e, "handshake failed");
                        }
                    });
                }
                Err(e) => error!(error = %e, "accept failed"),
            }
        }
        info!("accept loop stopped");
        Ok(())
    }

    async fn reject(writer: &mut BoxedWriter, reason: ConnectReason) -> Result<(), ConnError> {
        let payload = connect_reply(reason, 0);
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        NetHeader::data(0, payload.len() as u32).encode(&mut buf);
        buf.extend_from_slice(&payload);
        writer.write_all(&buf).await?;
        writer.flush().await?;
        writer.shutdown().await?;
        Ok(())
    }

    async fn handshake(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<(), ConnError> {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(%peer, error = %e, "failed to set TCP_NODELAY");
        }
        let (rd, wr) = stream.into_split();
        let mut reader = FrameReader::new(
            rd,
            PacketCodec::new(self.config.max_payload_size),
            self.buffers.clone(),
        );
        let mut writer: BoxedWriter = Box::new(wr);

        let request = tokio::time::timeout(self.config.timeouts.handshake, reader.expect_frame()).await??;
        if request.header.packet_type != PacketType::Command {
            return Err(ConnError::Protocol(format!(
                "expected connect command, got {:?}",
                request.header.packet_type
            )));
        }
        let class = ClientClass::from_code(request.header.function_code).ok_or_else(|| {
            ConnError::Protocol(format!("unknown client class {}", request.header.function_code))
        })?;

        if self.ha.check_state_for_client(ClientEvent::Register).is_err() {
            info!(%peer, class = %class, "connection refused while changing to standby");
            return Self::reject(&mut writer, ConnectReason::ServerUnavailable).await;
        }
        if self.connection_pool.idle_count() == 0 {
            warn!(%peer, "no idle connection worker");
            return Self::reject(&mut writer, ConnectReason::ServerBusy).await;
        }

        let socket = self.registry.next_socket_id();
        let handle = match self.registry.acquire(socket, class, peer.to_string()) {
            Ok(handle) => handle,
            Err(ConnError::ClientsExceeded) => {
                info!(%peer, class = %class, "clients exceeded");
                return Self::reject(&mut writer, ConnectReason::ClientsExceeded).await;
            }
            Err(ConnError::PoolExhausted) => {
                return Self::reject(&mut writer, ConnectReason::ServerBusy).await;
            }
            Err(e) => return Err(e),
        };
        let conn = self.registry.get(handle)?;
        let tran = self.txn.bind_transaction(handle, class);
        conn.bind_transaction(Some(tran));

        if let Some(hook) = &self.bridge.handlers().connect {
            if let Err(e) = hook.on_connect(&conn) {
                warn!(%peer, error = %e, "connect hook refused client");
                let _ = Self::reject(&mut writer, ConnectReason::ServerUnavailable).await;
                self.unregister(&conn, handle);
                return Err(e);
            }
        }

        conn.attach_writer(writer).await;
        let reply = connect_reply(ConnectReason::Connected, conn.client_id());
        if let Err(e) = conn.send_packet(NetHeader::data(0, 0), &reply).await {
            self.unregister(&conn, handle);
            return Err(e);
        }
        self.registry.activate(handle)?;

        let server = self.clone();
        let submitted = self
            .bridge
            .submit_connection_task(&conn, move |conn| server.serve_connection(conn, handle, reader));
        if let Err(e) = submitted {
            conn.shutdown_transport().await;
            self.unregister(&conn, handle);
            return Err(e);
        }
        Ok(())
    }

    async fn serve_connection(self: Arc<Self>, conn: Arc<ConnectionEntry>, handle: ConnectionHandle, mut reader: Reader) {
        let span = connection_span(conn.index(), conn.client_id(), conn.client_class(), &conn.peer());
        async move {
            debug!("connection served");
            match self.connection_loop(&conn, &mut reader).await {
                Ok(()) => {}
                Err(ConnError::ConnectionClosed) => debug!("peer disconnected"),
                Err(e) => self.bridge.handlers().error.on_error(&conn, &e),
            }
            self.close_connection(&conn, handle).await;
        }
        .instrument(span)
        .await
    }

    async fn connection_loop(&self, conn: &Arc<ConnectionEntry>, reader: &mut Reader) -> Result<(), ConnError> {
        loop {
            if conn.stop_talk() || conn.status() != ConnStatus::Open {
                return Ok(());
            }
            let next = tokio::select! {
                _ = self.accept.cancelled() => return Ok(()),
                res = tokio::time::timeout(self.config.timeouts.idle_poll, reader.next_frame()) => res,
            };
            let frame = match next {
                Err(_idle) => {
                    if self.refuse_while_to_be_standby(conn) {
                        info!("connection refused, server is changing to standby");
                        return Ok(());
                    }
                    continue;
                }
                Ok(Ok(Some(frame))) => frame,
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(e)) => return Err(e),
            };

            let outcome = dispatch_frame(conn, frame, reader).await?;
            for _ in 0..outcome.commands {
                self.bridge.submit_command_task(conn)?;
            }
            if outcome.closed {
                return Ok(());
            }
        }
    }

    fn refuse_while_to_be_standby(&self, conn: &ConnectionEntry) -> bool {
        self.ha.state() == HaState::ToBeStandby && !conn.in_transaction() && conn.pending_requests() == 0
    }

    async fn close_connection(&self, conn: &Arc<ConnectionEntry>, handle: ConnectionHandle) {
        let deadline = Instant::now() + self.config.timeouts.release_drain;
        while conn.pending_requests() > 0 && Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
        }
        if conn.pending_requests() > 0 {
            warn!(pending = conn.pending_requests(), "releasing connection with requests in flight");
        }
        conn.end_request();
        conn.interrupt();
        conn.shutdown_transport().await;
        self.unregister(conn, handle);
    }

    fn unregister(&self, conn: &ConnectionEntry, handle: ConnectionHandle) {
        let _ = self.ha.check_state_for_client(ClientEvent::Unregister);
        if let Some(tran) = conn.transaction_index() {
            self.txn.unbind_transaction(tran);
        }
        if let Err(e) = self.registry.release(handle) {
            debug!(error = %e, "connection already released");
        }
    }

    pub fn shutdown_coordinator(&self) -> ShutdownCoordinator {
        ShutdownCoordinator::new(
            self.registry.clone(),
            vec![
                self.connection_pool.clone() as Arc<dyn WorkerPool>,
                self.request_pool.clone() as Arc<dyn WorkerPool>,
            ],
            self.txn.clone(),
            self.config.shutdown.clone(),
            self.accept.clone(),
        )
    }

    /// Run the two-phase shutdown.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutdown_coordinator().run().await
    }
}
