// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server endpoint.
//!
//! Accepts client connections, answers their synchronization
//! requests, relays mutations between peers and coordinates barrier
//! rounds. Each connection gets its own reader task and writer task;
//! state shared between them lives behind the registry and the
//! connection table.

use crate::config::ServerConfig;
use crate::datapool::{DataPool, DataPoolRef};
use crate::diskbuffer::{DiskBuffer, DiskBufferRef};
use crate::error::TincError;
use crate::param::space::{ParameterSpace, SpaceRef};
use crate::param::{ParamRef, Parameter};
use crate::processor::{Processor, ProcessorRef};
use crate::protocol::wire::{BarrierNonce, PeerStatus, TincPath};
use crate::protocol::{
    framing, Details, Envelope, MessageType, ObjectType, Outbound, PROTOCOL_REVISION,
    PROTOCOL_VERSION,
};
use crate::registry::Registry;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::barrier::{BarrierCoordinator, BARRIER_TIMEOUT};
use super::commands::CommandBroker;
use super::{handle_command, handle_configure, handle_register, hostname, spawn_writer};

/// Interval between keepalive pings.
pub const PING_INTERVAL: Duration = Duration::from_secs(10);

struct ConnectionHandle {
    outbound: Outbound,
    hostname: String,
    status: PeerStatus,
    working_path: String,
}

/// What the server knows about one connected client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Empty until the client announced its metadata.
    pub hostname: String,
    pub status: PeerStatus,
    /// Empty until the client announced a working path.
    pub working_path: String,
}

struct ServerShared {
    registry: Registry,
    config: ServerConfig,
    commands: CommandBroker,
    barrier: BarrierCoordinator,
    connections: Mutex<HashMap<u64, ConnectionHandle>>,
    next_connection: AtomicU64,
    /// Channel feeding the fan-out task; local object mutations go
    /// here and reach every connection.
    broadcast: Mutex<Option<Outbound>>,
}

impl ServerShared {
    fn relay_to_others(&self, from: u64, envelope: &Envelope) {
        for (id, handle) in self.connections.lock().iter() {
            if *id != from {
                let _ = handle.outbound.send(envelope.clone());
            }
        }
    }

    fn broadcast_all(&self, envelope: Envelope) {
        for handle in self.connections.lock().values() {
            let _ = handle.outbound.send(envelope.clone());
        }
    }

    fn remove_connection(&self, id: u64) {
        if self.connections.lock().remove(&id).is_some() {
            info!(connection = id, "client disconnected");
        }
    }
}

/// A TINC server endpoint.
pub struct TincServer {
    shared: Arc<ServerShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl TincServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            shared: Arc::new(ServerShared {
                registry: Registry::new(),
                config,
                commands: CommandBroker::new(),
                barrier: BarrierCoordinator::new(),
                connections: Mutex::new(HashMap::new()),
                next_connection: AtomicU64::new(1),
                broadcast: Mutex::new(None),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.lock().len()
    }

    /// Snapshot of every connected client's announced hostname,
    /// status and working path.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.shared
            .connections
            .lock()
            .values()
            .map(|handle| PeerInfo {
                hostname: handle.hostname.clone(),
                status: handle.status,
                working_path: handle.working_path.clone(),
            })
            .collect()
    }

    /// Bind and start serving. Returns the bound port, which matters
    /// when the configured port is 0.
    pub async fn start(&self) -> Result<u16, TincError> {
        let listener = TcpListener::bind(self.shared.config.listen_address()).await?;
        let port = listener.local_addr()?.port();
        info!(port, "server listening");

        // Fan-out: one channel that every locally attached object
        // emits into, drained towards all connections.
        let (broadcast_tx, mut broadcast_rx) = tokio::sync::mpsc::unbounded_channel();
        *self.shared.broadcast.lock() = Some(broadcast_tx.clone());
        self.shared.registry.attach_all(&broadcast_tx);

        let fanout = Arc::clone(&self.shared);
        self.tasks.lock().push(tokio::spawn(async move {
            while let Some(envelope) = broadcast_rx.recv().await {
                fanout.broadcast_all(envelope);
            }
        }));

        let acceptor = Arc::clone(&self.shared);
        self.tasks.lock().push(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "incoming connection");
                        let shared = Arc::clone(&acceptor);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(shared, stream).await {
                                debug!(%peer, "connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        warn!("accept failed: {}", e);
                        break;
                    }
                }
            }
        }));

        let pinger = Arc::clone(&self.shared);
        self.tasks.lock().push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(PING_INTERVAL);
            loop {
                interval.tick().await;
                pinger.broadcast_all(Envelope::global(MessageType::Ping));
            }
        }));

        Ok(port)
    }

    /// Say goodbye to every client and stop the background tasks.
    pub fn shutdown(&self) {
        self.shared
            .broadcast_all(Envelope::global(MessageType::Goodbye));
        self.shared.connections.lock().clear();
        *self.shared.broadcast.lock() = None;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn attach_new(&self, attach: impl FnOnce(Outbound)) {
        if let Some(tx) = self.shared.broadcast.lock().as_ref() {
            attach(tx.clone());
        }
    }

    // ------------------------------------------------------------------
    // Object registration
    // ------------------------------------------------------------------

    pub fn register_parameter(&self, mut param: Parameter) -> ParamRef {
        self.attach_new(|tx| param.attach(tx));
        let reg = param.to_register();
        let param = self
            .shared
            .registry
            .add_parameter(Arc::new(Mutex::new(param)));
        self.shared.broadcast_all(Envelope::new(
            MessageType::Register,
            ObjectType::Parameter,
            Details::Register(reg),
        ));
        param
    }

    pub fn register_space(&self, mut space: ParameterSpace) -> SpaceRef {
        self.attach_new(|tx| space.attach(tx));
        let reg = space.to_register();
        let space = self.shared.registry.add_space(Arc::new(Mutex::new(space)));
        self.shared.broadcast_all(Envelope::new(
            MessageType::Register,
            ObjectType::ParameterSpace,
            Details::Register(reg),
        ));
        space
    }

    pub fn register_processor(&self, mut processor: Processor) -> ProcessorRef {
        self.attach_new(|tx| processor.attach(tx));
        let reg = processor.to_register();
        let processor = self
            .shared
            .registry
            .add_processor(Arc::new(Mutex::new(processor)));
        self.shared.broadcast_all(Envelope::new(
            MessageType::Register,
            ObjectType::Processor,
            Details::Register(reg),
        ));
        processor
    }

    pub fn register_disk_buffer(&self, mut buffer: DiskBuffer) -> DiskBufferRef {
        self.attach_new(|tx| buffer.attach(tx));
        let reg = buffer.to_register();
        let buffer = self
            .shared
            .registry
            .add_disk_buffer(Arc::new(Mutex::new(buffer)));
        self.shared.broadcast_all(Envelope::new(
            MessageType::Register,
            ObjectType::DiskBuffer,
            Details::Register(reg),
        ));
        buffer
    }

    pub fn register_data_pool(&self, mut pool: DataPool) -> DataPoolRef {
        self.attach_new(|tx| pool.attach(tx));
        let reg = pool.to_register();
        let pool = self
            .shared
            .registry
            .add_data_pool(Arc::new(Mutex::new(pool)));
        self.shared.broadcast_all(Envelope::new(
            MessageType::Register,
            ObjectType::DataPool,
            Details::Register(reg),
        ));
        pool
    }

    // ------------------------------------------------------------------
    // Coordination
    // ------------------------------------------------------------------

    /// Run one barrier round across every connected client. True when
    /// all clients acknowledged and were released; a round with no
    /// clients succeeds trivially.
    pub async fn barrier(&self) -> bool {
        self.barrier_timeout(BARRIER_TIMEOUT).await
    }

    pub async fn barrier_timeout(&self, timeout: Duration) -> bool {
        let participants: HashSet<u64> =
            self.shared.connections.lock().keys().copied().collect();
        if participants.is_empty() {
            return true;
        }

        let nonce = self.shared.barrier.allocate();
        self.shared.broadcast_all(Envelope::new(
            MessageType::BarrierRequest,
            ObjectType::Global,
            Details::Barrier(BarrierNonce { request_id: nonce }),
        ));

        let all_acked = self
            .shared
            .barrier
            .wait_for_acks(nonce, &participants, timeout)
            .await;
        if all_acked {
            self.shared.broadcast_all(Envelope::new(
                MessageType::BarrierUnlock,
                ObjectType::Global,
                Details::Barrier(BarrierNonce { request_id: nonce }),
            ));
        } else {
            warn!(nonce, "barrier timed out, leaving clients locked out");
        }
        self.shared.barrier.finish(nonce);
        all_acked
    }

    /// Announce the server's working path, rewritten per client
    /// through the root path map.
    pub fn send_working_path(&self, path: &str) {
        let local_host = hostname();
        for handle in self.shared.connections.lock().values() {
            let translated = self
                .shared
                .config
                .translate_path(path, &handle.hostname);
            let _ = handle.outbound.send(Envelope::new(
                MessageType::WorkingPath,
                ObjectType::Global,
                Details::WorkingPath(TincPath {
                    path: translated,
                    host: local_host.clone(),
                }),
            ));
        }
    }
}

async fn serve_connection(
    shared: Arc<ServerShared>,
    mut stream: TcpStream,
) -> Result<(), TincError> {
    let mut initiate = [0u8; framing::HANDSHAKE_LEN];
    stream.read_exact(&mut initiate).await?;
    let (version, revision) =
        framing::parse_handshake(&initiate, framing::HANDSHAKE_INITIATE)?;
    stream
        .write_all(&framing::handshake(
            framing::HANDSHAKE_ACK,
            PROTOCOL_VERSION,
            PROTOCOL_REVISION,
        ))
        .await?;
    if version != PROTOCOL_VERSION {
        return Err(TincError::VersionMismatch {
            peer: version,
            local: PROTOCOL_VERSION,
        });
    }
    if revision != PROTOCOL_REVISION {
        warn!(
            peer = revision,
            local = PROTOCOL_REVISION,
            "protocol revision differs"
        );
    }

    let connection_id = shared.next_connection.fetch_add(1, Ordering::SeqCst);
    let (read_half, write_half) = stream.into_split();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    spawn_writer(write_half, rx);

    shared.connections.lock().insert(
        connection_id,
        ConnectionHandle {
            outbound: tx.clone(),
            hostname: String::new(),
            status: PeerStatus::Unknown,
            working_path: String::new(),
        },
    );
    info!(connection = connection_id, "client connected");

    let mut reader = read_half;
    loop {
        match framing::read_frame(&mut reader).await {
            Ok(Some(bytes)) => match Envelope::decode(&bytes) {
                Ok(envelope) => dispatch(&shared, connection_id, envelope, &tx),
                Err(e) => warn!(connection = connection_id, "undecodable envelope: {}", e),
            },
            Ok(None) => break,
            Err(e) => {
                debug!(connection = connection_id, "read failed: {}", e);
                break;
            }
        }
    }
    shared.remove_connection(connection_id);
    Ok(())
}

fn dispatch(shared: &Arc<ServerShared>, connection: u64, envelope: Envelope, tx: &Outbound) {
    match envelope.details {
        Details::Empty => match envelope.message_type {
            MessageType::Ping => {
                let _ = tx.send(Envelope::global(MessageType::Pong));
            }
            MessageType::Pong => {}
            MessageType::Goodbye => shared.remove_connection(connection),
            other => warn!(?other, "unexpected empty message"),
        },
        Details::Register(reg) => {
            let broadcast = shared.broadcast.lock().clone();
            if let Some(broadcast) = broadcast {
                if let Err(e) = handle_register(&shared.registry, reg.clone(), &broadcast) {
                    warn!(connection, "register failed: {}", e);
                    return;
                }
            }
            shared.relay_to_others(
                connection,
                &Envelope::new(
                    envelope.message_type,
                    envelope.object_type,
                    Details::Register(reg),
                ),
            );
        }
        Details::Configure(cfg) => {
            if handle_configure(&shared.registry, &cfg) {
                shared.relay_to_others(
                    connection,
                    &Envelope::new(
                        envelope.message_type,
                        envelope.object_type,
                        Details::Configure(cfg),
                    ),
                );
            }
        }
        Details::ObjectId(target) => match envelope.message_type {
            MessageType::Request => {
                for env in shared.registry.register_envelopes(envelope.object_type) {
                    let _ = tx.send(env);
                }
            }
            MessageType::Remove => {
                shared.registry.remove(envelope.object_type, &target.id);
                shared.relay_to_others(
                    connection,
                    &Envelope::new(
                        envelope.message_type,
                        envelope.object_type,
                        Details::ObjectId(target),
                    ),
                );
            }
            other => warn!(?other, "unexpected object id message"),
        },
        Details::Command(cmd) => {
            if let Some(reply) = handle_command(&shared.registry, &cmd) {
                let _ = tx.send(Envelope::new(
                    MessageType::CommandReply,
                    envelope.object_type,
                    Details::CommandReply(reply),
                ));
            }
        }
        Details::CommandReply(reply) => {
            shared.commands.complete(reply.command_id, reply.details);
        }
        Details::Barrier(nonce) => match envelope.message_type {
            MessageType::BarrierAckLock => {
                shared.barrier.on_ack(nonce.request_id, connection);
            }
            other => warn!(?other, "unexpected barrier message from client"),
        },
        Details::Status(status) => {
            if let Some(handle) = shared.connections.lock().get_mut(&connection) {
                handle.status = status.status();
            }
        }
        Details::WorkingPath(path) => {
            if let Some(handle) = shared.connections.lock().get_mut(&connection) {
                handle.working_path = path.path;
                if !path.host.is_empty() {
                    handle.hostname = path.host;
                }
            }
        }
        Details::ClientMetadata(meta) => {
            debug!(connection, hostname = %meta.hostname, "client metadata");
            if let Some(handle) = shared.connections.lock().get_mut(&connection) {
                handle.hostname = meta.hostname;
            }
        }
    }
}
