// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Client endpoint.
//!
//! Connects to a server, mirrors its registered objects and keeps
//! them synchronized both ways. Connection setup retries with a fixed
//! backoff; the handshake aborts on a protocol version mismatch and
//! only warns on a revision mismatch.

use crate::datapool::{DataPool, DataPoolRef};
use crate::diskbuffer::{DiskBuffer, DiskBufferRef};
use crate::error::TincError;
use crate::param::space::{ParameterSpace, SpaceRef};
use crate::param::{ParamRef, Parameter};
use crate::processor::{Processor, ProcessorRef};
use crate::protocol::wire::{ClientMetaData, CommandKind, PeerStatus, ReplyKind, TincPath};
use crate::protocol::{
    framing, Details, Envelope, MessageType, ObjectType, Outbound, PROTOCOL_REVISION,
    PROTOCOL_VERSION,
};
use crate::registry::Registry;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::barrier::{BarrierState, BARRIER_TIMEOUT};
use super::commands::{CommandBroker, COMMAND_TIMEOUT};
use super::{
    handle_command, handle_configure, handle_register, hostname, spawn_writer, ConnectionState,
};

/// Delay between connection attempts.
pub const CONNECT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Attempts before giving up on a connect call.
pub const CONNECT_MAX_ATTEMPTS: u32 = 100;

/// Granularity of status polling in [`TincClient::wait_for_available`].
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(50);

struct ClientShared {
    registry: Registry,
    commands: CommandBroker,
    barriers: BarrierState,
    state: Mutex<ConnectionState>,
    outbound: Mutex<Option<Outbound>>,
    server_working_path: Mutex<String>,
    server_status: Mutex<PeerStatus>,
}

impl ClientShared {
    fn drop_connection(&self) {
        *self.state.lock() = ConnectionState::Disconnected;
        *self.outbound.lock() = None;
        self.registry.detach_all();
        self.commands.fail_all();
        self.barriers.reset();
    }
}

/// A TINC client endpoint.
pub struct TincClient {
    shared: Arc<ClientShared>,
}

impl Default for TincClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TincClient {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ClientShared {
                registry: Registry::new(),
                commands: CommandBroker::new(),
                barriers: BarrierState::new(),
                state: Mutex::new(ConnectionState::Disconnected),
                outbound: Mutex::new(None),
                server_working_path: Mutex::new(String::new()),
                server_status: Mutex::new(PeerStatus::Unknown),
            }),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.lock()
    }

    pub fn server_status(&self) -> PeerStatus {
        *self.shared.server_status.lock()
    }

    /// Poll until the server reports itself available. False on
    /// timeout.
    pub async fn wait_for_available(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.server_status() == PeerStatus::Available {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(STATUS_POLL_INTERVAL).await;
        }
    }

    /// The server's announced working path.
    pub fn server_working_path(&self) -> String {
        self.shared.server_working_path.lock().clone()
    }

    /// Connect and synchronize. Retries the TCP connect with a fixed
    /// interval before giving up.
    pub async fn connect(&self, host: &str, port: u16) -> Result<(), TincError> {
        {
            let mut state = self.shared.state.lock();
            if !matches!(
                *state,
                ConnectionState::Disconnected | ConnectionState::GoodbyeSent
            ) {
                // Already connecting or connected.
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }

        let address = format!("{}:{}", host, port);
        let mut stream = None;
        let mut last_error: Option<std::io::Error> = None;
        for attempt in 1..=CONNECT_MAX_ATTEMPTS {
            match TcpStream::connect(&address).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    debug!(%address, attempt, "connect failed: {}", e);
                    last_error = Some(e);
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
            }
        }
        let Some(mut stream) = stream else {
            *self.shared.state.lock() = ConnectionState::Disconnected;
            return Err(TincError::Io(last_error.unwrap_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::TimedOut, "connect retries exhausted")
            })));
        };

        *self.shared.state.lock() = ConnectionState::Handshaking;
        stream
            .write_all(&framing::handshake(
                framing::HANDSHAKE_INITIATE,
                PROTOCOL_VERSION,
                PROTOCOL_REVISION,
            ))
            .await?;
        let mut ack = [0u8; framing::HANDSHAKE_LEN];
        stream.read_exact(&mut ack).await?;
        let (version, revision) = framing::parse_handshake(&ack, framing::HANDSHAKE_ACK)?;
        if version != PROTOCOL_VERSION {
            *self.shared.state.lock() = ConnectionState::Disconnected;
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

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        spawn_writer(write_half, rx);

        *self.shared.outbound.lock() = Some(tx.clone());
        self.shared.registry.attach_all(&tx);
        *self.shared.state.lock() = ConnectionState::Connected;
        info!(%address, "connected");

        // Synchronize: who we are, then ask for everything.
        let _ = tx.send(Envelope::new(
            MessageType::ClientMetadata,
            ObjectType::Global,
            Details::ClientMetadata(ClientMetaData {
                hostname: hostname(),
            }),
        ));
        for object_type in ObjectType::SYNCHRONIZABLE {
            let _ = tx.send(Envelope::new(
                MessageType::Request,
                object_type,
                Details::ObjectId(crate::protocol::wire::ObjectId { id: String::new() }),
            ));
        }

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut reader = read_half;
            loop {
                match framing::read_frame(&mut reader).await {
                    Ok(Some(bytes)) => match Envelope::decode(&bytes) {
                        Ok(envelope) => dispatch(&shared, envelope, &tx),
                        Err(e) => warn!("dropping undecodable envelope: {}", e),
                    },
                    Ok(None) => {
                        info!("server closed the connection");
                        break;
                    }
                    Err(e) => {
                        warn!("read failed: {}", e);
                        break;
                    }
                }
            }
            shared.drop_connection();
        });

        Ok(())
    }

    /// Announce the goodbye and tear the connection down.
    pub fn disconnect(&self) {
        if let Some(tx) = self.shared.outbound.lock().as_ref() {
            let _ = tx.send(Envelope::global(MessageType::Goodbye));
            *self.shared.state.lock() = ConnectionState::GoodbyeSent;
        }
        self.shared.drop_connection();
    }

    fn outbound(&self) -> Result<Outbound, TincError> {
        self.shared
            .outbound
            .lock()
            .clone()
            .ok_or(TincError::Disconnected)
    }

    // ------------------------------------------------------------------
    // Object registration
    // ------------------------------------------------------------------

    fn announce(&self, envelope: Envelope) {
        if let Some(tx) = self.shared.outbound.lock().as_ref() {
            let _ = tx.send(envelope);
        }
    }

    pub fn register_parameter(&self, mut param: Parameter) -> ParamRef {
        if let Some(tx) = self.shared.outbound.lock().as_ref() {
            param.attach(tx.clone());
        }
        let reg = param.to_register();
        let param = self
            .shared
            .registry
            .add_parameter(Arc::new(Mutex::new(param)));
        self.announce(Envelope::new(
            MessageType::Register,
            ObjectType::Parameter,
            Details::Register(reg),
        ));
        param
    }

    pub fn register_space(&self, mut space: ParameterSpace) -> SpaceRef {
        if let Some(tx) = self.shared.outbound.lock().as_ref() {
            space.attach(tx.clone());
        }
        let reg = space.to_register();
        let space = self.shared.registry.add_space(Arc::new(Mutex::new(space)));
        self.announce(Envelope::new(
            MessageType::Register,
            ObjectType::ParameterSpace,
            Details::Register(reg),
        ));
        space
    }

    pub fn register_processor(&self, mut processor: Processor) -> ProcessorRef {
        if let Some(tx) = self.shared.outbound.lock().as_ref() {
            processor.attach(tx.clone());
        }
        let reg = processor.to_register();
        let processor = self
            .shared
            .registry
            .add_processor(Arc::new(Mutex::new(processor)));
        self.announce(Envelope::new(
            MessageType::Register,
            ObjectType::Processor,
            Details::Register(reg),
        ));
        processor
    }

    pub fn register_disk_buffer(&self, mut buffer: DiskBuffer) -> DiskBufferRef {
        if let Some(tx) = self.shared.outbound.lock().as_ref() {
            buffer.attach(tx.clone());
        }
        let reg = buffer.to_register();
        let buffer = self
            .shared
            .registry
            .add_disk_buffer(Arc::new(Mutex::new(buffer)));
        self.announce(Envelope::new(
            MessageType::Register,
            ObjectType::DiskBuffer,
            Details::Register(reg),
        ));
        buffer
    }

    pub fn register_data_pool(&self, mut pool: DataPool) -> DataPoolRef {
        if let Some(tx) = self.shared.outbound.lock().as_ref() {
            pool.attach(tx.clone());
        }
        let reg = pool.to_register();
        let pool = self
            .shared
            .registry
            .add_data_pool(Arc::new(Mutex::new(pool)));
        self.announce(Envelope::new(
            MessageType::Register,
            ObjectType::DataPool,
            Details::Register(reg),
        ));
        pool
    }

    // ------------------------------------------------------------------
    // Requests
    // ------------------------------------------------------------------

    /// Send a command and wait for its reply with the default timeout.
    pub async fn send_command(
        &self,
        object_type: ObjectType,
        kind: CommandKind,
    ) -> Result<ReplyKind, TincError> {
        self.send_command_timeout(object_type, kind, COMMAND_TIMEOUT)
            .await
    }

    pub async fn send_command_timeout(
        &self,
        object_type: ObjectType,
        kind: CommandKind,
        timeout: Duration,
    ) -> Result<ReplyKind, TincError> {
        let outbound = self.outbound()?;
        self.shared
            .commands
            .send_command(&outbound, object_type, kind, timeout)
            .await
    }

    /// Block in the next server barrier round. False on timeout.
    pub async fn barrier(&self) -> bool {
        self.barrier_timeout(BARRIER_TIMEOUT).await
    }

    pub async fn barrier_timeout(&self, timeout: Duration) -> bool {
        let Ok(outbound) = self.outbound() else {
            return false;
        };
        self.shared.barriers.barrier(&outbound, timeout).await
    }

    /// Announce this client's working path.
    pub fn send_working_path(&self, path: impl Into<String>) {
        self.announce(Envelope::new(
            MessageType::WorkingPath,
            ObjectType::Global,
            Details::WorkingPath(TincPath {
                path: path.into(),
                host: hostname(),
            }),
        ));
    }

    /// Announce availability.
    pub fn send_status(&self, status: PeerStatus) {
        self.announce(Envelope::new(
            MessageType::Status,
            ObjectType::Global,
            Details::Status(crate::protocol::wire::StatusMessage::new(status)),
        ));
    }
}

fn dispatch(shared: &Arc<ClientShared>, envelope: Envelope, outbound: &Outbound) {
    match envelope.details {
        Details::Empty => match envelope.message_type {
            MessageType::Ping => {
                let _ = outbound.send(Envelope::global(MessageType::Pong));
            }
            MessageType::Pong => {}
            MessageType::Goodbye => {
                debug!("server said goodbye");
                shared.drop_connection();
            }
            other => warn!(?other, "unexpected empty message"),
        },
        Details::Register(reg) => {
            if let Err(e) = handle_register(&shared.registry, reg, outbound) {
                warn!("register failed: {}", e);
            }
        }
        Details::Configure(cfg) => {
            handle_configure(&shared.registry, &cfg);
        }
        Details::ObjectId(target) => match envelope.message_type {
            MessageType::Remove => {
                shared.registry.remove(envelope.object_type, &target.id);
            }
            MessageType::Request => {
                for env in shared.registry.register_envelopes(envelope.object_type) {
                    let _ = outbound.send(env);
                }
            }
            other => warn!(?other, "unexpected object id message"),
        },
        Details::Command(cmd) => {
            if let Some(reply) = handle_command(&shared.registry, &cmd) {
                let _ = outbound.send(Envelope::new(
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
            MessageType::BarrierRequest => shared.barriers.on_request(nonce.request_id),
            MessageType::BarrierUnlock => shared.barriers.on_unlock(nonce.request_id),
            other => warn!(?other, "unexpected barrier message"),
        },
        Details::Status(status) => {
            *shared.server_status.lock() = status.status();
        }
        Details::WorkingPath(path) => {
            debug!(path = %path.path, host = %path.host, "server working path");
            *shared.server_working_path.lock() = path.path;
        }
        Details::ClientMetadata(meta) => {
            debug!(hostname = %meta.hostname, "ignoring client metadata on client side");
        }
    }
}
