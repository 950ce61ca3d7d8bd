// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connection endpoints.
//!
//! The client and server share the object-level message handling in
//! this module; [`client`] and [`server`] add the connection
//! lifecycle around it. Outbound traffic always goes through a
//! per-connection channel drained by a single writer task, so object
//! mutations never block on the socket.

pub mod barrier;
pub mod client;
pub mod commands;
pub mod server;

use crate::datapool::DataPool;
use crate::diskbuffer::DiskBuffer;
use crate::error::TincError;
use crate::param::space::ParameterSpace;
use crate::param::value::ParamValue;
use crate::param::Parameter;
use crate::processor::Processor;
use crate::protocol::framing;
use crate::protocol::wire::{
    CommandKind, CommandMessage, CommandReplyMessage, ConfigureObject, RegisterObject, ReplyKind,
};
use crate::protocol::{Envelope, Outbound};
use crate::registry::Registry;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Best-effort local hostname for peer metadata.
pub(crate) fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
    GoodbyeSent,
}

/// Drain `rx` into the socket, one frame per envelope. Ends when the
/// channel closes or the socket errors.
pub(crate) fn spawn_writer<W>(mut write_half: W, mut rx: UnboundedReceiver<Envelope>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let bytes = match envelope.encode() {
                Ok(b) => b,
                Err(e) => {
                    warn!("failed to encode envelope: {}", e);
                    continue;
                }
            };
            if let Err(e) = write_half.write_all(&framing::frame(&bytes)).await {
                debug!("writer stopping: {}", e);
                break;
            }
        }
    })
}

/// Mirror a REGISTER payload into the registry. Existing ids are left
/// untouched; new objects attach to `outbound` so local mutations of
/// the mirror flow back.
pub(crate) fn handle_register(
    registry: &Registry,
    reg: RegisterObject,
    outbound: &Outbound,
) -> Result<(), TincError> {
    match reg {
        RegisterObject::Parameter(r) => {
            let default = ParamValue::try_from(&r.default_value)?;
            let mut param = Parameter::new(r.id, default)?.with_group(r.group)?;
            if let Some(min) = &r.min {
                param.apply_min(ParamValue::try_from(min)?)?;
            }
            if let Some(max) = &r.max {
                param.apply_max(ParamValue::try_from(max)?)?;
            }
            param.attach(outbound.clone());
            registry.add_parameter(Arc::new(Mutex::new(param)));
        }
        RegisterObject::ParameterSpace(r) => {
            let mut space = ParameterSpace::new(r.id)?;
            space.attach(outbound.clone());
            registry.add_space(Arc::new(Mutex::new(space)));
        }
        RegisterObject::Processor(r) => {
            let mut processor = Processor::new(r.id)?;
            processor.attach(outbound.clone());
            registry.add_processor(Arc::new(Mutex::new(processor)));
        }
        RegisterObject::DiskBuffer(r) => {
            let mut buffer = DiskBuffer::new(r.id, r.base_filename, r.path)?;
            buffer.attach(outbound.clone());
            registry.add_disk_buffer(Arc::new(Mutex::new(buffer)));
        }
        RegisterObject::DataPool(r) => {
            // The pool's space registers first in a well-behaved
            // stream, but tolerate either order.
            let space = match registry.space(&r.parameter_space_id) {
                Some(space) => space,
                None => {
                    let mut space = ParameterSpace::new(r.parameter_space_id.clone())?;
                    space.attach(outbound.clone());
                    registry.add_space(Arc::new(Mutex::new(space)))
                }
            };
            let mut pool = DataPool::new(r.id, space, r.slice_cache_dir)?;
            pool.attach(outbound.clone());
            registry.add_data_pool(Arc::new(Mutex::new(pool)));
        }
    }
    Ok(())
}

/// Apply a CONFIGURE payload to the targeted mirror. Returns false
/// when the target does not exist or the mutation was rejected.
pub(crate) fn handle_configure(registry: &Registry, cfg: &ConfigureObject) -> bool {
    match cfg {
        ConfigureObject::Parameter(c) => match registry.parameter(&c.id) {
            Some(param) => param.lock().apply_update(&c.update),
            None => {
                warn!(id = %c.id, "configure for unknown parameter");
                false
            }
        },
        ConfigureObject::ParameterSpace(c) => {
            use crate::protocol::wire::SpaceUpdate;
            let Some(space) = registry.space(&c.id) else {
                warn!(id = %c.id, "configure for unknown space");
                return false;
            };
            match &c.update {
                SpaceUpdate::AddParameter { address } => {
                    match registry.parameter(address) {
                        Some(param) => {
                            space.lock().add_parameter(param);
                            true
                        }
                        None => {
                            warn!(%address, "space add for unknown parameter");
                            false
                        }
                    }
                }
                SpaceUpdate::RemoveParameter { address } => {
                    let id = address.rsplit('/').next().unwrap_or(address);
                    space.lock().remove_parameter(id);
                    true
                }
                other => {
                    space.lock().apply_update(other);
                    true
                }
            }
        }
        ConfigureObject::Processor(c) => match registry.processor(&c.id) {
            Some(processor) => {
                processor.lock().apply_update(&c.update);
                true
            }
            None => {
                warn!(id = %c.id, "configure for unknown processor");
                false
            }
        },
        ConfigureObject::DiskBuffer(c) => match registry.disk_buffer(&c.id) {
            Some(buffer) => match buffer.lock().apply_update(c) {
                Ok(()) => true,
                Err(e) => {
                    warn!(id = %c.id, "disk buffer configure failed: {}", e);
                    false
                }
            },
            None => {
                warn!(id = %c.id, "configure for unknown disk buffer");
                false
            }
        },
        ConfigureObject::DataPool(c) => match registry.data_pool(&c.id) {
            Some(pool) => {
                pool.lock().apply_update(c);
                true
            }
            None => {
                warn!(id = %c.id, "configure for unknown data pool");
                false
            }
        },
    }
}

/// Execute a COMMAND against the registry. `None` means the target
/// was unknown or the operation failed; the requester times out
/// rather than receiving a malformed reply.
pub(crate) fn handle_command(
    registry: &Registry,
    cmd: &CommandMessage,
) -> Option<CommandReplyMessage> {
    let details = match &cmd.details {
        CommandKind::ChoiceElements { id } => {
            let param = registry.parameter(id)?;
            let elements = param.lock().space_ids().to_vec();
            ReplyKind::ChoiceElements { elements }
        }
        CommandKind::CurrentPath { id } => {
            let space = registry.space(id)?;
            let path = space.lock().current_path();
            ReplyKind::Path { path }
        }
        CommandKind::RootPath { id } => {
            let space = registry.space(id)?;
            let path = space.lock().root_path().to_string();
            ReplyKind::Path { path }
        }
        CommandKind::Slice { id, field, dims } => {
            let pool = registry.data_pool(id)?;
            let result = pool.lock().get_slice(field, dims);
            match result {
                Ok(filename) => ReplyKind::Slice { filename },
                Err(e) => {
                    warn!(pool = %id, "slice command failed: {}", e);
                    return None;
                }
            }
        }
        CommandKind::CurrentFiles { id } => {
            let pool = registry.data_pool(id)?;
            let files = pool.lock().current_files();
            ReplyKind::CurrentFiles { files }
        }
    };
    Some(CommandReplyMessage {
        command_id: cmd.command_id,
        details,
    })
}
