// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request/reply correlation.
//!
//! Every outgoing COMMAND gets a connection-unique id and a oneshot
//! completion; the reader task completes it when the matching
//! COMMAND_REPLY arrives. Timeouts evict the pending slot so a late
//! reply is dropped with a log line instead of resolving a stale
//! waiter.

use crate::error::TincError;
use crate::protocol::wire::{CommandKind, CommandMessage, ReplyKind};
use crate::protocol::{Details, Envelope, MessageType, ObjectType, Outbound};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Default time to wait for a reply.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Correlates COMMAND ids with their waiting callers.
#[derive(Default)]
pub struct CommandBroker {
    next_id: Mutex<u32>,
    pending: Mutex<HashMap<u32, oneshot::Sender<ReplyKind>>>,
}

impl CommandBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next correlation id. Wraps before `u32::MAX` and never hands
    /// out zero, which the wire treats as "no id".
    fn allocate_id(&self) -> u32 {
        let mut next = self.next_id.lock();
        *next = if *next >= u32::MAX - 1 { 1 } else { *next + 1 };
        *next
    }

    /// Register a waiter and get its id.
    pub fn register(&self) -> (u32, oneshot::Receiver<ReplyKind>) {
        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        (id, rx)
    }

    /// Resolve a waiter. Late or unknown replies are dropped.
    pub fn complete(&self, id: u32, reply: ReplyKind) {
        match self.pending.lock().remove(&id) {
            Some(tx) => {
                if tx.send(reply).is_err() {
                    debug!(command_id = id, "reply waiter went away");
                }
            }
            None => warn!(command_id = id, "dropping reply with no pending command"),
        }
    }

    fn evict(&self, id: u32) {
        self.pending.lock().remove(&id);
    }

    /// Fail every pending command, used on disconnect.
    pub fn fail_all(&self) {
        let count = {
            let mut pending = self.pending.lock();
            let count = pending.len();
            pending.clear();
            count
        };
        if count > 0 {
            debug!(count, "abandoned pending commands on disconnect");
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send `kind` over `outbound` and wait for the reply.
    pub async fn send_command(
        &self,
        outbound: &Outbound,
        object_type: ObjectType,
        kind: CommandKind,
        timeout: Duration,
    ) -> Result<ReplyKind, TincError> {
        let (id, rx) = self.register();
        let envelope = Envelope::new(
            MessageType::Command,
            object_type,
            Details::Command(CommandMessage {
                command_id: id,
                details: kind,
            }),
        );
        if outbound.send(envelope).is_err() {
            self.evict(id);
            return Err(TincError::Disconnected);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                // The broker side was dropped (disconnect).
                Err(TincError::Disconnected)
            }
            Err(_) => {
                self.evict(id);
                Err(TincError::CommandTimeout(timeout))
            }
        }
    }
}
