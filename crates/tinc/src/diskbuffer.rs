// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Disk-backed data exchange.
//!
//! A [`DiskBuffer`] shares bulk data between peers through files: the
//! writer announces each finished file over the wire and readers load
//! it from disk. Round-robin naming keeps a bounded window of recent
//! files so a reader is never handed a file that is mid-write; in
//! file-lock mode a `.lock` marker additionally guards the one being
//! written.

use crate::error::TincError;
use crate::protocol::wire::{
    BufferType, ConfigureDiskBuffer, ConfigureObject, RegisterDiskBuffer, RegisterObject,
};
use crate::protocol::{Details, Envelope, MessageType, ObjectType, Outbound};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Parsed buffer contents, keyed by the buffer's declared type.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum BufferData {
    #[default]
    Empty,
    Json(serde_json::Value),
    Text(String),
    /// NetCDF, image and unrecognized payloads stay as raw bytes.
    Binary(Vec<u8>),
}

/// Shared handle to a disk buffer.
pub type DiskBufferRef = std::sync::Arc<parking_lot::Mutex<DiskBuffer>>;

/// A file-backed shared buffer with round-robin rotation.
pub struct DiskBuffer {
    id: String,
    buffer_type: BufferType,
    base_filename: String,
    path: PathBuf,
    round_robin_size: Option<usize>,
    round_robin_counter: usize,
    use_file_lock: bool,
    current_file: String,
    data: BufferData,
    outbound: Option<Outbound>,
}

impl DiskBuffer {
    /// Create a buffer writing `base_filename` under `path`. The
    /// content type is inferred from the filename extension.
    pub fn new(
        id: impl Into<String>,
        base_filename: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, TincError> {
        let id = id.into();
        crate::param::validate_identifier(&id)?;
        let base_filename = base_filename.into();
        if base_filename.is_empty() {
            return Err(TincError::Validation("empty base filename".into()));
        }
        Ok(Self {
            id,
            buffer_type: BufferType::from_extension(&base_filename),
            base_filename,
            path: path.into(),
            round_robin_size: None,
            round_robin_counter: 0,
            use_file_lock: false,
            current_file: String::new(),
            data: BufferData::Empty,
            outbound: None,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn buffer_type(&self) -> BufferType {
        self.buffer_type
    }

    pub fn base_filename(&self) -> &str {
        &self.base_filename
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current_file(&self) -> &str {
        &self.current_file
    }

    pub fn data(&self) -> &BufferData {
        &self.data
    }

    pub fn attach(&mut self, outbound: Outbound) {
        self.outbound = Some(outbound);
    }

    pub fn detach(&mut self) {
        self.outbound = None;
    }

    /// Guard each write with a `<file>.lock` marker. Off by default;
    /// rotation already keeps readers off the file being written.
    pub fn set_file_lock(&mut self, enabled: bool) {
        self.use_file_lock = enabled;
    }

    pub fn file_lock_enabled(&self) -> bool {
        self.use_file_lock
    }

    /// Rotate writes across `size` numbered files.
    pub fn enable_round_robin(&mut self, size: usize) -> Result<(), TincError> {
        if size == 0 {
            return Err(TincError::Validation("round robin window must be > 0".into()));
        }
        self.round_robin_size = Some(size);
        self.round_robin_counter = 0;
        Ok(())
    }

    fn split_base(&self) -> (&str, &str) {
        match self.base_filename.rsplit_once('.') {
            Some((stem, ext)) => (stem, ext),
            None => (self.base_filename.as_str(), ""),
        }
    }

    fn numbered_name(&self, index: usize) -> String {
        let (stem, ext) = self.split_base();
        if ext.is_empty() {
            format!("{}_{}", stem, index)
        } else {
            format!("{}_{}.{}", stem, index, ext)
        }
    }

    /// Reserve the next filename for writing. Creates the directory
    /// and, in file-lock mode, a `.lock` marker; advance happens here,
    /// so each call hands out a fresh slot.
    pub fn get_filename_for_writing(&mut self) -> Result<PathBuf, TincError> {
        let name = match self.round_robin_size {
            Some(size) => {
                let name = self.numbered_name(self.round_robin_counter);
                self.round_robin_counter = (self.round_robin_counter + 1) % size;
                name
            }
            None => self.base_filename.clone(),
        };
        fs::create_dir_all(&self.path)?;
        let full = self.path.join(&name);
        if self.use_file_lock {
            fs::write(lock_path(&full), b"")?;
        }
        Ok(full)
    }

    /// Is `name` currently locked by a writer?
    pub fn is_locked(&self, name: &str) -> bool {
        lock_path(&self.path.join(name)).exists()
    }

    /// Finish a write started with
    /// [`DiskBuffer::get_filename_for_writing`]: drop the lock, load
    /// the file as the current data and announce it to the peer.
    pub fn done_writing(&mut self, full_path: &Path) -> Result<(), TincError> {
        if self.use_file_lock {
            let lock = lock_path(full_path);
            if let Err(e) = fs::remove_file(&lock) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(TincError::Io(e));
                }
            }
        }
        let name = full_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TincError::Validation("path has no filename".into()))?;
        self.update_current_file(&name, true)
    }

    /// Apply a CONFIGURE from the writing peer.
    pub fn apply_update(&mut self, update: &ConfigureDiskBuffer) -> Result<(), TincError> {
        self.update_current_file(&update.current_file, false)
    }

    fn update_current_file(&mut self, name: &str, emit: bool) -> Result<(), TincError> {
        if name.is_empty() {
            self.current_file.clear();
            self.data = BufferData::Empty;
        } else {
            self.data = self.load_file(name)?;
            self.current_file = name.to_string();
        }
        if emit {
            self.emit_current_file();
        }
        Ok(())
    }

    fn load_file(&self, name: &str) -> Result<BufferData, TincError> {
        let full = self.path.join(name);
        debug!(buffer = %self.id, file = %full.display(), "loading");
        let bytes = fs::read(&full)?;
        Ok(match self.buffer_type {
            BufferType::Json => BufferData::Json(serde_json::from_slice(&bytes)?),
            BufferType::Text => BufferData::Text(String::from_utf8_lossy(&bytes).into_owned()),
            BufferType::Binary | BufferType::NetCdf | BufferType::Image => {
                BufferData::Binary(bytes)
            }
        })
    }

    /// Delete every numbered round-robin file (and stray locks) for
    /// this buffer.
    pub fn cleanup_round_robin_files(&self) -> Result<(), TincError> {
        let Some(size) = self.round_robin_size else {
            return Ok(());
        };
        for i in 0..size {
            let full = self.path.join(self.numbered_name(i));
            for victim in [lock_path(&full), full] {
                if let Err(e) = fs::remove_file(&victim) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(buffer = %self.id, "cleanup failed for {:?}: {}", victim, e);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn to_register(&self) -> RegisterObject {
        RegisterObject::DiskBuffer(RegisterDiskBuffer {
            id: self.id.clone(),
            buffer_type: self.buffer_type,
            base_filename: self.base_filename.clone(),
            path: self.path.to_string_lossy().into_owned(),
        })
    }

    fn emit_current_file(&self) {
        if let Some(tx) = &self.outbound {
            let env = Envelope::new(
                MessageType::Configure,
                ObjectType::DiskBuffer,
                Details::Configure(ConfigureObject::DiskBuffer(ConfigureDiskBuffer {
                    id: self.id.clone(),
                    current_file: self.current_file.clone(),
                })),
            );
            if tx.send(env).is_err() {
                warn!(buffer = %self.id, "peer channel closed, dropping configure");
            }
        }
    }
}

fn lock_path(file: &Path) -> PathBuf {
    let mut s = file.as_os_str().to_os_string();
    s.push(".lock");
    PathBuf::from(s)
}
