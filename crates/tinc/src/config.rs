// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Server configuration.
//!
//! Loaded from `tinc_server_config.json`; every field has a default
//! so a missing file just means defaults. The root path map rewrites
//! working paths between hosts that mount the same data at different
//! locations.

use crate::error::TincError;
use crate::protocol::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default configuration filename, looked up in the working directory.
pub const CONFIG_FILENAME: &str = "tinc_server_config.json";

/// Environment variable overriding where helper binaries live.
pub const BIN_DIR_ENV: &str = "TINC_BIN_DIR";

/// One prefix rewrite between a server-side and a client-side mount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathMapEntry {
    pub server_path: String,
    pub client_path: String,
}

/// Path rewrites for one client host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootPathMapping {
    pub host: String,
    #[serde(default)]
    pub entries: Vec<PathMapEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub root_path_map: Vec<RootPathMapping>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            root_path_map: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load from a JSON file.
    pub fn load(path: &Path) -> Result<Self, TincError> {
        let bytes = std::fs::read(path)?;
        let config: ServerConfig = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `tinc_server_config.json` from the working directory, or
    /// defaults when it does not exist.
    pub fn load_default() -> Result<Self, TincError> {
        let path = PathBuf::from(CONFIG_FILENAME);
        if path.exists() {
            Self::load(&path)
        } else {
            debug!("no {} found, using defaults", CONFIG_FILENAME);
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), TincError> {
        if self.port == 0 {
            return Err(TincError::Validation("port must be nonzero".into()));
        }
        for mapping in &self.root_path_map {
            if mapping.host.is_empty() {
                return Err(TincError::Validation(
                    "root path mapping needs a host".into(),
                ));
            }
            for entry in &mapping.entries {
                if entry.server_path.is_empty() || entry.client_path.is_empty() {
                    return Err(TincError::Validation(format!(
                        "empty path in mapping for host {:?}",
                        mapping.host
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Rewrite a server-side path for `host` using the longest
    /// matching prefix. Without a match the path passes through.
    pub fn translate_path(&self, path: &str, host: &str) -> String {
        let Some(mapping) = self.root_path_map.iter().find(|m| m.host == host) else {
            return path.to_string();
        };
        let best = mapping
            .entries
            .iter()
            .filter(|e| path.starts_with(&e.server_path))
            .max_by_key(|e| e.server_path.len());
        match best {
            Some(entry) => format!("{}{}", entry.client_path, &path[entry.server_path.len()..]),
            None => path.to_string(),
        }
    }
}

/// Where helper binaries live: `TINC_BIN_DIR` when set, otherwise the
/// bare name resolves through PATH.
pub fn resolve_binary(name: &str) -> PathBuf {
    match std::env::var(BIN_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => Path::new(&dir).join(name),
        _ => PathBuf::from(name),
    }
}
