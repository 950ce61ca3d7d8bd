// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! TINC Distributed Parameter System
//!
//! Share live application state across processes over TCP:
//! - Typed parameters with bounds, discrete candidate spaces and
//!   change callbacks
//! - Parameter spaces that map parameter combinations to filesystem
//!   paths and drive exhaustive sweeps
//! - Content-addressed caching of computed results
//! - Parameter-indexed slicing over directory-structured data pools
//! - Round-robin disk buffers and external processor descriptors
//! - A client/server endpoint with request/reply correlation and
//!   cross-peer barriers
//!
//! # Quick Start
//!
//! ```no_run
//! use tinc::{Parameter, ParamValue, TincClient};
//!
//! # async fn run() -> Result<(), tinc::TincError> {
//! let client = TincClient::new();
//! client.connect("127.0.0.1", tinc::protocol::DEFAULT_PORT).await?;
//! let gain = client.register_parameter(
//!     Parameter::new("gain", ParamValue::Float(0.5))?,
//! );
//! gain.lock().set_value(ParamValue::Float(0.8))?;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod datapool;
pub mod diskbuffer;
pub mod endpoint;
pub mod error;
pub mod param;
pub mod processor;
pub mod protocol;
pub mod registry;

pub use cache::CacheManager;
pub use config::ServerConfig;
pub use datapool::{DataFile, DataPool, DataPoolRef};
pub use diskbuffer::{DiskBuffer, DiskBufferRef};
pub use endpoint::client::TincClient;
pub use endpoint::server::{PeerInfo, TincServer};
pub use endpoint::ConnectionState;
pub use error::TincError;
pub use param::space::{ParameterSpace, ProcessFunction, SpaceRef, SweepSettings};
pub use param::value::{DataType, ParamValue, SpaceRepresentation};
pub use param::{ParamRef, Parameter};
pub use processor::{Processor, ProcessorRef};
pub use registry::Registry;
