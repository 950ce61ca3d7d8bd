// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire payload schemas.
//!
//! Every payload is a serde struct; internal types convert through
//! `From`/`TryFrom` so the wire shape can evolve without leaking into
//! the object model.

use crate::error::TincError;
use crate::param::value::{DataType, ParamValue};
use crate::protocol::ObjectType;
use serde::{Deserialize, Serialize};

/// REQUEST / REMOVE payload. An empty id addresses every object of
/// the envelope's object type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectId {
    #[serde(default)]
    pub id: String,
}

/// A typed scalar (or list) value on the wire. Carries the type tag
/// alongside the value; choice and bitmask kinds use the unsigned
/// 64-bit field, color/vector use the repeated list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterValueWire {
    pub data_type: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_float: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_int: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_uint: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_bool: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_list: Option<Vec<ParameterValueWire>>,
}

impl ParameterValueWire {
    fn empty(data_type: DataType) -> Self {
        Self {
            data_type: data_type.as_u16(),
            value_float: None,
            value_int: None,
            value_uint: None,
            value_bool: None,
            value_string: None,
            value_list: None,
        }
    }
}

impl From<&ParamValue> for ParameterValueWire {
    fn from(v: &ParamValue) -> Self {
        let mut wire = Self::empty(v.data_type());
        match v {
            ParamValue::Float(x) => wire.value_float = Some(f64::from(*x)),
            ParamValue::Double(x) => wire.value_float = Some(*x),
            ParamValue::Int8(x) => wire.value_int = Some(i64::from(*x)),
            ParamValue::Int16(x) => wire.value_int = Some(i64::from(*x)),
            ParamValue::Int32(x) => wire.value_int = Some(i64::from(*x)),
            ParamValue::Int64(x) => wire.value_int = Some(*x),
            ParamValue::UInt8(x) => wire.value_uint = Some(u64::from(*x)),
            ParamValue::UInt16(x) => wire.value_uint = Some(u64::from(*x)),
            ParamValue::UInt32(x) => wire.value_uint = Some(u64::from(*x)),
            ParamValue::UInt64(x) | ParamValue::Choice(x) => wire.value_uint = Some(*x),
            ParamValue::Bool(x) | ParamValue::Trigger(x) => wire.value_bool = Some(*x),
            ParamValue::String(x) => wire.value_string = Some(x.clone()),
            ParamValue::Color(c) => {
                wire.value_list = Some(
                    c.iter()
                        .map(|f| (&ParamValue::Float(*f)).into())
                        .collect(),
                );
            }
            ParamValue::Vector(v) => {
                wire.value_list = Some(
                    v.iter()
                        .map(|f| (&ParamValue::Float(*f)).into())
                        .collect(),
                );
            }
        }
        wire
    }
}

impl TryFrom<&ParameterValueWire> for ParamValue {
    type Error = TincError;

    fn try_from(wire: &ParameterValueWire) -> Result<Self, Self::Error> {
        let dt = DataType::from_u16(wire.data_type)
            .ok_or_else(|| TincError::Validation(format!("unknown data type {}", wire.data_type)))?;

        let missing = || TincError::Validation(format!("missing value for {:?}", dt));
        let float = || wire.value_float.ok_or_else(missing);
        let int = || wire.value_int.ok_or_else(missing);
        let uint = || wire.value_uint.ok_or_else(missing);
        let boolean = || wire.value_bool.ok_or_else(missing);

        Ok(match dt {
            DataType::Float32 => ParamValue::Float(float()? as f32),
            DataType::Float64 => ParamValue::Double(float()?),
            DataType::Int8 => ParamValue::Int8(int()? as i8),
            DataType::Int16 => ParamValue::Int16(int()? as i16),
            DataType::Int32 => ParamValue::Int32(int()? as i32),
            DataType::Int64 => ParamValue::Int64(int()?),
            DataType::UInt8 => ParamValue::UInt8(uint()? as u8),
            DataType::UInt16 => ParamValue::UInt16(uint()? as u16),
            DataType::UInt32 => ParamValue::UInt32(uint()? as u32),
            DataType::UInt64 => ParamValue::UInt64(uint()?),
            DataType::Bool => ParamValue::Bool(boolean()?),
            DataType::Trigger => ParamValue::Trigger(boolean()?),
            DataType::String => {
                ParamValue::String(wire.value_string.clone().ok_or_else(missing)?)
            }
            DataType::Choice => ParamValue::Choice(uint()?),
            DataType::Color => {
                let list = wire.value_list.as_ref().ok_or_else(missing)?;
                if list.len() != 4 {
                    return Err(TincError::Validation(format!(
                        "color needs 4 components, got {}",
                        list.len()
                    )));
                }
                let mut c = [0.0f32; 4];
                for (i, w) in list.iter().enumerate() {
                    c[i] = w.value_float.ok_or_else(missing)? as f32;
                }
                ParamValue::Color(c)
            }
            DataType::Vector => {
                let list = wire.value_list.as_ref().ok_or_else(missing)?;
                let mut v = Vec::with_capacity(list.len());
                for w in list {
                    v.push(w.value_float.ok_or_else(missing)? as f32);
                }
                ParamValue::Vector(v)
            }
        })
    }
}

/// DiskBuffer content type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferType {
    Binary,
    Text,
    Json,
    NetCdf,
    Image,
}

impl BufferType {
    /// Pick the type from a filename extension (reader side).
    pub fn from_extension(filename: &str) -> Self {
        match filename.rsplit('.').next().unwrap_or("") {
            "json" => Self::Json,
            "nc" => Self::NetCdf,
            "txt" => Self::Text,
            "png" | "jpg" | "jpeg" | "bmp" => Self::Image,
            _ => Self::Binary,
        }
    }
}

/// REGISTER payloads, one shape per object class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "object", rename_all = "snake_case")]
pub enum RegisterObject {
    Parameter(RegisterParameter),
    ParameterSpace(RegisterParameterSpace),
    Processor(RegisterProcessor),
    DiskBuffer(RegisterDiskBuffer),
    DataPool(RegisterDataPool),
}

impl RegisterObject {
    pub fn object_type(&self) -> ObjectType {
        match self {
            Self::Parameter(_) => ObjectType::Parameter,
            Self::ParameterSpace(_) => ObjectType::ParameterSpace,
            Self::Processor(_) => ObjectType::Processor,
            Self::DiskBuffer(_) => ObjectType::DiskBuffer,
            Self::DataPool(_) => ObjectType::DataPool,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Parameter(r) => &r.id,
            Self::ParameterSpace(r) => &r.id,
            Self::Processor(r) => &r.id,
            Self::DiskBuffer(r) => &r.id,
            Self::DataPool(r) => &r.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterParameter {
    pub id: String,
    #[serde(default)]
    pub group: String,
    pub default_value: ParameterValueWire,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<ParameterValueWire>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<ParameterValueWire>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterParameterSpace {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterProcessor {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDiskBuffer {
    pub id: String,
    pub buffer_type: BufferType,
    pub base_filename: String,
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterDataPool {
    pub id: String,
    pub parameter_space_id: String,
    #[serde(default)]
    pub slice_cache_dir: String,
}

/// CONFIGURE payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "object", rename_all = "snake_case")]
pub enum ConfigureObject {
    Parameter(ConfigureParameter),
    ParameterSpace(ConfigureParameterSpace),
    Processor(ConfigureProcessor),
    DiskBuffer(ConfigureDiskBuffer),
    DataPool(ConfigureDataPool),
}

impl ConfigureObject {
    pub fn object_type(&self) -> ObjectType {
        match self {
            Self::Parameter(_) => ObjectType::Parameter,
            Self::ParameterSpace(_) => ObjectType::ParameterSpace,
            Self::Processor(_) => ObjectType::Processor,
            Self::DiskBuffer(_) => ObjectType::DiskBuffer,
            Self::DataPool(_) => ObjectType::DataPool,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Parameter(c) => &c.id,
            Self::ParameterSpace(c) => &c.id,
            Self::Processor(c) => &c.id,
            Self::DiskBuffer(c) => &c.id,
            Self::DataPool(c) => &c.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigureParameter {
    pub id: String,
    pub update: ParameterUpdate,
}

/// One parameter field mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum ParameterUpdate {
    Value { value: ParameterValueWire },
    Min { value: ParameterValueWire },
    Max { value: ParameterValueWire },
    Space {
        values: Vec<ParameterValueWire>,
        #[serde(default)]
        ids: Vec<String>,
    },
    SpaceRepresentation { mode: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigureParameterSpace {
    pub id: String,
    pub update: SpaceUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum SpaceUpdate {
    AddParameter { address: String },
    RemoveParameter { address: String },
    RootPath { path: String },
    PathTemplate { template: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigureProcessor {
    pub id: String,
    pub update: ProcessorUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum ProcessorUpdate {
    CommandLine { command_line: String },
    RunningDirectory { path: String },
    Enabled { enabled: bool },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigureDiskBuffer {
    pub id: String,
    /// New current filename; empty clears the buffer.
    #[serde(default)]
    pub current_file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigureDataPool {
    pub id: String,
    pub slice_cache_dir: String,
}

/// COMMAND payload with its correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMessage {
    pub command_id: u32,
    pub details: CommandKind,
}

/// The defined request/reply commands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum CommandKind {
    /// PARAMETER: the element names of a choice parameter.
    ChoiceElements { id: String },
    /// PARAMETER_SPACE: template resolved at current indices.
    CurrentPath { id: String },
    /// PARAMETER_SPACE: the space's root path.
    RootPath { id: String },
    /// DATA_POOL: produce a slice file.
    Slice {
        id: String,
        field: String,
        dims: Vec<String>,
    },
    /// DATA_POOL: data files at the current resolved path.
    CurrentFiles { id: String },
}

impl CommandKind {
    pub fn target_id(&self) -> &str {
        match self {
            Self::ChoiceElements { id }
            | Self::CurrentPath { id }
            | Self::RootPath { id }
            | Self::Slice { id, .. }
            | Self::CurrentFiles { id } => id,
        }
    }
}

/// COMMAND_REPLY payload; the shape is fixed by the originating command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandReplyMessage {
    pub command_id: u32,
    pub details: ReplyKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum ReplyKind {
    ChoiceElements { elements: Vec<String> },
    Path { path: String },
    Slice { filename: String },
    CurrentFiles { files: Vec<String> },
}

/// Barrier correlation id, shared by all three barrier messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrierNonce {
    pub request_id: u32,
}

/// Peer availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PeerStatus {
    #[default]
    Unknown = 0,
    Available = 1,
    Busy = 2,
}

impl PeerStatus {
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn from_u16(v: u16) -> Self {
        match v {
            1 => Self::Available,
            2 => Self::Busy,
            _ => Self::Unknown,
        }
    }
}

/// STATUS payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status: u16,
}

impl StatusMessage {
    pub fn new(status: PeerStatus) -> Self {
        Self {
            status: status.as_u16(),
        }
    }

    pub fn status(&self) -> PeerStatus {
        PeerStatus::from_u16(self.status)
    }
}

/// TINC_WORKING_PATH payload. `host` lets the receiver apply its
/// root-path translation map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TincPath {
    pub path: String,
    #[serde(default)]
    pub host: String,
}

/// TINC_CLIENT_METADATA payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMetaData {
    pub hostname: String,
}
