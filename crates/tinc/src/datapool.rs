// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Parameter-indexed data pools.
//!
//! A [`DataPool`] maps the grid of a parameter space onto data files
//! on disk and extracts slices across one dimension: walk a
//! filesystem dimension by resolving the path template at each
//! candidate index, or read an internal dimension out of the file at
//! the current point. Slice files land in a cache directory under a
//! deterministic name, written to a temp file and renamed so readers
//! never observe a partial slice.

use crate::error::TincError;
use crate::param::space::SpaceRef;
use crate::protocol::wire::{
    ConfigureDataPool, ConfigureObject, RegisterDataPool, RegisterObject,
};
use crate::protocol::{Details, Envelope, MessageType, ObjectType, Outbound};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Reads one named field out of a pool data file.
pub trait PoolFileReader: Send + Sync {
    /// All values of `field`, in internal-dimension order. A scalar
    /// field yields one element.
    fn read_field(&self, path: &Path, field: &str) -> Result<Vec<f64>, TincError>;
}

/// Writes a finished slice.
pub trait SliceWriter: Send + Sync {
    fn write_slice(&self, path: &Path, field: &str, values: &[f64]) -> Result<(), TincError>;
}

/// JSON data files: an object mapping field names to a number or an
/// array of numbers.
pub struct JsonPoolFileReader;

impl PoolFileReader for JsonPoolFileReader {
    fn read_field(&self, path: &Path, field: &str) -> Result<Vec<f64>, TincError> {
        let bytes = fs::read(path)?;
        let doc: serde_json::Value = serde_json::from_slice(&bytes)?;
        let value = doc.get(field).ok_or_else(|| {
            TincError::Validation(format!("field {:?} not in {}", field, path.display()))
        })?;
        match value {
            serde_json::Value::Number(n) => Ok(vec![n.as_f64().unwrap_or(f64::NAN)]),
            serde_json::Value::Array(items) => items
                .iter()
                .map(|v| {
                    v.as_f64().ok_or_else(|| {
                        TincError::Validation(format!(
                            "non-numeric element in field {:?} of {}",
                            field,
                            path.display()
                        ))
                    })
                })
                .collect(),
            _ => Err(TincError::Validation(format!(
                "field {:?} in {} is not numeric",
                field,
                path.display()
            ))),
        }
    }
}

/// JSON slice files. The slice name contract keeps the `.nc`
/// extension regardless of the writer backend, so consumers address
/// slices uniformly.
pub struct JsonSliceWriter;

impl SliceWriter for JsonSliceWriter {
    fn write_slice(&self, path: &Path, field: &str, values: &[f64]) -> Result<(), TincError> {
        let doc = serde_json::json!({ "field": field, "values": values });
        fs::write(path, serde_json::to_vec(&doc)?)?;
        Ok(())
    }
}

/// Shared handle to a data pool.
pub type DataPoolRef = std::sync::Arc<parking_lot::Mutex<DataPool>>;

/// A data file expected in every grid-point directory, together with
/// the parameter whose index addresses positions inside the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataFile {
    pub filename: String,
    /// Id of the internal dimension laid out along the file's field
    /// vectors.
    pub dimension: String,
}

/// A pool of data files indexed by a parameter space.
pub struct DataPool {
    id: String,
    space: SpaceRef,
    slice_cache_dir: PathBuf,
    data_files: Vec<DataFile>,
    reader: Box<dyn PoolFileReader>,
    writer: Box<dyn SliceWriter>,
    outbound: Option<Outbound>,
}

impl DataPool {
    pub fn new(
        id: impl Into<String>,
        space: SpaceRef,
        slice_cache_dir: impl Into<PathBuf>,
    ) -> Result<Self, TincError> {
        let id = id.into();
        crate::param::validate_identifier(&id)?;
        Ok(Self {
            id,
            space,
            slice_cache_dir: slice_cache_dir.into(),
            data_files: Vec::new(),
            reader: Box::new(JsonPoolFileReader),
            writer: Box::new(JsonSliceWriter),
            outbound: None,
        })
    }

    /// Swap the file format backends.
    pub fn with_backends(
        mut self,
        reader: Box<dyn PoolFileReader>,
        writer: Box<dyn SliceWriter>,
    ) -> Self {
        self.reader = reader;
        self.writer = writer;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn space(&self) -> &SpaceRef {
        &self.space
    }

    pub fn slice_cache_dir(&self) -> &Path {
        &self.slice_cache_dir
    }

    pub fn set_slice_cache_dir(&mut self, dir: impl Into<PathBuf>) {
        self.slice_cache_dir = dir.into();
        self.emit_cache_dir();
    }

    pub fn apply_update(&mut self, update: &ConfigureDataPool) {
        self.slice_cache_dir = PathBuf::from(&update.slice_cache_dir);
    }

    pub fn attach(&mut self, outbound: Outbound) {
        self.outbound = Some(outbound);
    }

    pub fn detach(&mut self) {
        self.outbound = None;
    }

    /// Announce a data filename expected in every grid-point
    /// directory. `dimension` names the parameter laid out along the
    /// file's field vectors. Re-registering a filename updates its
    /// dimension.
    pub fn register_data_file(&mut self, filename: impl Into<String>, dimension: impl Into<String>) {
        let filename = filename.into();
        let dimension = dimension.into();
        if let Some(existing) = self.data_files.iter_mut().find(|f| f.filename == filename) {
            existing.dimension = dimension;
        } else {
            self.data_files.push(DataFile {
                filename,
                dimension,
            });
        }
    }

    pub fn data_files(&self) -> &[DataFile] {
        &self.data_files
    }

    /// Registered data files that exist at the current grid point.
    pub fn current_files(&self) -> Vec<String> {
        let dir = self.space.lock().current_path();
        self.data_files
            .iter()
            .map(|f| crate::param::space::join_paths(&dir, &f.filename))
            .filter(|full| Path::new(full).exists())
            .collect()
    }

    /// Extract a slice of `field` along the given dimensions and
    /// write it into the slice cache. Returns the slice filename.
    ///
    /// At most one filesystem dimension and one internal dimension
    /// per slice; the two may be combined, in which case the slice
    /// holds the filesystem values followed by the internal values in
    /// the order the dimensions were given. Two filesystem dimensions
    /// or two internal dimensions are rejected rather than guessed at.
    pub fn get_slice(&self, field: &str, dims: &[String]) -> Result<String, TincError> {
        if dims.is_empty() {
            return Err(TincError::Validation("slice needs a dimension".into()));
        }

        let (fs_dims, internal_dims): (Vec<&String>, Vec<&String>) = {
            let space = self.space.lock();
            for dim in dims {
                if space.get_parameter(dim).is_none() {
                    return Err(TincError::Validation(format!(
                        "dimension {:?} is not in space {}",
                        dim,
                        space.id()
                    )));
                }
            }
            dims.iter().partition(|d| space.is_filesystem_dimension(d))
        };
        if fs_dims.len() > 1 {
            return Err(TincError::Validation(format!(
                "slice spans {} filesystem dimensions, max 1",
                fs_dims.len()
            )));
        }
        if internal_dims.len() > 1 {
            return Err(TincError::Validation(format!(
                "slice spans {} internal dimensions, max 1",
                internal_dims.len()
            )));
        }

        let mut values = Vec::new();
        for dim in dims {
            if self.space.lock().is_filesystem_dimension(dim) {
                values.extend(self.filesystem_slice(field, dim)?);
            } else {
                values.extend(self.internal_slice(field)?);
            }
        }

        let name = self.slice_name(field, dims);
        fs::create_dir_all(&self.slice_cache_dir)?;
        let final_path = self.slice_cache_dir.join(&name);
        let tmp_path = self.slice_cache_dir.join(format!("{}.tmp", name));
        self.writer.write_slice(&tmp_path, field, &values)?;
        fs::rename(&tmp_path, &final_path)?;
        debug!(pool = %self.id, slice = %name, points = values.len(), "slice written");
        Ok(name)
    }

    // One value per candidate of the sliced parameter, read from that
    // candidate's directory at the current index of the file's
    // internal dimension. Repeated candidates are visited once by
    // stepping with the parameter's stride.
    fn filesystem_slice(&self, field: &str, dim: &str) -> Result<Vec<f64>, TincError> {
        let space = self.space.lock();
        let param = space.get_parameter(dim).ok_or_else(|| {
            TincError::Validation(format!("dimension {:?} is not in space {}", dim, space.id()))
        })?;
        let (len, stride) = {
            let p = param.lock();
            (p.space_values().len(), p.stride())
        };
        if len == 0 {
            return Err(TincError::Validation(format!(
                "dimension {:?} has an empty space",
                dim
            )));
        }

        let file = self.primary_file()?;
        let inner_index = match space.get_parameter(&file.dimension) {
            Some(p) => p.lock().current_index().unwrap_or(0),
            None => {
                warn!(
                    pool = %self.id,
                    file = %file.filename,
                    dimension = %file.dimension,
                    "file dimension not in space, reading index 0"
                );
                0
            }
        };

        let mut out = Vec::with_capacity(len / stride + 1);
        let mut index = 0usize;
        while index < len {
            let mut pinned = HashMap::new();
            pinned.insert(dim.to_string(), index);
            let rel = space.resolve_template_with(space.path_template(), &pinned);
            let dir = crate::param::space::join_paths(space.root_path(), &rel);
            let path = PathBuf::from(crate::param::space::join_paths(&dir, &file.filename));
            let values = self.reader.read_field(&path, field)?;
            out.push(pick_at(&values, inner_index, field, &path)?);
            index += stride;
        }
        Ok(out)
    }

    // All values of the field at the current grid point.
    fn internal_slice(&self, field: &str) -> Result<Vec<f64>, TincError> {
        let dir = self.space.lock().current_path();
        let file = self.primary_file()?;
        let path = PathBuf::from(crate::param::space::join_paths(&dir, &file.filename));
        self.reader.read_field(&path, field)
    }

    fn primary_file(&self) -> Result<DataFile, TincError> {
        self.data_files.first().cloned().ok_or_else(|| {
            TincError::Validation(format!("no data files registered in pool {}", self.id))
        })
    }

    /// Deterministic slice filename, filesystem-safe. The id and
    /// current value of every parameter not being sliced over are part
    /// of the name, so slices taken at different grid points never
    /// collide.
    fn slice_name(&self, field: &str, dims: &[String]) -> String {
        let mut raw = format!("{}_slice_{}_{}", self.id, field, dims.join("_"));
        let space = self.space.lock();
        for param in space.parameters() {
            let p = param.lock();
            if dims.iter().any(|d| d == p.id()) {
                continue;
            }
            raw.push('_');
            raw.push_str(p.id());
            raw.push('_');
            raw.push_str(&p.value().render());
        }
        raw.push('_');
        let mut name = sanitize_filename(&raw);
        name.push_str(".nc");
        name
    }

    pub fn to_register(&self) -> RegisterObject {
        RegisterObject::DataPool(RegisterDataPool {
            id: self.id.clone(),
            parameter_space_id: self.space.lock().id().to_string(),
            slice_cache_dir: self.slice_cache_dir.to_string_lossy().into_owned(),
        })
    }

    fn emit_cache_dir(&self) {
        if let Some(tx) = &self.outbound {
            let env = Envelope::new(
                MessageType::Configure,
                ObjectType::DataPool,
                Details::Configure(ConfigureObject::DataPool(ConfigureDataPool {
                    id: self.id.clone(),
                    slice_cache_dir: self.slice_cache_dir.to_string_lossy().into_owned(),
                })),
            );
            if tx.send(env).is_err() {
                warn!(pool = %self.id, "peer channel closed, dropping configure");
            }
        }
    }
}

// A single-element field is a scalar and ignores the index.
fn pick_at(values: &[f64], index: usize, field: &str, path: &Path) -> Result<f64, TincError> {
    if values.len() == 1 {
        return Ok(values[0]);
    }
    values.get(index).copied().ok_or_else(|| {
        TincError::Validation(format!(
            "index {} out of range for field {:?} ({} values) in {}",
            index,
            field,
            values.len(),
            path.display()
        ))
    })
}

/// Replace characters that are unsafe or shell-hostile in filenames.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '(' | ')' | '<' | '>' | '*' | '"' | '[' | ']' | '|' | ':' | ' ' | '/' | '\\' => '_',
            other => other,
        })
        .collect()
}
