// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Parameter model.
//!
//! A [`Parameter`] is a named, typed, observable value with an
//! optional discrete candidate space. Local mutations clamp and snap,
//! notify registered callbacks, and emit CONFIGURE envelopes when the
//! parameter is attached to a peer. Mutations received from a peer
//! apply the same rules but never re-emit.

pub mod space;
pub mod value;

use crate::error::TincError;
use crate::protocol::wire::{
    ConfigureObject, ConfigureParameter, ParameterUpdate, ParameterValueWire, RegisterObject,
    RegisterParameter,
};
use crate::protocol::{Details, Envelope, MessageType, ObjectType, Outbound};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::warn;
use value::{nearest_index, ParamValue, SpaceRepresentation};

/// Callback invoked with the parameter's new value.
pub type ParamCallback = Arc<dyn Fn(&ParamValue) + Send + Sync>;

/// Shared handle to a parameter. Spaces, processors and the endpoint
/// registry all hold the same instance.
pub type ParamRef = Arc<parking_lot::Mutex<Parameter>>;

struct CallbackEntry {
    token: String,
    f: ParamCallback,
    synchronous: bool,
}

/// Check an object identifier: printable ASCII, no whitespace, none
/// of the OSC-reserved characters.
pub fn validate_identifier(id: &str) -> Result<(), TincError> {
    const RESERVED: &[char] = &[':', '#', '*', ',', '/', '?', '[', ']', '{', '}'];
    if id.is_empty() {
        return Err(TincError::Validation("empty identifier".into()));
    }
    for c in id.chars() {
        if !c.is_ascii_graphic() || RESERVED.contains(&c) {
            return Err(TincError::Validation(format!(
                "invalid character {:?} in identifier {:?}",
                c, id
            )));
        }
    }
    Ok(())
}

/// A named, typed, observable value with a discrete candidate space.
pub struct Parameter {
    id: String,
    group: String,
    value: ParamValue,
    default: ParamValue,
    min: ParamValue,
    max: ParamValue,
    space_values: Vec<ParamValue>,
    space_ids: Vec<String>,
    space_repr: SpaceRepresentation,
    callbacks: Vec<CallbackEntry>,
    outbound: Option<Outbound>,
}

impl Parameter {
    /// Create a parameter with kind-wide bounds.
    pub fn new(id: impl Into<String>, default: ParamValue) -> Result<Self, TincError> {
        let id = id.into();
        validate_identifier(&id)?;
        let min = default.with_f64(f64::MIN);
        let max = default.with_f64(f64::MAX);
        Ok(Self {
            id,
            group: String::new(),
            value: default.clone(),
            default,
            min,
            max,
            space_values: Vec::new(),
            space_ids: Vec::new(),
            space_repr: SpaceRepresentation::default(),
            callbacks: Vec::new(),
            outbound: None,
        })
    }

    /// Assign the parameter's group.
    pub fn with_group(mut self, group: impl Into<String>) -> Result<Self, TincError> {
        let group = group.into();
        if !group.is_empty() {
            validate_identifier(&group)?;
        }
        self.group = group;
        Ok(self)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Full OSC-style address: `/<group>/<id>`, group omitted when empty.
    pub fn full_address(&self) -> String {
        if self.group.is_empty() {
            format!("/{}", self.id)
        } else {
            format!("/{}/{}", self.group, self.id)
        }
    }

    pub fn value(&self) -> &ParamValue {
        &self.value
    }

    pub fn default_value(&self) -> &ParamValue {
        &self.default
    }

    pub fn min(&self) -> &ParamValue {
        &self.min
    }

    pub fn max(&self) -> &ParamValue {
        &self.max
    }

    pub fn space_values(&self) -> &[ParamValue] {
        &self.space_values
    }

    pub fn space_ids(&self) -> &[String] {
        &self.space_ids
    }

    pub fn space_representation(&self) -> SpaceRepresentation {
        self.space_repr
    }

    /// Leading-repeat stride of the candidate list (>= 1).
    pub fn stride(&self) -> usize {
        value::stride(&self.space_values)
    }

    /// Attach the outbound envelope channel of a connected peer.
    pub fn attach(&mut self, outbound: Outbound) {
        self.outbound = Some(outbound);
    }

    pub fn detach(&mut self) {
        self.outbound = None;
    }

    // ------------------------------------------------------------------
    // Value mutation
    // ------------------------------------------------------------------

    /// Set the value: clamp to `[min, max]`, snap to the nearest space
    /// candidate, store, emit CONFIGURE(VALUE) to an attached peer, and
    /// run callbacks when the stored value changed.
    ///
    /// Trigger parameters fire on a true transition and snap back to
    /// false; the emitted CONFIGURE carries the true edge.
    pub fn set_value(&mut self, v: ParamValue) -> Result<(), TincError> {
        self.set_value_inner(v, true)
    }

    /// Apply a value received from a peer. Same semantics as
    /// [`Parameter::set_value`] but never re-emits.
    pub fn apply_value(&mut self, v: ParamValue) -> Result<(), TincError> {
        self.set_value_inner(v, false)
    }

    fn set_value_inner(&mut self, v: ParamValue, emit: bool) -> Result<(), TincError> {
        if v.data_type() != self.default.data_type() {
            return Err(TincError::Validation(format!(
                "type mismatch for {}: expected {:?}, got {:?}",
                self.id,
                self.default.data_type(),
                v.data_type()
            )));
        }

        if let ParamValue::Trigger(fired) = v {
            if fired {
                if emit {
                    self.emit_value(&ParamValue::Trigger(true));
                }
                self.run_callbacks(&ParamValue::Trigger(true));
            }
            self.value = ParamValue::Trigger(false);
            return Ok(());
        }

        let mut next = v.clamped(&self.min, &self.max);
        if !self.space_values.is_empty() {
            if let Some(num) = next.as_f64() {
                if let Some(i) = nearest_index(&self.space_values, num) {
                    next = self.space_values[i].clone();
                }
            }
        }

        if next != self.value {
            self.value = next.clone();
            if emit {
                self.emit_value(&next);
            }
            self.run_callbacks(&next);
        }
        Ok(())
    }

    /// Set the lower bound and re-clamp the current value.
    pub fn set_min(&mut self, min: ParamValue) -> Result<(), TincError> {
        self.set_bound(min, true, true)
    }

    /// Set the upper bound and re-clamp the current value.
    pub fn set_max(&mut self, max: ParamValue) -> Result<(), TincError> {
        self.set_bound(max, false, true)
    }

    pub fn apply_min(&mut self, min: ParamValue) -> Result<(), TincError> {
        self.set_bound(min, true, false)
    }

    pub fn apply_max(&mut self, max: ParamValue) -> Result<(), TincError> {
        self.set_bound(max, false, false)
    }

    fn set_bound(&mut self, bound: ParamValue, lower: bool, emit: bool) -> Result<(), TincError> {
        if bound.as_f64().is_none() {
            return Err(TincError::Validation(format!(
                "non-numeric bound for {}",
                self.id
            )));
        }
        if lower {
            self.min = bound;
        } else {
            self.max = bound;
        }
        if emit {
            let update = if lower {
                ParameterUpdate::Min {
                    value: (&self.min).into(),
                }
            } else {
                ParameterUpdate::Max {
                    value: (&self.max).into(),
                }
            };
            self.emit_update(update);
        }
        let current = self.value.clone();
        self.set_value_inner(current, emit)
    }

    // ------------------------------------------------------------------
    // Space mutation
    // ------------------------------------------------------------------

    /// Replace the candidate space. The scalar type tag is inferred
    /// from the elements; bounds are recomputed from the space; the
    /// current value re-clamps; CONFIGURE(SPACE) is emitted.
    pub fn set_values(&mut self, values: Vec<ParamValue>) -> Result<(), TincError> {
        self.set_values_inner(values, true)
    }

    pub fn apply_values(&mut self, values: Vec<ParamValue>) -> Result<(), TincError> {
        self.set_values_inner(values, false)
    }

    fn set_values_inner(&mut self, values: Vec<ParamValue>, emit: bool) -> Result<(), TincError> {
        if let Some(first) = values.first() {
            let tag = first.data_type();
            if values.iter().any(|v| v.data_type() != tag) {
                return Err(TincError::Validation(format!(
                    "mixed element types in space for {}",
                    self.id
                )));
            }
        }

        if !self.space_ids.is_empty() && self.space_ids.len() != values.len() {
            warn!(
                parameter = %self.id,
                "space length changed from {} to {}, dropping ids",
                self.space_ids.len(),
                values.len()
            );
            self.space_ids.clear();
        }

        self.space_values = values;

        // The space defines the usable range.
        if !self.space_values.is_empty() {
            let lo = self
                .space_values
                .iter()
                .filter_map(ParamValue::as_f64)
                .fold(f64::INFINITY, f64::min);
            let hi = self
                .space_values
                .iter()
                .filter_map(ParamValue::as_f64)
                .fold(f64::NEG_INFINITY, f64::max);
            if lo.is_finite() && hi.is_finite() {
                self.min = self.value.with_f64(lo);
                self.max = self.value.with_f64(hi);
            }
        }

        let current = self.value.clone();
        self.set_value_inner(current, emit)?;

        if emit {
            self.emit_update(ParameterUpdate::Space {
                values: self.space_values.iter().map(Into::into).collect(),
                ids: self.space_ids.clone(),
            });
        }
        Ok(())
    }

    /// Set the parallel id list. Rejected when the length does not
    /// match the candidate list.
    pub fn set_ids(&mut self, ids: Vec<String>) -> Result<(), TincError> {
        self.set_ids_inner(ids, true)
    }

    pub fn apply_ids(&mut self, ids: Vec<String>) -> Result<(), TincError> {
        self.set_ids_inner(ids, false)
    }

    fn set_ids_inner(&mut self, ids: Vec<String>, emit: bool) -> Result<(), TincError> {
        if ids.len() != self.space_values.len() {
            return Err(TincError::Validation(format!(
                "id list length {} does not match space length {} for {}",
                ids.len(),
                self.space_values.len(),
                self.id
            )));
        }
        self.space_ids = ids;
        if emit {
            self.emit_update(ParameterUpdate::Space {
                values: self.space_values.iter().map(Into::into).collect(),
                ids: self.space_ids.clone(),
            });
        }
        Ok(())
    }

    /// Set how the parameter renders in path templates.
    pub fn set_space_representation(&mut self, mode: SpaceRepresentation) {
        self.space_repr = mode;
        self.emit_update(ParameterUpdate::SpaceRepresentation {
            mode: mode.name().into(),
        });
    }

    pub fn apply_space_representation(&mut self, mode: SpaceRepresentation) {
        self.space_repr = mode;
    }

    // ------------------------------------------------------------------
    // Space traversal
    // ------------------------------------------------------------------

    /// Index of the current value in the candidate space.
    pub fn current_index(&self) -> Option<usize> {
        if self.space_values.is_empty() {
            return None;
        }
        if let Some(i) = self.space_values.iter().position(|v| *v == self.value) {
            return Some(i);
        }
        self.value
            .as_f64()
            .and_then(|v| nearest_index(&self.space_values, v))
    }

    /// Id at the current index, when ids are present.
    pub fn current_id(&self) -> Option<&str> {
        self.current_index()
            .and_then(|i| self.space_ids.get(i))
            .map(String::as_str)
    }

    /// Set the value to the candidate at `index`.
    pub fn set_at(&mut self, index: usize) -> Result<(), TincError> {
        let v = self
            .space_values
            .get(index)
            .cloned()
            .ok_or_else(|| {
                TincError::Validation(format!(
                    "index {} out of range for space of {} ({})",
                    index,
                    self.id,
                    self.space_values.len()
                ))
            })?;
        self.set_value(v)
    }

    /// Step forward through the space by one stride.
    pub fn next(&mut self) -> Result<(), TincError> {
        let Some(i) = self.current_index() else {
            return Ok(());
        };
        let last = self.space_values.len() - 1;
        self.set_at((i + self.stride()).min(last))
    }

    /// Step backward through the space by one stride.
    pub fn previous(&mut self) -> Result<(), TincError> {
        let Some(i) = self.current_index() else {
            return Ok(());
        };
        self.set_at(i.saturating_sub(self.stride()))
    }

    /// Render the value at `index` (or the current index) per the
    /// requested representation.
    pub fn render_at(
        &self,
        mode: SpaceRepresentation,
        index: Option<usize>,
    ) -> Option<String> {
        match mode {
            SpaceRepresentation::Value => match index {
                Some(i) => self.space_values.get(i).map(ParamValue::render),
                None => Some(self.value.render()),
            },
            SpaceRepresentation::Index => {
                let i = index.or_else(|| self.current_index())?;
                Some(i.to_string())
            }
            SpaceRepresentation::Id => {
                let i = index.or_else(|| self.current_index())?;
                self.space_ids.get(i).cloned()
            }
        }
    }

    // ------------------------------------------------------------------
    // Callbacks
    // ------------------------------------------------------------------

    /// Register a callback under a caller-supplied token. Registering
    /// the same token again replaces the previous callback, keeping
    /// re-registration idempotent.
    pub fn register_callback(
        &mut self,
        token: impl Into<String>,
        f: ParamCallback,
        synchronous: bool,
    ) {
        let token = token.into();
        self.callbacks.retain(|cb| cb.token != token);
        self.callbacks.push(CallbackEntry {
            token,
            f,
            synchronous,
        });
    }

    pub fn remove_callback(&mut self, token: &str) {
        self.callbacks.retain(|cb| cb.token != token);
    }

    pub fn clear_callbacks(&mut self) {
        self.callbacks.clear();
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks.len()
    }

    fn run_callbacks(&self, v: &ParamValue) {
        for cb in &self.callbacks {
            if cb.synchronous {
                let f = &cb.f;
                if catch_unwind(AssertUnwindSafe(|| f(v))).is_err() {
                    warn!(parameter = %self.id, token = %cb.token, "callback panicked");
                }
            } else {
                // Detached; the setter never waits for it.
                let f = Arc::clone(&cb.f);
                let value = v.clone();
                let id = self.id.clone();
                let token = cb.token.clone();
                std::thread::spawn(move || {
                    if catch_unwind(AssertUnwindSafe(|| f(&value))).is_err() {
                        warn!(parameter = %id, token = %token, "async callback panicked");
                    }
                });
            }
        }
    }

    // ------------------------------------------------------------------
    // Wire integration
    // ------------------------------------------------------------------

    /// The REGISTER payload announcing this parameter.
    pub fn to_register(&self) -> RegisterObject {
        RegisterObject::Parameter(RegisterParameter {
            id: self.id.clone(),
            group: self.group.clone(),
            default_value: (&self.default).into(),
            min: Some((&self.min).into()),
            max: Some((&self.max).into()),
        })
    }

    /// Apply one CONFIGURE field mutation from a peer. Returns false
    /// (after logging) when the mutation is rejected.
    pub fn apply_update(&mut self, update: &ParameterUpdate) -> bool {
        let result = match update {
            ParameterUpdate::Value { value } => ParamValue::try_from(value)
                .and_then(|v| self.apply_value(v)),
            ParameterUpdate::Min { value } => ParamValue::try_from(value)
                .and_then(|v| self.apply_min(v)),
            ParameterUpdate::Max { value } => ParamValue::try_from(value)
                .and_then(|v| self.apply_max(v)),
            ParameterUpdate::Space { values, ids } => {
                let parsed: Result<Vec<ParamValue>, _> =
                    values.iter().map(ParamValue::try_from).collect();
                parsed.and_then(|vs| {
                    self.apply_values(vs)?;
                    if ids.is_empty() {
                        Ok(())
                    } else {
                        self.apply_ids(ids.clone())
                    }
                })
            }
            ParameterUpdate::SpaceRepresentation { mode } => {
                match SpaceRepresentation::from_name(mode) {
                    Some(m) => {
                        self.apply_space_representation(m);
                        Ok(())
                    }
                    None => Err(TincError::Validation(format!(
                        "unknown space representation {:?}",
                        mode
                    ))),
                }
            }
        };

        if let Err(e) = result {
            warn!(parameter = %self.id, "rejected configure: {}", e);
            false
        } else {
            true
        }
    }

    fn emit_value(&self, v: &ParamValue) {
        self.emit_update(ParameterUpdate::Value {
            value: ParameterValueWire::from(v),
        });
    }

    fn emit_update(&self, update: ParameterUpdate) {
        if let Some(tx) = &self.outbound {
            let env = Envelope::new(
                MessageType::Configure,
                ObjectType::Parameter,
                Details::Configure(ConfigureObject::Parameter(ConfigureParameter {
                    id: self.id.clone(),
                    update,
                })),
            );
            if tx.send(env).is_err() {
                warn!(parameter = %self.id, "peer channel closed, dropping configure");
            }
        }
    }
}
