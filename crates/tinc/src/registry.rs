// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Shared object registry.
//!
//! One collection per synchronizable object class. Registration is
//! idempotent on the id, so a REGISTER replay after reconnect leaves
//! existing objects (and their callbacks) untouched.

use crate::datapool::DataPoolRef;
use crate::diskbuffer::DiskBufferRef;
use crate::param::space::SpaceRef;
use crate::param::ParamRef;
use crate::processor::ProcessorRef;
use crate::protocol::wire::RegisterObject;
use crate::protocol::{Details, Envelope, MessageType, ObjectType, Outbound};
use parking_lot::RwLock;
use std::collections::HashMap;
use tracing::debug;

/// Holds every object shared over a connection.
#[derive(Default)]
pub struct Registry {
    /// Keyed by full address (`/<group>/<id>` or `/<id>`).
    parameters: RwLock<HashMap<String, ParamRef>>,
    spaces: RwLock<HashMap<String, SpaceRef>>,
    processors: RwLock<HashMap<String, ProcessorRef>>,
    disk_buffers: RwLock<HashMap<String, DiskBufferRef>>,
    data_pools: RwLock<HashMap<String, DataPoolRef>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Parameters
    // ------------------------------------------------------------------

    /// Register a parameter; an existing registration under the same
    /// address wins and is returned.
    pub fn add_parameter(&self, param: ParamRef) -> ParamRef {
        let address = param.lock().full_address();
        let mut map = self.parameters.write();
        if let Some(existing) = map.get(&address) {
            debug!(%address, "parameter already registered");
            return existing.clone();
        }
        map.insert(address, param.clone());
        param
    }

    /// Look up by full address, or by bare id when unambiguous.
    pub fn parameter(&self, key: &str) -> Option<ParamRef> {
        let map = self.parameters.read();
        if let Some(p) = map.get(key) {
            return Some(p.clone());
        }
        let mut matches = map.values().filter(|p| p.lock().id() == key);
        let first = matches.next().cloned();
        if matches.next().is_some() {
            debug!(id = %key, "ambiguous bare parameter id");
            return None;
        }
        first
    }

    pub fn remove_parameter(&self, key: &str) -> bool {
        let mut map = self.parameters.write();
        if map.remove(key).is_some() {
            return true;
        }
        let address = map
            .iter()
            .find(|(_, p)| p.lock().id() == key)
            .map(|(addr, _)| addr.clone());
        match address {
            Some(addr) => map.remove(&addr).is_some(),
            None => false,
        }
    }

    pub fn parameters(&self) -> Vec<ParamRef> {
        self.parameters.read().values().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Parameter spaces
    // ------------------------------------------------------------------

    pub fn add_space(&self, space: SpaceRef) -> SpaceRef {
        let id = space.lock().id().to_string();
        let mut map = self.spaces.write();
        if let Some(existing) = map.get(&id) {
            debug!(%id, "space already registered");
            return existing.clone();
        }
        map.insert(id, space.clone());
        space
    }

    pub fn space(&self, id: &str) -> Option<SpaceRef> {
        self.spaces.read().get(id).cloned()
    }

    pub fn remove_space(&self, id: &str) -> bool {
        self.spaces.write().remove(id).is_some()
    }

    pub fn spaces(&self) -> Vec<SpaceRef> {
        self.spaces.read().values().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Processors
    // ------------------------------------------------------------------

    pub fn add_processor(&self, processor: ProcessorRef) -> ProcessorRef {
        let id = processor.lock().id().to_string();
        let mut map = self.processors.write();
        if let Some(existing) = map.get(&id) {
            debug!(%id, "processor already registered");
            return existing.clone();
        }
        map.insert(id, processor.clone());
        processor
    }

    pub fn processor(&self, id: &str) -> Option<ProcessorRef> {
        self.processors.read().get(id).cloned()
    }

    pub fn remove_processor(&self, id: &str) -> bool {
        self.processors.write().remove(id).is_some()
    }

    pub fn processors(&self) -> Vec<ProcessorRef> {
        self.processors.read().values().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Disk buffers
    // ------------------------------------------------------------------

    pub fn add_disk_buffer(&self, buffer: DiskBufferRef) -> DiskBufferRef {
        let id = buffer.lock().id().to_string();
        let mut map = self.disk_buffers.write();
        if let Some(existing) = map.get(&id) {
            debug!(%id, "disk buffer already registered");
            return existing.clone();
        }
        map.insert(id, buffer.clone());
        buffer
    }

    pub fn disk_buffer(&self, id: &str) -> Option<DiskBufferRef> {
        self.disk_buffers.read().get(id).cloned()
    }

    pub fn remove_disk_buffer(&self, id: &str) -> bool {
        self.disk_buffers.write().remove(id).is_some()
    }

    pub fn disk_buffers(&self) -> Vec<DiskBufferRef> {
        self.disk_buffers.read().values().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Data pools
    // ------------------------------------------------------------------

    pub fn add_data_pool(&self, pool: DataPoolRef) -> DataPoolRef {
        let id = pool.lock().id().to_string();
        let mut map = self.data_pools.write();
        if let Some(existing) = map.get(&id) {
            debug!(%id, "data pool already registered");
            return existing.clone();
        }
        map.insert(id, pool.clone());
        pool
    }

    pub fn data_pool(&self, id: &str) -> Option<DataPoolRef> {
        self.data_pools.read().get(id).cloned()
    }

    pub fn remove_data_pool(&self, id: &str) -> bool {
        self.data_pools.write().remove(id).is_some()
    }

    pub fn data_pools(&self) -> Vec<DataPoolRef> {
        self.data_pools.read().values().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Cross-class operations
    // ------------------------------------------------------------------

    /// Remove any object by class and id. An empty id clears the
    /// whole class.
    pub fn remove(&self, object_type: ObjectType, id: &str) -> bool {
        if id.is_empty() {
            match object_type {
                ObjectType::Parameter => self.parameters.write().clear(),
                ObjectType::ParameterSpace => self.spaces.write().clear(),
                ObjectType::Processor => self.processors.write().clear(),
                ObjectType::DiskBuffer => self.disk_buffers.write().clear(),
                ObjectType::DataPool => self.data_pools.write().clear(),
                ObjectType::Global => return false,
            }
            return true;
        }
        match object_type {
            ObjectType::Parameter => self.remove_parameter(id),
            ObjectType::ParameterSpace => self.remove_space(id),
            ObjectType::Processor => self.remove_processor(id),
            ObjectType::DiskBuffer => self.remove_disk_buffer(id),
            ObjectType::DataPool => self.remove_data_pool(id),
            ObjectType::Global => false,
        }
    }

    /// REGISTER envelopes announcing every object of one class,
    /// answering a REQUEST.
    pub fn register_envelopes(&self, object_type: ObjectType) -> Vec<Envelope> {
        let payloads: Vec<RegisterObject> = match object_type {
            ObjectType::Parameter => self
                .parameters()
                .iter()
                .map(|p| p.lock().to_register())
                .collect(),
            ObjectType::ParameterSpace => self
                .spaces()
                .iter()
                .map(|s| s.lock().to_register())
                .collect(),
            ObjectType::Processor => self
                .processors()
                .iter()
                .map(|p| p.lock().to_register())
                .collect(),
            ObjectType::DiskBuffer => self
                .disk_buffers()
                .iter()
                .map(|b| b.lock().to_register())
                .collect(),
            ObjectType::DataPool => self
                .data_pools()
                .iter()
                .map(|p| p.lock().to_register())
                .collect(),
            ObjectType::Global => Vec::new(),
        };
        payloads
            .into_iter()
            .map(|reg| {
                Envelope::new(MessageType::Register, object_type, Details::Register(reg))
            })
            .collect()
    }

    /// Attach every registered object to a peer's outbound channel.
    pub fn attach_all(&self, outbound: &Outbound) {
        for p in self.parameters() {
            p.lock().attach(outbound.clone());
        }
        for s in self.spaces() {
            s.lock().attach(outbound.clone());
        }
        for p in self.processors() {
            p.lock().attach(outbound.clone());
        }
        for b in self.disk_buffers() {
            b.lock().attach(outbound.clone());
        }
        for p in self.data_pools() {
            p.lock().attach(outbound.clone());
        }
    }

    pub fn detach_all(&self) {
        for p in self.parameters() {
            p.lock().detach();
        }
        for s in self.spaces() {
            s.lock().detach();
        }
        for p in self.processors() {
            p.lock().detach();
        }
        for b in self.disk_buffers() {
            b.lock().detach();
        }
        for p in self.data_pools() {
            p.lock().detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::space::ParameterSpace;
    use crate::param::value::ParamValue;
    use crate::param::Parameter;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn param(id: &str, group: &str) -> ParamRef {
        let p = Parameter::new(id, ParamValue::Float(0.0))
            .unwrap()
            .with_group(group)
            .unwrap();
        Arc::new(Mutex::new(p))
    }

    #[test]
    fn test_parameter_registration_idempotent() {
        let reg = Registry::new();
        let first = reg.add_parameter(param("gain", "audio"));
        first.lock().set_value(ParamValue::Float(0.7)).unwrap();

        let returned = reg.add_parameter(param("gain", "audio"));
        // The existing instance survives a duplicate registration.
        assert_eq!(*returned.lock().value(), ParamValue::Float(0.7));
        assert_eq!(reg.parameters().len(), 1);
    }

    #[test]
    fn test_parameter_lookup_by_address_and_id() {
        let reg = Registry::new();
        reg.add_parameter(param("gain", "audio"));

        assert!(reg.parameter("/audio/gain").is_some());
        assert!(reg.parameter("gain").is_some());
        assert!(reg.parameter("/video/gain").is_none());
    }

    #[test]
    fn test_ambiguous_bare_id() {
        let reg = Registry::new();
        reg.add_parameter(param("gain", "audio"));
        reg.add_parameter(param("gain", "video"));

        assert!(reg.parameter("gain").is_none());
        assert!(reg.parameter("/audio/gain").is_some());
        assert!(reg.parameter("/video/gain").is_some());
    }

    #[test]
    fn test_remove_by_class() {
        let reg = Registry::new();
        reg.add_parameter(param("x", ""));
        reg.add_space(Arc::new(Mutex::new(ParameterSpace::new("ps").unwrap())));

        assert!(reg.remove(ObjectType::Parameter, "x"));
        assert!(!reg.remove(ObjectType::Parameter, "x"));
        assert!(reg.remove(ObjectType::ParameterSpace, "ps"));
        assert!(reg.parameters().is_empty());
        assert!(reg.spaces().is_empty());
    }

    #[test]
    fn test_remove_all_of_class() {
        let reg = Registry::new();
        reg.add_parameter(param("a", ""));
        reg.add_parameter(param("b", ""));
        assert!(reg.remove(ObjectType::Parameter, ""));
        assert!(reg.parameters().is_empty());
    }

    #[test]
    fn test_register_envelopes() {
        let reg = Registry::new();
        reg.add_parameter(param("a", "g"));
        reg.add_parameter(param("b", "g"));

        let envs = reg.register_envelopes(ObjectType::Parameter);
        assert_eq!(envs.len(), 2);
        for env in envs {
            assert_eq!(env.message_type, MessageType::Register);
            assert_eq!(env.object_type, ObjectType::Parameter);
        }
        assert!(reg.register_envelopes(ObjectType::DataPool).is_empty());
    }

    #[test]
    fn test_attach_all_wires_emission() {
        let reg = Registry::new();
        let p = reg.add_parameter(param("x", ""));

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        reg.attach_all(&tx);
        p.lock().set_value(ParamValue::Float(1.0)).unwrap();
        assert!(rx.try_recv().is_ok());

        reg.detach_all();
        p.lock().set_value(ParamValue::Float(2.0)).unwrap();
        assert!(rx.try_recv().is_err());
    }
}
