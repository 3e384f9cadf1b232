//! Host registry - coordinates machine definitions and running instances.

use crate::error::EngineError;
use crate::event::Event;
use crate::instance::{MachineInstance, Phase};
use crate::selector::Selector;
use crate::trace::StepOutcome;
use dashmap::DashMap;
use harel_model::Machine;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Point-in-time view of one instance, for introspection surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub instance_id: String,
    pub machine: String,
    pub version: u32,
    pub phase: Phase,
    pub configuration: Vec<String>,
    pub queued_events: Vec<String>,
    pub history: Vec<(String, Vec<String>)>,
    pub ctx: Value,
}

/// Shared registry of machine definitions and instances.
pub struct Host {
    /// Machine definitions indexed by (name, version).
    machines: DashMap<(String, u32), Arc<Machine>>,

    /// Instances indexed by ID.
    instances: DashMap<String, RwLock<MachineInstance>>,
}

impl Default for Host {
    fn default() -> Self {
        Self::new()
    }
}

impl Host {
    pub fn new() -> Self {
        Self {
            machines: DashMap::new(),
            instances: DashMap::new(),
        }
    }

    /// Registers a machine definition. Re-registering the same (name,
    /// version) with an identical checksum is an idempotent success;
    /// a different definition under an existing version is an error.
    ///
    /// Returns (checksum, created).
    pub fn put_machine(&self, definition_json: &Value) -> Result<(String, bool), EngineError> {
        let machine = Machine::from_json(definition_json).map_err(EngineError::Model)?;
        let key = (machine.name.clone(), machine.version);

        if let Some(existing) = self.machines.get(&key) {
            if existing.checksum == machine.checksum {
                return Ok((existing.checksum.clone(), false));
            }
            return Err(EngineError::MachineVersionExists {
                machine: key.0,
                version: key.1,
            });
        }

        let checksum = machine.checksum.clone();
        tracing::info!(machine = %key.0, version = key.1, %checksum, "machine registered");
        self.machines.insert(key, Arc::new(machine));
        Ok((checksum, true))
    }

    pub fn get_machine(&self, name: &str, version: u32) -> Result<Arc<Machine>, EngineError> {
        self.machines
            .get(&(name.to_string(), version))
            .map(|m| Arc::clone(&m))
            .ok_or_else(|| EngineError::MachineNotFound {
                machine: name.to_string(),
                version,
            })
    }

    /// All registered machine names with their versions, sorted.
    pub fn list_machines(&self) -> HashMap<String, Vec<u32>> {
        let mut result: HashMap<String, Vec<u32>> = HashMap::new();
        for entry in self.machines.iter() {
            let (name, version) = entry.key();
            result.entry(name.clone()).or_default().push(*version);
        }
        for versions in result.values_mut() {
            versions.sort_unstable();
        }
        result
    }

    /// Creates and initializes an instance with the default dispatch
    /// strategy. A `None` id gets a generated UUID.
    pub fn create_instance(
        &self,
        machine: &str,
        version: u32,
        instance_id: Option<String>,
        initial_ctx: Value,
    ) -> Result<(String, StepOutcome), EngineError> {
        self.create_instance_inner(machine, version, instance_id, initial_ctx, None)
    }

    /// Creates and initializes an instance with an explicit dispatch
    /// strategy.
    pub fn create_instance_with(
        &self,
        machine: &str,
        version: u32,
        instance_id: Option<String>,
        initial_ctx: Value,
        selector: Box<dyn Selector>,
    ) -> Result<(String, StepOutcome), EngineError> {
        self.create_instance_inner(machine, version, instance_id, initial_ctx, Some(selector))
    }

    fn create_instance_inner(
        &self,
        machine: &str,
        version: u32,
        instance_id: Option<String>,
        initial_ctx: Value,
        selector: Option<Box<dyn Selector>>,
    ) -> Result<(String, StepOutcome), EngineError> {
        let definition = self.get_machine(machine, version)?;
        let id = instance_id.unwrap_or_else(|| Uuid::new_v4().to_string());

        if self.instances.contains_key(&id) {
            return Err(EngineError::InstanceExists {
                instance_id: id,
            });
        }

        let mut instance = MachineInstance::new(id.clone(), definition, initial_ctx);
        if let Some(selector) = selector {
            instance = instance.with_selector(selector);
        }
        let outcome = instance.init()?;

        tracing::debug!(instance = %id, machine, version, "instance created");
        self.instances.insert(id.clone(), RwLock::new(instance));
        Ok((id, outcome))
    }

    /// Dispatches one event to an instance and runs it to quiescence.
    pub fn dispatch(&self, instance_id: &str, event: Event) -> Result<StepOutcome, EngineError> {
        let entry = self
            .instances
            .get(instance_id)
            .ok_or_else(|| EngineError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;
        let mut instance = entry.write();
        instance.dispatch(event)
    }

    /// Advances an instance's logical clock.
    pub fn advance_clock(
        &self,
        instance_id: &str,
        delta_ms: u64,
    ) -> Result<StepOutcome, EngineError> {
        let entry = self
            .instances
            .get(instance_id)
            .ok_or_else(|| EngineError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;
        let mut instance = entry.write();
        instance.advance_clock(delta_ms)
    }

    pub fn inspect(&self, instance_id: &str) -> Result<InstanceSnapshot, EngineError> {
        let entry = self
            .instances
            .get(instance_id)
            .ok_or_else(|| EngineError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;
        let instance = entry.read();
        Ok(InstanceSnapshot {
            instance_id: instance.id().to_string(),
            machine: instance.machine().name.clone(),
            version: instance.machine().version,
            phase: instance.phase(),
            configuration: instance.configuration(),
            queued_events: instance.queued_events(),
            history: instance.history_records(),
            ctx: instance.ctx().clone(),
        })
    }

    pub fn delete_instance(&self, instance_id: &str) -> Result<(), EngineError> {
        match self.instances.remove(instance_id) {
            Some(_) => Ok(()),
            None => Err(EngineError::InstanceNotFound {
                instance_id: instance_id.to_string(),
            }),
        }
    }

    pub fn list_instance_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn definition() -> Value {
        json!({
            "name": "door",
            "version": 1,
            "initial": "closed",
            "states": [{"name": "closed"}, {"name": "open"}],
            "transitions": [
                {"from": "closed", "event": "OPEN", "to": "open"},
                {"from": "open", "event": "CLOSE", "to": "closed"}
            ]
        })
    }

    #[test]
    fn test_put_machine_idempotent_on_same_checksum() {
        let host = Host::new();
        let (sum1, created1) = host.put_machine(&definition()).unwrap();
        let (sum2, created2) = host.put_machine(&definition()).unwrap();
        assert!(created1);
        assert!(!created2);
        assert_eq!(sum1, sum2);
    }

    #[test]
    fn test_put_machine_conflicting_version_rejected() {
        let host = Host::new();
        host.put_machine(&definition()).unwrap();

        let mut changed = definition();
        changed["states"]
            .as_array_mut()
            .unwrap()
            .push(json!({"name": "stuck"}));
        changed["transitions"]
            .as_array_mut()
            .unwrap()
            .push(json!({"from": "open", "event": "JAM", "to": "stuck"}));

        let err = host.put_machine(&changed).unwrap_err();
        assert!(matches!(err, EngineError::MachineVersionExists { version: 1, .. }));
    }

    #[test]
    fn test_instance_lifecycle() {
        let host = Host::new();
        host.put_machine(&definition()).unwrap();

        let (id, out) = host
            .create_instance("door", 1, None, json!({}))
            .unwrap();
        assert_eq!(out.configuration, vec!["closed"]);

        let out = host.dispatch(&id, Event::named("OPEN")).unwrap();
        assert_eq!(out.configuration, vec!["open"]);

        let snapshot = host.inspect(&id).unwrap();
        assert_eq!(snapshot.configuration, vec!["open"]);
        assert_eq!(snapshot.machine, "door");

        host.delete_instance(&id).unwrap();
        assert!(matches!(
            host.inspect(&id),
            Err(EngineError::InstanceNotFound { .. })
        ));
    }

    #[test]
    fn test_duplicate_instance_id_rejected() {
        let host = Host::new();
        host.put_machine(&definition()).unwrap();
        host.create_instance("door", 1, Some("one".into()), json!({}))
            .unwrap();
        assert!(matches!(
            host.create_instance("door", 1, Some("one".into()), json!({})),
            Err(EngineError::InstanceExists { .. })
        ));
    }

    #[test]
    fn test_unknown_machine_rejected() {
        let host = Host::new();
        assert!(matches!(
            host.create_instance("ghost", 1, None, json!({})),
            Err(EngineError::MachineNotFound { .. })
        ));
    }
}
