use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use wagate_core::InstanceId;

use crate::error::InstanceError;
use crate::instance::Instance;

/// Live instances keyed by id. Reads are shared; add and remove are exclusive.
#[derive(Default)]
pub struct InstanceRegistry {
    instances: RwLock<HashMap<InstanceId, Arc<Instance>>>,
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an instance. Fails if another instance already uses its name.
    pub fn add(&self, instance: Arc<Instance>) -> Result<(), InstanceError> {
        let mut instances = self.instances.write();
        if instances.values().any(|i| i.name() == instance.name()) {
            return Err(InstanceError::NameTaken(instance.name().to_string()));
        }
        instances.insert(instance.id().clone(), instance);
        Ok(())
    }

    /// Idempotent; returns the evicted instance if there was one.
    pub fn remove(&self, id: &InstanceId) -> Option<Arc<Instance>> {
        self.instances.write().remove(id)
    }

    pub fn get(&self, id: &InstanceId) -> Option<Arc<Instance>> {
        self.instances.read().get(id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<Arc<Instance>> {
        self.instances.read().values().find(|i| i.name() == name).cloned()
    }

    /// All instances, ordered by name.
    pub fn list(&self) -> Vec<Arc<Instance>> {
        let mut all: Vec<_> = self.instances.read().values().cloned().collect();
        all.sort_by(|a, b| a.name().cmp(b.name()));
        all
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }
}
