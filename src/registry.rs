//! VM registry: the single mutation point for tracked VM state.
//!
//! All reads and writes serialize through one `std::sync::Mutex`; nothing
//! in this module ever holds the lock across an `.await` (callers take a
//! `snapshot()` before doing network I/O and apply results afterward).

use crate::cloud::CloudInstance;
use crate::models::VmRecord;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

pub struct VmRegistry {
    vms: Mutex<HashMap<String, VmRecord>>,
    protected_vm: Mutex<Option<String>>,
}

impl VmRegistry {
    pub fn new() -> Self {
        Self {
            vms: Mutex::new(HashMap::new()),
            protected_vm: Mutex::new(None),
        }
    }

    pub fn len(&self) -> usize {
        self.vms.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn protected_vm(&self) -> Option<String> {
        self.protected_vm.lock().unwrap().clone()
    }

    pub fn set_protected_vm(&self, instance_id: Option<String>) {
        *self.protected_vm.lock().unwrap() = instance_id;
    }

    /// Immutable view for the allocator's selection phase, so it never
    /// holds the registry lock while probing VMs or calling the cloud.
    pub fn snapshot(&self) -> Vec<VmRecord> {
        self.vms.lock().unwrap().values().cloned().collect()
    }

    pub fn get(&self, instance_id: &str) -> Option<VmRecord> {
        self.vms.lock().unwrap().get(instance_id).cloned()
    }

    pub fn insert(&self, record: VmRecord) {
        self.vms.lock().unwrap().insert(record.instance_id.clone(), record);
    }

    /// Inserts a VM discovered from the cloud if absent and it carries an
    /// IP; updates the IP on an existing record if it changed.
    pub fn upsert_from_cloud(&self, instance: &CloudInstance, now: Instant) {
        let Some(ip) = instance.public_ips.first() else {
            return;
        };
        let mut vms = self.vms.lock().unwrap();
        match vms.get_mut(&instance.instance_id) {
            Some(existing) => {
                if existing.ip != *ip {
                    existing.ip = ip.clone();
                }
            }
            None => {
                vms.insert(
                    instance.instance_id.clone(),
                    VmRecord::new(instance.instance_id.clone(), ip.clone(), now),
                );
            }
        }
    }

    /// Removes a VM record; clears the protected slot if it pointed here.
    pub fn remove(&self, instance_id: &str) {
        self.vms.lock().unwrap().remove(instance_id);
        let mut protected = self.protected_vm.lock().unwrap();
        if protected.as_deref() == Some(instance_id) {
            *protected = None;
        }
    }

    pub fn apply_probe(&self, instance_id: &str, active_matches: u32, now: Instant) {
        if let Some(vm) = self.vms.lock().unwrap().get_mut(instance_id) {
            vm.match_count = active_matches;
            vm.unreachable_count = 0;
            vm.last_seen = now;
        }
    }

    pub fn record_probe_failure(&self, instance_id: &str) {
        if let Some(vm) = self.vms.lock().unwrap().get_mut(instance_id) {
            vm.unreachable_count += 1;
        }
    }

    pub fn increment_match_count(&self, instance_id: &str) {
        if let Some(vm) = self.vms.lock().unwrap().get_mut(instance_id) {
            vm.match_count += 1;
        }
    }
}

impl Default for VmRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::InstanceState;

    #[test]
    fn upsert_from_cloud_skips_instances_without_ip() {
        let registry = VmRegistry::new();
        let instance = CloudInstance {
            instance_id: "i-1".into(),
            state: InstanceState::Running,
            public_ips: vec![],
        };
        registry.upsert_from_cloud(&instance, Instant::now());
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_clears_matching_protected_slot() {
        let registry = VmRegistry::new();
        registry.insert(VmRecord::new("i-1", "1.2.3.4", Instant::now()));
        registry.set_protected_vm(Some("i-1".to_string()));
        registry.remove("i-1");
        assert_eq!(registry.protected_vm(), None);
    }

    #[test]
    fn remove_leaves_protected_slot_for_other_vm() {
        let registry = VmRegistry::new();
        registry.insert(VmRecord::new("i-1", "1.2.3.4", Instant::now()));
        registry.insert(VmRecord::new("i-2", "1.2.3.5", Instant::now()));
        registry.set_protected_vm(Some("i-2".to_string()));
        registry.remove("i-1");
        assert_eq!(registry.protected_vm(), Some("i-2".to_string()));
    }

    #[test]
    fn apply_probe_resets_unreachable_count() {
        let registry = VmRegistry::new();
        registry.insert(VmRecord::new("i-1", "1.2.3.4", Instant::now()));
        registry.record_probe_failure("i-1");
        registry.record_probe_failure("i-1");
        registry.apply_probe("i-1", 3, Instant::now());
        let vm = registry.get("i-1").unwrap();
        assert_eq!(vm.match_count, 3);
        assert_eq!(vm.unreachable_count, 0);
    }
}
