//! Reconciler: the periodic control loop that syncs the registry against
//! the cloud, refreshes worker health, scales the pool, and rotates the
//! protected VM.

use crate::allocator::Allocator;
use crate::cloud::{CloudProvider, InstanceState};
use crate::config::Settings;
use crate::registry::VmRegistry;
use crate::worker::WorkerProbe;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// Phases (a)-(e) of the control loop. Phase (f), the stale-match sweep,
/// needs the match map the controller owns, so it lives there; the
/// controller runs it immediately after `run_vm_phases` under the same
/// tick guard (§4.6).
pub struct Reconciler {
    registry: Arc<VmRegistry>,
    cloud: Arc<dyn CloudProvider>,
    probe: Arc<WorkerProbe>,
    allocator: Arc<Allocator>,
    settings: Settings,
}

impl Reconciler {
    pub fn new(
        registry: Arc<VmRegistry>,
        cloud: Arc<dyn CloudProvider>,
        probe: Arc<WorkerProbe>,
        allocator: Arc<Allocator>,
        settings: Settings,
    ) -> Self {
        Self {
            registry,
            cloud,
            probe,
            allocator,
            settings,
        }
    }

    pub async fn run_vm_phases(&self) {
        self.cloud_sync().await;
        self.health_refresh_and_idle_termination().await;
        self.minimum_pool_top_up().await;
        self.low_capacity_scale_up().await;
        self.protection_policy().await;
    }

    /// Phase (a): reconcile the registry against the cloud's view.
    async fn cloud_sync(&self) {
        let instances = match self.cloud.describe_all().await {
            Ok(instances) => instances,
            Err(e) => {
                eprintln!("reconciler: cloud_sync describe_all failed: {e}");
                return;
            }
        };

        let now = Instant::now();
        let live_ids: HashSet<&str> = instances
            .iter()
            .filter(|i| i.state == InstanceState::Running)
            .map(|i| i.instance_id.as_str())
            .collect();

        for vm in self.registry.snapshot() {
            if !live_ids.contains(vm.instance_id.as_str()) {
                self.registry.remove(&vm.instance_id);
            }
        }

        for instance in instances.iter().filter(|i| i.state == InstanceState::Running) {
            self.registry.upsert_from_cloud(instance, now);
        }
    }

    /// Phase (b): probe health, terminate idle/unreachable VMs. The
    /// unreachable and idle paths are collected into one termination
    /// list and applied together at the end, so they cannot race each
    /// other or double-count pool size within a tick.
    async fn health_refresh_and_idle_termination(&self) {
        let snapshot = self.registry.snapshot();
        let now = Instant::now();
        let mut to_terminate = Vec::new();

        for vm in &snapshot {
            match self.probe.status(&vm.ip, self.settings.status_timeout_ms).await {
                Ok(active_matches) => {
                    self.registry.apply_probe(&vm.instance_id, active_matches, now);

                    let is_protected = self.registry.protected_vm().as_deref() == Some(vm.instance_id.as_str());
                    let pool_above_floor = self.registry.len() - to_terminate.len()
                        > self.settings.min_backup_vms;
                    let old_enough = vm.age(now).as_secs()
                        >= self.settings.vm_age_terminate_minutes * 60;

                    if active_matches == 0 && old_enough && !is_protected && pool_above_floor {
                        to_terminate.push(vm.instance_id.clone());
                    }
                }
                Err(_) => {
                    self.registry.record_probe_failure(&vm.instance_id);
                    let unreachable_count = vm.unreachable_count + 1;

                    let is_protected = self.registry.protected_vm().as_deref() == Some(vm.instance_id.as_str());
                    let pool_above_floor = self.registry.len() - to_terminate.len()
                        > self.settings.min_backup_vms;
                    let old_enough = vm.age(now).as_secs()
                        >= self.settings.vm_age_terminate_minutes * 60;

                    if unreachable_count >= self.settings.vm_unreachable_terminate_threshold
                        && old_enough
                        && !is_protected
                        && pool_above_floor
                        && !to_terminate.contains(&vm.instance_id)
                    {
                        to_terminate.push(vm.instance_id.clone());
                    }
                }
            }
        }

        if to_terminate.is_empty() {
            return;
        }

        if let Err(e) = self.cloud.terminate(&to_terminate).await {
            eprintln!("reconciler: terminate failed: {e}");
        }
        for id in &to_terminate {
            self.registry.remove(id);
        }
    }

    /// Phase (c): top up toward the pool floor, one launch per tick.
    async fn minimum_pool_top_up(&self) {
        if self.registry.len() < self.settings.min_backup_vms {
            let _ = self.allocator.launch_backup_vm().await;
        }
    }

    /// Phase (d): scale up once if free capacity is running low.
    async fn low_capacity_scale_up(&self) {
        let total_free_slots: u32 = self
            .registry
            .snapshot()
            .iter()
            .map(|vm| vm.free_slots(self.settings.full_match_limit))
            .sum();

        if total_free_slots <= self.settings.near_capacity_threshold
            && self.registry.len() < self.settings.max_backup_vms
        {
            let _ = self.allocator.launch_backup_vm().await;
        }
    }

    /// Phase (e): keep a protected VM selected, rotating it off idleness.
    async fn protection_policy(&self) {
        let snapshot = self.registry.snapshot();
        if snapshot.is_empty() {
            self.registry.set_protected_vm(None);
            return;
        }

        let now = Instant::now();
        let oldest = |vms: &[crate::models::VmRecord]| {
            vms.iter()
                .min_by(|a, b| {
                    a.launched_at
                        .cmp(&b.launched_at)
                        .then_with(|| a.instance_id.cmp(&b.instance_id))
                })
                .map(|vm| vm.instance_id.clone())
        };

        let current = self.registry.protected_vm();
        match current {
            None => {
                self.registry.set_protected_vm(oldest(&snapshot));
            }
            Some(ref protected_id) => {
                let protected_vm = snapshot.iter().find(|vm| &vm.instance_id == protected_id);
                let rotation_window = self.settings.protection_rotation_minutes * 60;
                let should_rotate = match protected_vm {
                    Some(vm) => vm.idle_for(now).as_secs() > rotation_window,
                    None => true,
                };
                if should_rotate {
                    let candidates: Vec<_> = snapshot
                        .iter()
                        .filter(|vm| &vm.instance_id != protected_id)
                        .cloned()
                        .collect();
                    if let Some(next) = oldest(&candidates) {
                        self.registry.set_protected_vm(Some(next));
                    }
                }
            }
        }
    }

    /// Does the given instance currently exist in the registry? Used by
    /// the controller's stale-match sweep (phase (f)).
    pub fn vm_exists(&self, instance_id: &str) -> bool {
        self.registry.get(instance_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MockCloudProvider;
    use crate::config::{CloudProviderKind, VmTemplate};

    fn test_settings() -> Settings {
        Settings {
            port: 7777,
            worker_port: 7777,
            full_match_limit: 5,
            max_backup_vms: 10,
            min_backup_vms: 1,
            near_capacity_threshold: 1,
            vm_unreachable_terminate_threshold: 2,
            vm_age_terminate_minutes: 0,
            status_timeout_ms: 200,
            update_interval_ms: 30000,
            protection_rotation_minutes: 60,
            max_poll_attempts: 1,
            playfab_secret_key: String::new(),
            cloud_provider: CloudProviderKind::Mock,
            cloud_api_addr: None,
            cloud_api_token: None,
            template: VmTemplate {
                image: "img".into(),
                instance_type: "t".into(),
                zone: "z".into(),
                vpc_id: "v".into(),
                subnet_id: "s".into(),
                security_group: "sg".into(),
                bandwidth_mbps: 100,
                name_prefix: "test".into(),
            },
        }
    }

    #[tokio::test]
    async fn cloud_sync_discovers_running_instance() {
        let registry = Arc::new(VmRegistry::new());
        let cloud = Arc::new(MockCloudProvider::new());
        cloud.seed_running("i-1", "1.2.3.4");
        let probe = Arc::new(WorkerProbe::new(7777));
        let settings = test_settings();
        let allocator = Arc::new(Allocator::new(
            Arc::clone(&registry),
            cloud.clone() as Arc<dyn CloudProvider>,
            Arc::clone(&probe),
            settings.clone(),
        ));
        let reconciler = Reconciler::new(
            Arc::clone(&registry),
            cloud as Arc<dyn CloudProvider>,
            probe,
            allocator,
            settings,
        );

        reconciler.cloud_sync().await;
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("i-1").unwrap().ip, "1.2.3.4");
    }

    #[tokio::test]
    async fn cloud_sync_removes_vm_no_longer_running() {
        let registry = Arc::new(VmRegistry::new());
        registry.insert(crate::models::VmRecord::new("i-1", "1.2.3.4", Instant::now()));
        let cloud = Arc::new(MockCloudProvider::new());
        let probe = Arc::new(WorkerProbe::new(7777));
        let settings = test_settings();
        let allocator = Arc::new(Allocator::new(
            Arc::clone(&registry),
            cloud.clone() as Arc<dyn CloudProvider>,
            Arc::clone(&probe),
            settings.clone(),
        ));
        let reconciler = Reconciler::new(
            Arc::clone(&registry),
            cloud as Arc<dyn CloudProvider>,
            probe,
            allocator,
            settings,
        );

        reconciler.cloud_sync().await;
        assert!(registry.is_empty());
    }

    /// Reproduces the scenario from the floor-violation report: a pool of
    /// 4 VMs, all unreachable and none yet protected, with
    /// `min_backup_vms=2`. Terminating every eligible VM in one tick would
    /// drop the pool to 0; the floor guard must stop once 2 remain.
    #[tokio::test]
    async fn unreachable_termination_never_drops_pool_below_floor() {
        let dead_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = dead_listener.local_addr().unwrap().port();
        drop(dead_listener); // nothing listens here: connections are refused

        let registry = Arc::new(VmRegistry::new());
        let cloud = Arc::new(MockCloudProvider::new());
        for id in ["i-1", "i-2", "i-3", "i-4"] {
            cloud.seed_running(id, "127.0.0.1");
            registry.insert(crate::models::VmRecord::new(id, "127.0.0.1", Instant::now()));
        }

        let mut settings = test_settings();
        settings.worker_port = dead_port;
        settings.min_backup_vms = 2;
        settings.vm_unreachable_terminate_threshold = 1;
        settings.status_timeout_ms = 200;

        let probe = Arc::new(WorkerProbe::new(dead_port));
        let allocator = Arc::new(Allocator::new(
            Arc::clone(&registry),
            cloud.clone() as Arc<dyn CloudProvider>,
            Arc::clone(&probe),
            settings.clone(),
        ));
        let reconciler = Reconciler::new(
            Arc::clone(&registry),
            cloud as Arc<dyn CloudProvider>,
            probe,
            allocator,
            settings.clone(),
        );

        reconciler.health_refresh_and_idle_termination().await;

        assert_eq!(
            registry.len(),
            settings.min_backup_vms,
            "termination must stop exactly at the floor, never below it"
        );
    }
}
