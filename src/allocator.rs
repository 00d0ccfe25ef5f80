//! Allocation policy: picking a VM for a match request, and launching a
//! replacement when the pool has no capacity.

use crate::cloud::{CloudProvider, InstanceState};
use crate::config::Settings;
use crate::models::VmRecord;
use crate::registry::VmRegistry;
use crate::worker::WorkerProbe;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::time::Duration;

pub struct Allocator {
    registry: Arc<VmRegistry>,
    cloud: Arc<dyn CloudProvider>,
    probe: Arc<WorkerProbe>,
    settings: Settings,
    /// Single-flight guard: at most one launch in progress process-wide.
    /// Generalized from the teacher's `start_semaphore`, which caps
    /// concurrency at N, down to a cap of 1.
    launch_guard: Arc<Semaphore>,
}

impl Allocator {
    pub fn new(
        registry: Arc<VmRegistry>,
        cloud: Arc<dyn CloudProvider>,
        probe: Arc<WorkerProbe>,
        settings: Settings,
    ) -> Self {
        Self {
            registry,
            cloud,
            probe,
            settings,
            launch_guard: Arc::new(Semaphore::new(1)),
        }
    }

    /// Selection policy for `get_available_vm()`: snapshot, probe every
    /// known VM in parallel, rank survivors, launch if none qualify.
    pub async fn get_available_vm(&self) -> Option<String> {
        let snapshot = self.registry.snapshot();

        let handles: Vec<_> = snapshot
            .iter()
            .map(|vm| {
                let probe = Arc::clone(&self.probe);
                let ip = vm.ip.clone();
                let instance_id = vm.instance_id.clone();
                let timeout_ms = self.settings.status_timeout_ms;
                tokio::spawn(async move {
                    let result = probe.status(&ip, timeout_ms).await;
                    (instance_id, result)
                })
            })
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(pair) = handle.await {
                results.push(pair);
            }
        }

        let now = tokio::time::Instant::now().into_std();
        for (instance_id, result) in &results {
            match result {
                Ok(active_matches) => {
                    self.registry.apply_probe(instance_id, *active_matches, now);
                }
                Err(_) => {
                    self.registry.record_probe_failure(instance_id);
                }
            }
        }

        let candidates: Vec<VmRecord> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|vm| {
                vm.match_count < self.settings.full_match_limit && vm.unreachable_count == 0
            })
            .collect();

        if let Some(chosen) = rank_candidates(candidates) {
            return Some(chosen);
        }

        self.launch_backup_vm().await
    }

    /// Launch a replacement VM, guarded by the single-flight semaphore.
    /// Concurrent callers that cannot acquire the permit return `None`
    /// immediately rather than blocking.
    pub async fn launch_backup_vm(&self) -> Option<String> {
        if self.registry.len() >= self.settings.max_backup_vms {
            return None;
        }

        let _permit = self.launch_guard.try_acquire().ok()?;

        let instance_id = match self.cloud.run_one(&self.settings.template).await {
            Ok(id) => id,
            Err(e) => {
                eprintln!("launch_backup_vm: run_one failed: {e}");
                return None;
            }
        };

        for attempt in 0..self.settings.max_poll_attempts {
            let delay = Duration::from_millis(5000) + Duration::from_millis(250 * attempt as u64);
            tokio::time::sleep(delay).await;

            let instances = match self.cloud.describe_all().await {
                Ok(instances) => instances,
                Err(e) => {
                    eprintln!("launch_backup_vm: describe_all failed: {e}");
                    continue;
                }
            };

            let Some(found) = instances.iter().find(|i| i.instance_id == instance_id) else {
                continue;
            };
            if found.state != InstanceState::Running {
                continue;
            }
            let Some(ip) = found.public_ips.first() else {
                continue;
            };

            let now = tokio::time::Instant::now().into_std();
            self.registry
                .insert(VmRecord::new(instance_id.clone(), ip.clone(), now));

            if self.registry.protected_vm().is_none() {
                self.registry.set_protected_vm(Some(instance_id.clone()));
            }

            return Some(instance_id);
        }

        eprintln!("launch_backup_vm: polling exhausted for {instance_id}, terminating");
        if let Err(e) = self.cloud.terminate(&[instance_id]).await {
            eprintln!("launch_backup_vm: best-effort terminate failed: {e}");
        }
        None
    }
}

/// Orders candidates by `(match_count asc, last_seen asc)`, ties broken
/// by `instance_id` lexical order, and returns the winner's id.
fn rank_candidates(mut candidates: Vec<VmRecord>) -> Option<String> {
    candidates.sort_by(|a, b| {
        a.match_count
            .cmp(&b.match_count)
            .then_with(|| a.last_seen.cmp(&b.last_seen))
            .then_with(|| a.instance_id.cmp(&b.instance_id))
    });
    candidates.into_iter().next().map(|vm| vm.instance_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn rank_prefers_lower_match_count() {
        let now = Instant::now();
        let mut a = VmRecord::new("i-a", "1.1.1.1", now);
        a.match_count = 3;
        let mut b = VmRecord::new("i-b", "1.1.1.2", now);
        b.match_count = 1;
        let winner = rank_candidates(vec![a, b]).unwrap();
        assert_eq!(winner, "i-b");
    }

    #[test]
    fn rank_breaks_ties_by_instance_id() {
        let now = Instant::now();
        let a = VmRecord::new("i-b", "1.1.1.1", now);
        let b = VmRecord::new("i-a", "1.1.1.2", now);
        let winner = rank_candidates(vec![a, b]).unwrap();
        assert_eq!(winner, "i-a");
    }

    #[test]
    fn rank_empty_candidates_is_none() {
        assert_eq!(rank_candidates(vec![]), None);
    }
}
