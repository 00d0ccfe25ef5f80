//! `FleetController`: the single owner of all mutable process state
//! (VM registry, protected slot, active matches), tying the allocator,
//! reconciler, and request handling together.
//!
//! Teacher precedent: `FirecrackerPool`/`ContainerPool` as the single
//! struct owning all pool state, rather than free-floating module statics.

use crate::allocator::Allocator;
use crate::cloud::CloudProvider;
use crate::config::Settings;
use crate::error::FleetError;
use crate::models::{scene_for_game_mode, MatchPrivacy, MatchRecord, MatchType};
use crate::reconciler::Reconciler;
use crate::registry::VmRegistry;
use crate::worker::WorkerProbe;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex as AsyncMutex;

pub struct MatchRequest {
    pub match_id: String,
    pub game_mode: String,
    pub tick_rate: Option<u32>,
    pub match_type: Option<MatchType>,
}

pub struct FleetController {
    registry: Arc<VmRegistry>,
    allocator: Arc<Allocator>,
    reconciler: Reconciler,
    probe: Arc<WorkerProbe>,
    settings: Settings,
    matches: AsyncMutex<HashMap<String, MatchRecord>>,
    /// Prevents two reconciler ticks from overlapping; a slow tick means
    /// the next scheduled one is skipped rather than queued.
    tick_guard: AsyncMutex<()>,
}

impl FleetController {
    pub fn new(cloud: Arc<dyn CloudProvider>, settings: Settings) -> Self {
        let registry = Arc::new(VmRegistry::new());
        let probe = Arc::new(WorkerProbe::new(settings.worker_port));
        let allocator = Arc::new(Allocator::new(
            Arc::clone(&registry),
            Arc::clone(&cloud),
            Arc::clone(&probe),
            settings.clone(),
        ));
        let reconciler = Reconciler::new(
            Arc::clone(&registry),
            cloud,
            Arc::clone(&probe),
            Arc::clone(&allocator),
            settings.clone(),
        );

        Self {
            registry,
            allocator,
            reconciler,
            probe,
            settings,
            matches: AsyncMutex::new(HashMap::new()),
            tick_guard: AsyncMutex::new(()),
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Runs one reconciler tick (phases a-f) if no previous tick is still
    /// running; otherwise logs and skips.
    pub async fn reconcile_once(&self) {
        let Ok(_guard) = self.tick_guard.try_lock() else {
            eprintln!("reconciler: previous tick still running, skipping");
            return;
        };

        self.reconciler.run_vm_phases().await;
        self.stale_match_sweep().await;
    }

    /// Phase (f): drop match records whose VM no longer resolves to a
    /// registry entry. Runs last so it observes the registry state after
    /// phases (a)-(e) have settled for this tick.
    async fn stale_match_sweep(&self) {
        let mut matches = self.matches.lock().await;
        let before = matches.len();
        matches.retain(|_, m| self.reconciler.vm_exists(&m.vm_instance_id));
        let dropped = before - matches.len();
        if dropped > 0 {
            eprintln!("reconciler: swept {dropped} stale match record(s)");
        }
    }

    pub async fn request_match(
        &self,
        req: MatchRequest,
        privacy: MatchPrivacy,
    ) -> Result<MatchRecord, FleetError> {
        if req.match_id.trim().is_empty() {
            return Err(FleetError::InvalidRequest("match_id is required".into()));
        }
        let Some(_scene) = scene_for_game_mode(&req.game_mode) else {
            return Err(FleetError::InvalidRequest(format!(
                "unknown game_mode: {}",
                req.game_mode
            )));
        };

        let match_type = req.match_type.unwrap_or_else(|| MatchType::default_for(privacy));
        let tick_rate = req.tick_rate.unwrap_or(30);

        let Some(instance_id) = self.allocator.get_available_vm().await else {
            return Err(FleetError::NoVmAvailable);
        };

        let Some(vm) = self.registry.get(&instance_id) else {
            return Err(FleetError::Internal(
                "allocator returned a VM absent from the registry".into(),
            ));
        };

        let started = self
            .probe
            .start_match(
                &vm.ip,
                &req.match_id,
                &req.game_mode,
                privacy,
                tick_rate,
                match_type,
                &self.settings.playfab_secret_key,
            )
            .await?;

        self.registry.increment_match_count(&instance_id);

        let record = MatchRecord {
            match_id: req.match_id.clone(),
            game_mode: req.game_mode,
            match_privacy: privacy,
            tick_rate,
            match_type,
            server_ip: vm.ip,
            server_port: started.server_port,
            container_id: started.container_id,
            vm_instance_id: instance_id,
            started_at: Instant::now(),
        };

        self.matches
            .lock()
            .await
            .insert(record.match_id.clone(), record.clone());

        Ok(record)
    }

    pub async fn match_details(&self, match_id: &str) -> Result<MatchRecord, FleetError> {
        self.matches
            .lock()
            .await
            .get(match_id)
            .cloned()
            .ok_or(FleetError::NotFound)
    }

    pub async fn debug_snapshot(&self) -> DebugSnapshot {
        let now = Instant::now();
        let vms = self
            .registry
            .snapshot()
            .iter()
            .map(|vm| crate::models::VmRecordView::from_record(vm, now))
            .collect();
        let matches: Vec<MatchRecord> = self.matches.lock().await.values().cloned().collect();

        DebugSnapshot {
            protected_vm: self.registry.protected_vm(),
            vm_pool: vms,
            matches,
        }
    }
}

pub struct DebugSnapshot {
    pub protected_vm: Option<String>,
    pub vm_pool: Vec<crate::models::VmRecordView>,
    pub matches: Vec<MatchRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::MockCloudProvider;
    use crate::config::{CloudProviderKind, VmTemplate};

    fn test_settings() -> Settings {
        Settings {
            port: 7777,
            worker_port: 9,
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
    async fn request_match_rejects_unknown_game_mode() {
        let cloud = Arc::new(MockCloudProvider::new());
        let controller = FleetController::new(cloud, test_settings());
        let result = controller
            .request_match(
                MatchRequest {
                    match_id: "m-1".into(),
                    game_mode: "NotReal".into(),
                    tick_rate: None,
                    match_type: None,
                },
                MatchPrivacy::Public,
            )
            .await;
        assert!(matches!(result, Err(FleetError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn request_match_with_empty_pool_returns_no_vm_available_when_launch_fails() {
        // max_backup_vms = 0 forces launch_backup_vm to short-circuit to None.
        let mut settings = test_settings();
        settings.max_backup_vms = 0;
        let cloud = Arc::new(MockCloudProvider::new());
        let controller = FleetController::new(cloud, settings);
        let result = controller
            .request_match(
                MatchRequest {
                    match_id: "m-1".into(),
                    game_mode: "VersusMen_Online".into(),
                    tick_rate: None,
                    match_type: None,
                },
                MatchPrivacy::Public,
            )
            .await;
        assert!(matches!(result, Err(FleetError::NoVmAvailable)));
    }

    #[tokio::test]
    async fn match_details_returns_not_found_for_unknown_id() {
        let cloud = Arc::new(MockCloudProvider::new());
        let controller = FleetController::new(cloud, test_settings());
        let result = controller.match_details("nope").await;
        assert!(matches!(result, Err(FleetError::NotFound)));
    }
}
