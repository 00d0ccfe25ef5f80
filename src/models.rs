//! Data model shared across the registry, allocator, reconciler, and HTTP layer.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// One tracked worker VM.
#[derive(Debug, Clone)]
pub struct VmRecord {
    pub instance_id: String,
    pub ip: String,
    pub match_count: u32,
    pub unreachable_count: u32,
    pub launched_at: Instant,
    pub last_seen: Instant,
}

impl VmRecord {
    pub fn new(instance_id: impl Into<String>, ip: impl Into<String>, now: Instant) -> Self {
        Self {
            instance_id: instance_id.into(),
            ip: ip.into(),
            match_count: 0,
            unreachable_count: 0,
            launched_at: now,
            last_seen: now,
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.launched_at)
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }

    pub fn free_slots(&self, full_match_limit: u32) -> u32 {
        full_match_limit.saturating_sub(self.match_count)
    }
}

/// Serializable view of a `VmRecord` for the debug endpoint.
#[derive(Debug, Serialize)]
pub struct VmRecordView {
    pub instance_id: String,
    pub ip: String,
    pub match_count: u32,
    pub unreachable_count: u32,
    pub age_secs: u64,
    pub idle_secs: u64,
}

impl VmRecordView {
    pub fn from_record(record: &VmRecord, now: Instant) -> Self {
        Self {
            instance_id: record.instance_id.clone(),
            ip: record.ip.clone(),
            match_count: record.match_count,
            unreachable_count: record.unreachable_count,
            age_secs: record.age(now).as_secs(),
            idle_secs: record.idle_for(now).as_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPrivacy {
    Public,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    QuickPlay,
    CustomPrivate,
    Ranked,
    Tournament,
}

impl MatchType {
    pub fn default_for(privacy: MatchPrivacy) -> Self {
        match privacy {
            MatchPrivacy::Public => MatchType::QuickPlay,
            MatchPrivacy::Private => MatchType::CustomPrivate,
        }
    }
}

/// One active match, keyed by `match_id`.
#[derive(Debug, Clone, Serialize)]
pub struct MatchRecord {
    pub match_id: String,
    pub game_mode: String,
    pub match_privacy: MatchPrivacy,
    pub tick_rate: u32,
    pub match_type: MatchType,
    pub server_ip: String,
    pub server_port: u16,
    pub container_id: String,
    pub vm_instance_id: String,
    #[serde(skip)]
    pub started_at: Instant,
}

/// Closed mapping from `game_mode` to the engine scene it launches.
///
/// The recognized set is finite; anything not listed here is rejected
/// by the request handler as an invalid game mode.
pub fn scene_for_game_mode(game_mode: &str) -> Option<&'static str> {
    match game_mode {
        "VersusMen_Online" => Some("Scenes/Versus/Men"),
        "VersusWomen_Online" => Some("Scenes/Versus/Women"),
        "VersusMixed_Online" => Some("Scenes/Versus/Mixed"),
        "Coop_Online" => Some("Scenes/Coop/Default"),
        "BattleRoyale_Online" => Some("Scenes/BattleRoyale/Default"),
        "Tournament_Online" => Some("Scenes/Tournament/Bracket"),
        _ => None,
    }
}
