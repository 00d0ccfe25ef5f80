//! Environment-variable configuration for the fleet controller.

use anyhow::{Context, Result};

/// Fixed cloud VM template used for every launch.
#[derive(Debug, Clone)]
pub struct VmTemplate {
    pub image: String,
    pub instance_type: String,
    pub zone: String,
    pub vpc_id: String,
    pub subnet_id: String,
    pub security_group: String,
    pub bandwidth_mbps: u32,
    pub name_prefix: String,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub worker_port: u16,
    pub full_match_limit: u32,
    pub max_backup_vms: usize,
    pub min_backup_vms: usize,
    pub near_capacity_threshold: u32,
    pub vm_unreachable_terminate_threshold: u32,
    pub vm_age_terminate_minutes: u64,
    pub status_timeout_ms: u64,
    pub update_interval_ms: u64,
    pub protection_rotation_minutes: u64,
    pub max_poll_attempts: u32,
    pub playfab_secret_key: String,
    pub cloud_provider: CloudProviderKind,
    pub cloud_api_addr: Option<String>,
    pub cloud_api_token: Option<String>,
    pub template: VmTemplate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloudProviderKind {
    Mock,
    Http,
}

impl Settings {
    /// Load configuration from the process environment, applying defaults
    /// for anything unset and rejecting malformed numeric values.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            port: env_parse("PORT", 7777)?,
            worker_port: env_parse("WORKER_PORT", 7777)?,
            full_match_limit: env_parse("FULL_MATCH_LIMIT", 5)?,
            max_backup_vms: env_parse("MAX_BACKUP_VMS", 10)?,
            min_backup_vms: env_parse("MIN_BACKUP_VMS", 1)?,
            near_capacity_threshold: env_parse("NEAR_CAPACITY_THRESHOLD", 1)?,
            vm_unreachable_terminate_threshold: env_parse(
                "VM_UNREACHABLE_TERMINATE_THRESHOLD",
                2,
            )?,
            vm_age_terminate_minutes: env_parse("VM_AGE_TERMINATE_MINUTES", 5)?,
            status_timeout_ms: env_parse("STATUS_TIMEOUT_MS", 5000)?,
            update_interval_ms: env_parse("UPDATE_INTERVAL_MS", 30000)?,
            protection_rotation_minutes: env_parse("PROTECTION_ROTATION_MINUTES", 60)?,
            max_poll_attempts: env_parse("MAX_POLL_ATTEMPTS", 40)?,
            playfab_secret_key: std::env::var("PLAYFAB_SECRET_KEY").unwrap_or_default(),
            cloud_provider: match std::env::var("CLOUD_PROVIDER").as_deref() {
                Ok("http") => CloudProviderKind::Http,
                _ => CloudProviderKind::Mock,
            },
            cloud_api_addr: std::env::var("CLOUD_API_ADDR").ok(),
            cloud_api_token: std::env::var("CLOUD_API_TOKEN").ok(),
            template: VmTemplate {
                image: env_string("VM_IMAGE", "match-worker-base"),
                instance_type: env_string("VM_INSTANCE_TYPE", "t3.medium"),
                zone: env_string("VM_ZONE", "us-east-1a"),
                vpc_id: env_string("VM_VPC_ID", ""),
                subnet_id: env_string("VM_SUBNET_ID", ""),
                security_group: env_string("VM_SECURITY_GROUP", ""),
                bandwidth_mbps: env_parse("VM_BANDWIDTH_MBPS", 100)?,
                name_prefix: env_string("VM_NAME_PREFIX", "fleetctl-worker"),
            },
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{e}"))
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_to_default_when_unset() {
        unsafe {
            std::env::remove_var("FLEETCTL_TEST_UNSET_KEY");
        }
        let value: u32 = env_parse("FLEETCTL_TEST_UNSET_KEY", 42).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn env_parse_rejects_malformed_numeric_value() {
        unsafe {
            std::env::set_var("FLEETCTL_TEST_BAD_KEY", "not-a-number");
        }
        let result: Result<u32> = env_parse("FLEETCTL_TEST_BAD_KEY", 42);
        assert!(result.is_err());
        unsafe {
            std::env::remove_var("FLEETCTL_TEST_BAD_KEY");
        }
    }
}
