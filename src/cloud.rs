//! Cloud adapter: the three operations the controller needs against the
//! compute provider, normalized away from any provider-specific payload.

use crate::config::{CloudProviderKind, Settings, VmTemplate};
use crate::error::{CloudError, CloudErrorKind};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct CloudInstance {
    pub instance_id: String,
    pub state: InstanceState,
    pub public_ips: Vec<String>,
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn describe_all(&self) -> Result<Vec<CloudInstance>, CloudError>;
    async fn run_one(&self, template: &VmTemplate) -> Result<String, CloudError>;
    async fn terminate(&self, instance_ids: &[String]) -> Result<(), CloudError>;
}

/// Builds a `CloudProvider` from configuration (teacher precedent:
/// `backend::detect_best_backend` / `create_sandbox` factory functions).
pub fn build_provider(settings: &Settings) -> Result<Box<dyn CloudProvider>, anyhow::Error> {
    match settings.cloud_provider {
        CloudProviderKind::Mock => Ok(Box::new(MockCloudProvider::new())),
        CloudProviderKind::Http => {
            let addr = settings
                .cloud_api_addr
                .clone()
                .ok_or_else(|| anyhow::anyhow!("CLOUD_API_ADDR must be set when CLOUD_PROVIDER=http"))?;
            Ok(Box::new(HttpCloudProvider::new(
                addr,
                settings.cloud_api_token.clone(),
            )))
        }
    }
}

/// Deterministic in-memory provider for tests and local/dev runs.
///
/// Instances transition straight to `Running` with a synthetic IP on
/// `run_one`, matching the common case exercised by the allocator and
/// reconciler tests without needing real polling delay.
pub struct MockCloudProvider {
    instances: Mutex<HashMap<String, CloudInstance>>,
    counter: AtomicU64,
}

impl MockCloudProvider {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    /// Test/dev hook: seed an externally-discovered running instance,
    /// simulating a VM the cloud already had before this process started.
    pub fn seed_running(&self, instance_id: &str, ip: &str) {
        let mut instances = self.instances.lock().unwrap();
        instances.insert(
            instance_id.to_string(),
            CloudInstance {
                instance_id: instance_id.to_string(),
                state: InstanceState::Running,
                public_ips: vec![ip.to_string()],
            },
        );
    }

    pub fn remove_externally(&self, instance_id: &str) {
        self.instances.lock().unwrap().remove(instance_id);
    }
}

impl Default for MockCloudProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CloudProvider for MockCloudProvider {
    async fn describe_all(&self) -> Result<Vec<CloudInstance>, CloudError> {
        Ok(self.instances.lock().unwrap().values().cloned().collect())
    }

    async fn run_one(&self, _template: &VmTemplate) -> Result<String, CloudError> {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        let instance_id = format!("mock-{id}");
        let ip = format!("10.0.{}.{}", (id / 254) % 254, (id % 254) + 1);
        self.instances.lock().unwrap().insert(
            instance_id.clone(),
            CloudInstance {
                instance_id: instance_id.clone(),
                state: InstanceState::Running,
                public_ips: vec![ip],
            },
        );
        Ok(instance_id)
    }

    async fn terminate(&self, instance_ids: &[String]) -> Result<(), CloudError> {
        let mut instances = self.instances.lock().unwrap();
        for id in instance_ids {
            instances.remove(id);
        }
        Ok(())
    }
}

/// HTTP-backed provider speaking a simplified REST contract, mirroring the
/// shape of a Nomad/consul-style API: GET/PUT/DELETE against a base
/// address with bearer-style auth.
pub struct HttpCloudProvider {
    addr: String,
    token: Option<String>,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct DescribeResponse {
    instances: Vec<RawInstance>,
}

#[derive(Debug, Deserialize)]
struct RawInstance {
    instance_id: String,
    state: String,
    public_ips: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    instance_id: String,
}

impl HttpCloudProvider {
    pub fn new(addr: String, token: Option<String>) -> Self {
        Self {
            addr,
            token,
            http: reqwest::Client::new(),
        }
    }

    async fn get(&self, path: &str) -> Result<serde_json::Value, CloudError> {
        let url = format!("{}{}", self.addr, path);
        let mut req = self.http.get(&url);
        if let Some(ref token) = self.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| CloudError::transient(format!("cloud GET {path} failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let kind = if status.is_server_error() {
                CloudErrorKind::Transient
            } else {
                CloudErrorKind::Permanent
            };
            return Err(CloudError {
                kind,
                message: format!("cloud GET {path} returned {status}"),
            });
        }
        resp.json()
            .await
            .map_err(|e| CloudError::permanent(format!("cloud GET {path} malformed body: {e}")))
    }

    async fn put(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, CloudError> {
        let url = format!("{}{}", self.addr, path);
        let mut req = self.http.put(&url).json(body);
        if let Some(ref token) = self.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| CloudError::transient(format!("cloud PUT {path} failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let kind = if status.is_server_error() {
                CloudErrorKind::Transient
            } else {
                CloudErrorKind::Permanent
            };
            return Err(CloudError {
                kind,
                message: format!("cloud PUT {path} returned {status}"),
            });
        }
        resp.json()
            .await
            .map_err(|e| CloudError::permanent(format!("cloud PUT {path} malformed body: {e}")))
    }

    async fn delete(&self, path: &str) -> Result<(), CloudError> {
        let url = format!("{}{}", self.addr, path);
        let mut req = self.http.delete(&url);
        if let Some(ref token) = self.token {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| CloudError::transient(format!("cloud DELETE {path} failed: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            let kind = if status.is_server_error() {
                CloudErrorKind::Transient
            } else {
                CloudErrorKind::Permanent
            };
            return Err(CloudError {
                kind,
                message: format!("cloud DELETE {path} returned {status}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CloudProvider for HttpCloudProvider {
    async fn describe_all(&self) -> Result<Vec<CloudInstance>, CloudError> {
        let value = self.get("/v1/instances").await?;
        let parsed: DescribeResponse = serde_json::from_value(value)
            .map_err(|e| CloudError::permanent(format!("malformed describe response: {e}")))?;
        Ok(parsed
            .instances
            .into_iter()
            .map(|raw| CloudInstance {
                instance_id: raw.instance_id,
                state: match raw.state.as_str() {
                    "running" => InstanceState::Running,
                    "pending" => InstanceState::Pending,
                    _ => InstanceState::Terminated,
                },
                public_ips: raw.public_ips,
            })
            .collect())
    }

    async fn run_one(&self, template: &VmTemplate) -> Result<String, CloudError> {
        let suffix = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        let body = serde_json::json!({
            "name": format!("{}-{}", template.name_prefix, suffix),
            "image": template.image,
            "instance_type": template.instance_type,
            "zone": template.zone,
            "vpc_id": template.vpc_id,
            "subnet_id": template.subnet_id,
            "security_group": template.security_group,
            "bandwidth_mbps": template.bandwidth_mbps,
        });
        let value = self.put("/v1/instances", &body).await?;
        let parsed: RunResponse = serde_json::from_value(value)
            .map_err(|e| CloudError::permanent(format!("malformed run response: {e}")))?;
        Ok(parsed.instance_id)
    }

    async fn terminate(&self, instance_ids: &[String]) -> Result<(), CloudError> {
        for id in instance_ids {
            if let Err(e) = self.delete(&format!("/v1/instances/{id}")).await {
                eprintln!("terminate({id}) failed: {e}");
            }
        }
        Ok(())
    }
}
