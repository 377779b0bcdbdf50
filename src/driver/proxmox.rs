use async_trait::async_trait;
use reqwest::{Client, Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::Ipv6Addr;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{DriverError, HostDriver, ObservedState};
use crate::models::ContainerSpec;

const DEFAULT_PORT: u16 = 8006;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxmoxConfig {
    pub host: String,
    pub user: String,
    pub token_name: String,
    pub token_value: String,
    #[serde(default = "default_node")]
    pub node: String,
    #[serde(default = "default_storage")]
    pub storage: String,
    #[serde(default)]
    pub verify_ssl: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub task_poll_interval_ms: u64,
}

pub(crate) fn default_node() -> String {
    "pve".to_string()
}

pub(crate) fn default_storage() -> String {
    "local-lvm".to_string()
}

pub(crate) fn default_poll_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct LxcSummary {
    vmid: Value,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

/// Drives LXC containers on a Proxmox VE node over its HTTPS API.
///
/// Containers are addressed by hostname, which is the orchestrator's container id.
/// Proxmox's numeric vmid is resolved on every call, so nothing driver-specific has to
/// be persisted.
pub struct ProxmoxDriver {
    client: Client,
    base_url: Url,
    auth_header: String,
    config: ProxmoxConfig,
}

impl ProxmoxDriver {
    pub fn new(config: ProxmoxConfig) -> Result<Self, DriverError> {
        let base_url = api_url(&config.host)?;
        Self::with_base_url(config, base_url)
    }

    fn with_base_url(config: ProxmoxConfig, base_url: Url) -> Result<Self, DriverError> {
        let client = Client::builder()
            .danger_accept_invalid_certs(!config.verify_ssl)
            .build()
            .map_err(|e| DriverError::terminal(format!("failed to build HTTP client: {e}")))?;

        let auth_header = format!(
            "PVEAPIToken={}!{}={}",
            config.user, config.token_name, config.token_value
        );

        info!("Proxmox driver targeting node {} at {}", config.node, base_url);

        Ok(Self {
            client,
            base_url,
            auth_header,
            config,
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, DriverError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| DriverError::terminal("Proxmox base URL cannot carry a path"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: Method,
        url: Url,
        body: Option<Value>,
    ) -> Result<T, DriverError> {
        debug!("Proxmox {} {}", method, url);
        let mut request = self
            .client
            .request(method, url)
            .header("Authorization", &self.auth_header);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?.error_for_status()?;
        let envelope: Envelope<T> = response.json().await?;
        Ok(envelope.data)
    }

    fn node_path(&self) -> [&str; 2] {
        ["nodes", self.config.node.as_str()]
    }

    /// Finds the container whose hostname matches `id`.
    async fn find(&self, id: &str) -> Result<Option<(u64, ObservedState)>, DriverError> {
        let [nodes, node] = self.node_path();
        let url = self.endpoint(&[nodes, node, "lxc"])?;
        let containers: Vec<LxcSummary> = self.call(Method::GET, url, None).await?;

        for container in containers {
            if container.name.as_deref() != Some(id) {
                continue;
            }
            let vmid = parse_vmid(&container.vmid).ok_or_else(|| {
                DriverError::terminal(format!("Proxmox returned a malformed vmid for {id}"))
            })?;
            return Ok(Some((vmid, parse_status(container.status.as_deref()))));
        }

        Ok(None)
    }

    async fn require(&self, id: &str) -> Result<(u64, ObservedState), DriverError> {
        self.find(id).await?.ok_or_else(|| {
            DriverError::terminal(format!(
                "container {id} does not exist on node {}",
                self.config.node
            ))
        })
    }

    async fn change_status(&self, vmid: u64, action: &str) -> Result<(), DriverError> {
        let [nodes, node] = self.node_path();
        let vmid = vmid.to_string();
        let url = self.endpoint(&[nodes, node, "lxc", &vmid, "status", action])?;
        let upid: Value = self.call(Method::POST, url, None).await?;
        self.wait_for_task(&upid).await
    }

    /// Polls a Proxmox task until it stops. A non-`OK` exit status is terminal.
    async fn wait_for_task(&self, upid: &Value) -> Result<(), DriverError> {
        let Some(upid) = upid.as_str() else {
            // Some endpoints finish synchronously and return null
            return Ok(());
        };

        let [nodes, node] = self.node_path();
        let url = self.endpoint(&[nodes, node, "tasks", upid, "status"])?;
        let interval = Duration::from_millis(self.config.task_poll_interval_ms);

        loop {
            let task: TaskStatus = self.call(Method::GET, url.clone(), None).await?;
            if task.status == "stopped" {
                return match task.exitstatus.as_deref() {
                    Some("OK") => Ok(()),
                    other => {
                        warn!("Proxmox task {} failed: {:?}", upid, other);
                        Err(DriverError::terminal(format!(
                            "task {upid} failed: {}",
                            other.unwrap_or("no exit status")
                        )))
                    }
                };
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn next_vmid(&self) -> Result<u64, DriverError> {
        let url = self.endpoint(&["cluster", "nextid"])?;
        let vmid: Value = self.call(Method::GET, url, None).await?;
        parse_vmid(&vmid)
            .ok_or_else(|| DriverError::terminal("Proxmox returned a malformed next vmid"))
    }
}

/// API root for `host`, which may carry a port and may be a bare IPv6 literal.
fn api_url(host: &str) -> Result<Url, DriverError> {
    let invalid = |reason: &str| DriverError::terminal(format!("invalid Proxmox host {host}: {reason}"));

    let authority = if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    // Parsed under a scheme with no default port, so an explicit `:443` stays visible
    let parsed =
        Url::parse(&format!("pve://{authority}")).map_err(|e| invalid(&e.to_string()))?;
    let name = parsed
        .host_str()
        .filter(|name| !name.is_empty())
        .ok_or_else(|| invalid("missing host name"))?;
    let port = parsed.port().unwrap_or(DEFAULT_PORT);

    Url::parse(&format!("https://{name}:{port}/api2/json/")).map_err(|e| invalid(&e.to_string()))
}

fn parse_vmid(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn parse_status(status: Option<&str>) -> ObservedState {
    match status {
        Some("running") => ObservedState::Running,
        Some("stopped") => ObservedState::Stopped,
        _ => ObservedState::Unknown,
    }
}

fn rootfs_size_gb(disk_mb: u32) -> u32 {
    disk_mb.div_ceil(1024)
}

#[async_trait]
impl HostDriver for ProxmoxDriver {
    async fn create(&self, id: &str, spec: &ContainerSpec) -> Result<(), DriverError> {
        if self.find(id).await?.is_some() {
            info!("Container {} already exists on Proxmox, nothing to create", id);
            return Ok(());
        }

        let vmid = self.next_vmid().await?;
        info!("Creating container {} as vmid {} from {}", id, vmid, spec.template);

        let [nodes, node] = self.node_path();
        let url = self.endpoint(&[nodes, node, "lxc"])?;
        let body = json!({
            "vmid": vmid,
            "hostname": id,
            "ostemplate": spec.template,
            "cores": spec.cores,
            "memory": spec.memory_mb,
            "swap": spec.swap_mb,
            "rootfs": format!("{}:{}", self.config.storage, rootfs_size_gb(spec.disk_mb)),
        });
        let upid: Value = self.call(Method::POST, url, Some(body)).await?;
        self.wait_for_task(&upid).await
    }

    async fn start(&self, id: &str) -> Result<(), DriverError> {
        let (vmid, observed) = self.require(id).await?;
        if observed == ObservedState::Running {
            return Ok(());
        }
        self.change_status(vmid, "start").await
    }

    async fn stop(&self, id: &str) -> Result<(), DriverError> {
        let (vmid, observed) = self.require(id).await?;
        if observed == ObservedState::Stopped {
            return Ok(());
        }
        self.change_status(vmid, "stop").await
    }

    async fn restart(&self, id: &str) -> Result<(), DriverError> {
        let (vmid, observed) = self.require(id).await?;
        match observed {
            ObservedState::Running => self.change_status(vmid, "reboot").await,
            _ => self.change_status(vmid, "start").await,
        }
    }

    async fn destroy(&self, id: &str) -> Result<(), DriverError> {
        let Some((vmid, _)) = self.find(id).await? else {
            return Ok(());
        };

        info!("Destroying container {} (vmid {})", id, vmid);
        let [nodes, node] = self.node_path();
        let vmid = vmid.to_string();
        let mut url = self.endpoint(&[nodes, node, "lxc", &vmid])?;
        url.query_pairs_mut()
            .append_pair("force", "1")
            .append_pair("purge", "1");
        let upid: Value = self.call(Method::DELETE, url, None).await?;
        self.wait_for_task(&upid).await
    }

    async fn inspect(&self, id: &str) -> Result<ObservedState, DriverError> {
        let Some((vmid, _)) = self.find(id).await? else {
            return Ok(ObservedState::Missing);
        };

        #[derive(Deserialize)]
        struct CurrentStatus {
            #[serde(default)]
            status: Option<String>,
        }

        let [nodes, node] = self.node_path();
        let vmid = vmid.to_string();
        let url = self.endpoint(&[nodes, node, "lxc", &vmid, "status", "current"])?;
        let current: CurrentStatus = self.call(Method::GET, url, None).await?;
        Ok(parse_status(current.status.as_deref()))
    }
}
