use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Filesystem locations of the controller's stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabasePaths {
    /// Durable entity tables + event log.
    pub persistent: PathBuf,
    /// Last-known stats, trace frames; rebuilt after a restart.
    pub transient: PathBuf,
    /// Content-addressed image cache (consumed opaquely).
    pub image: PathBuf,
}

impl Default for DatabasePaths {
    fn default() -> Self {
        Self {
            persistent: PathBuf::from("/var/lib/strato/data"),
            transient: PathBuf::from("/var/lib/strato/transient"),
            image: PathBuf::from("/var/lib/strato/images"),
        }
    }
}

/// The controller's entire configuration, deserialized from one TOML file
/// (plus flag overrides) and passed to the core at construction. There is
/// no module-level configuration state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Client certificate for the node-bus session layer.
    pub cert: PathBuf,
    pub ca_cert: PathBuf,
    /// Address of the scheduling peer, host:port.
    pub server_url: String,
    pub identity_endpoint: String,
    pub service_user: String,
    pub service_password: String,
    pub volume_port: u16,
    pub compute_port: u16,
    pub api_port: u16,
    pub https_cert: PathBuf,
    pub https_key: PathBuf,
    /// Directory of workload definition TOML files loaded at startup.
    pub workloads_path: PathBuf,
    /// Directory of seed tables (per-tenant limits) applied at startup.
    pub tables_init_path: PathBuf,
    /// Disable tenant networking: no appliance is launched and readiness
    /// completes once the tenant row exists.
    pub no_network: bool,
    pub appliance_vcpus: i64,
    pub appliance_mem_mb: i64,
    pub appliance_disk_mb: i64,
    pub admin_ssh_key: String,
    pub admin_password: String,
    pub storage_backend_id: String,
    // Kept last so the TOML serializer emits the table after the scalars.
    pub database: DatabasePaths,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            cert: PathBuf::from("/etc/strato/cert.pem"),
            ca_cert: PathBuf::from("/etc/strato/ca.pem"),
            server_url: "localhost:8888".into(),
            identity_endpoint: "localhost:35357".into(),
            service_user: "strato".into(),
            service_password: String::new(),
            volume_port: 8776,
            compute_port: 8774,
            api_port: 8889,
            https_cert: PathBuf::from("/etc/strato/https-cert.pem"),
            https_key: PathBuf::from("/etc/strato/https-key.pem"),
            workloads_path: PathBuf::from("/etc/strato/workloads"),
            tables_init_path: PathBuf::from("/etc/strato/tables"),
            no_network: false,
            appliance_vcpus: 4,
            appliance_mem_mb: 2048,
            appliance_disk_mb: 2048,
            admin_ssh_key: String::new(),
            admin_password: String::new(),
            storage_backend_id: String::new(),
            database: DatabasePaths::default(),
        }
    }
}

impl CoreConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CoreError::BadRequest(format!("cannot read config {}: {e}", path.display()))
        })?;
        toml::from_str(&raw)
            .map_err(|e| CoreError::BadRequest(format!("cannot parse config {}: {e}", path.display())))
    }
}
