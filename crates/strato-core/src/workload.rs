use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};
use crate::resources::{ResourceKind, ResourceRequest};

/// Kind of machine a workload materialises into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmType {
    FullVm,
    Container,
}

/// Boot firmware for full-vm workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Firmware {
    Efi,
    Legacy,
}

/// Where a declared storage resource gets its content from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageSource {
    /// Blank device; the only source for which `size_gb` is legal.
    Empty,
    /// Copied from a content-addressed image.
    Image,
    /// An existing volume, attached as-is.
    Volume,
    /// Derived from a volume snapshot.
    Snapshot,
}

/// One storage declaration inside a workload template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageResource {
    pub source: StorageSource,
    /// Image id, volume id, or snapshot id, depending on `source`.
    #[serde(default)]
    pub source_id: String,
    #[serde(default)]
    pub bootable: bool,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub size_gb: i64,
}

impl StorageResource {
    fn validate(&self) -> Result<()> {
        if self.size_gb > 0 && self.source != StorageSource::Empty {
            return Err(CoreError::BadRequest(
                "storage size is only legal for empty storage".into(),
            ));
        }
        if self.source == StorageSource::Empty && self.bootable {
            return Err(CoreError::BadRequest(
                "empty storage may not be bootable".into(),
            ));
        }
        if self.source != StorageSource::Empty && self.source_id.is_empty() {
            return Err(CoreError::BadRequest(format!(
                "{:?} storage requires a source id",
                self.source
            )));
        }
        Ok(())
    }
}

/// Immutable template from which instances are launched.
///
/// Scope is either one tenant (`tenant_id = Some`) or global
/// (`tenant_id = None`); lookup tries the tenant scope first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    pub id: Uuid,
    #[serde(default)]
    pub tenant_id: Option<String>,
    pub description: String,
    pub vm_type: VmType,
    #[serde(default = "default_firmware")]
    pub firmware: Firmware,
    #[serde(default)]
    pub image_id: String,
    #[serde(default)]
    pub image_name: String,
    #[serde(default)]
    pub storage: Vec<StorageResource>,
    /// Per-instance resource demands (vcpus, mem_mb, ...).
    pub defaults: Vec<ResourceRequest>,
    /// Opaque configuration blob handed to the node agent at start.
    #[serde(default)]
    pub config: String,
    /// Marks the tenant network appliance template. Appliance starts
    /// bypass readiness (they are what readiness waits for) and consume
    /// no tenant quota.
    #[serde(default)]
    pub cnci: bool,
}

fn default_firmware() -> Firmware {
    Firmware::Legacy
}

impl Workload {
    /// Validate the template. Invariants: full-vm workloads need at least
    /// one storage resource and at least one bootable one; container
    /// workloads need a non-empty image name.
    pub fn validate(&self) -> Result<()> {
        match self.vm_type {
            VmType::FullVm => {
                if self.storage.is_empty() {
                    return Err(CoreError::BadRequest(
                        "full-vm workload needs at least one storage resource".into(),
                    ));
                }
                if !self.storage.iter().any(|s| s.bootable) {
                    return Err(CoreError::BadRequest(
                        "full-vm workload needs a bootable storage resource".into(),
                    ));
                }
            }
            VmType::Container => {
                if self.image_name.is_empty() {
                    return Err(CoreError::BadRequest(
                        "container workload needs an image name".into(),
                    ));
                }
            }
        }
        for resource in &self.storage {
            resource.validate()?;
        }
        Ok(())
    }

    /// Defaulted demand for one resource kind, 0 when not declared.
    pub fn requested(&self, kind: ResourceKind) -> i64 {
        self.defaults
            .iter()
            .find(|r| r.kind == kind)
            .map(|r| r.value)
            .unwrap_or(0)
    }
}
