use serde::{Deserialize, Serialize};

/// Limit value meaning "no limit".
pub const UNLIMITED: i64 = -1;

/// Resource kinds tracked per tenant by the quota engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Instances,
    VCpus,
    MemMb,
    DiskMb,
    Images,
    Volumes,
    SharedDiskGb,
    ExternalIps,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 8] = [
        ResourceKind::Instances,
        ResourceKind::VCpus,
        ResourceKind::MemMb,
        ResourceKind::DiskMb,
        ResourceKind::Images,
        ResourceKind::Volumes,
        ResourceKind::SharedDiskGb,
        ResourceKind::ExternalIps,
    ];
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Instances => write!(f, "instances"),
            Self::VCpus => write!(f, "vcpus"),
            Self::MemMb => write!(f, "mem_mb"),
            Self::DiskMb => write!(f, "disk_mb"),
            Self::Images => write!(f, "images"),
            Self::Volumes => write!(f, "volumes"),
            Self::SharedDiskGb => write!(f, "shared_disk_gb"),
            Self::ExternalIps => write!(f, "external_ips"),
        }
    }
}

/// One itemised resource demand (or release), e.g. `vcpus = 2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub kind: ResourceKind,
    pub value: i64,
}

impl ResourceRequest {
    pub fn new(kind: ResourceKind, value: i64) -> Self {
        Self { kind, value }
    }
}

/// Usage/limit snapshot for one resource kind of one tenant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuotaDetail {
    pub kind: ResourceKind,
    pub usage: i64,
    pub limit: i64,
}

impl QuotaDetail {
    pub fn unlimited(&self) -> bool {
        self.limit == UNLIMITED
    }
}

/// Sum requested values per kind, collapsing duplicates.
pub fn collapse(requests: &[ResourceRequest]) -> Vec<ResourceRequest> {
    let mut out: Vec<ResourceRequest> = Vec::new();
    for req in requests {
        match out.iter_mut().find(|r| r.kind == req.kind) {
            Some(r) => r.value += req.value,
            None => out.push(*req),
        }
    }
    out
}
