//! Crash recovery: after the datastore has been replayed, re-derive live
//! usage into the quota engine.

use tracing::{info, warn};

use strato_core::error::{CoreError, Result};
use strato_core::resources::{ResourceKind, ResourceRequest};
use strato_quota::QuotaEngine;
use strato_store::Datastore;

/// Reload limits and re-consume the usage implied by every live
/// instance, durable block device, and external-IP mapping. Appliance
/// instances consume no tenant quota and are skipped; ephemeral devices
/// live and die with their instance and never counted against the
/// volume quota.
pub async fn rederive_usage(store: &Datastore, quota: &QuotaEngine) -> Result<()> {
    for tenant in store.all_tenants().await {
        let limits = store.tenant_limits(&tenant.id).await;
        if !limits.is_empty() {
            quota.update_limits(&tenant.id, &limits);
        }
    }

    let mut instances = 0usize;
    for instance in store.all_instances().await {
        if instance.cnci {
            continue;
        }
        let mut demand = vec![ResourceRequest::new(ResourceKind::Instances, 1)];
        match store
            .get_workload(&instance.tenant_id, instance.workload_id)
            .await
        {
            Ok(workload) => {
                for kind in [ResourceKind::VCpus, ResourceKind::MemMb, ResourceKind::DiskMb] {
                    let value = workload.requested(kind);
                    if value > 0 {
                        demand.push(ResourceRequest::new(kind, value));
                    }
                }
            }
            Err(e) => {
                warn!(instance = %instance.id, error = %e,
                      "workload missing during recovery, counting instance only");
            }
        }
        let outcome = quota
            .consume(&instance.tenant_id, &demand)
            .await
            .map_err(|_| CoreError::Fatal("quota engine unavailable during recovery".into()))?;
        if !outcome.allowed() {
            // Usage legitimately exceeds a lowered limit; keep the truth
            // and let future consumes fail until something is released.
            warn!(tenant = %instance.tenant_id, instance = %instance.id,
                  "recovered usage exceeds limits");
        }
        instances += 1;
    }

    let mut volumes = 0usize;
    for volume in store.all_volumes().await {
        if volume.ephemeral {
            continue;
        }
        let mut demand = vec![ResourceRequest::new(ResourceKind::Volumes, 1)];
        if volume.size_gb > 0 {
            demand.push(ResourceRequest::new(
                ResourceKind::SharedDiskGb,
                volume.size_gb,
            ));
        }
        quota
            .consume(&volume.tenant_id, &demand)
            .await
            .map_err(|_| CoreError::Fatal("quota engine unavailable during recovery".into()))?;
        volumes += 1;
    }

    let mut mappings = 0usize;
    for mapping in store.mapped_ips(None).await {
        quota
            .consume(
                &mapping.tenant_id,
                &[ResourceRequest::new(ResourceKind::ExternalIps, 1)],
            )
            .await
            .map_err(|_| CoreError::Fatal("quota engine unavailable during recovery".into()))?;
        mappings += 1;
    }

    info!(instances, volumes, mappings, "usage re-derived from the datastore");
    Ok(())
}
