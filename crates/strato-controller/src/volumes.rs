//! Volume attach/detach verbs.
//!
//! The synchronous part moves the device into its transitional state and
//! queues the node command; the node's later success or failure frame
//! settles (or reverts) the transition.

use uuid::Uuid;

use strato_core::error::{CoreError, Result};
use strato_core::volume::{BlockDevice, VolumeState};

use crate::Controller;

impl Controller {
    /// Attach an available volume to an assigned instance of the same
    /// tenant. The device is `attaching` until the node acknowledges.
    pub async fn attach_volume(
        &self,
        tenant_id: &str,
        volume_id: Uuid,
        instance_id: Uuid,
    ) -> Result<()> {
        let volume = self.owned_volume(tenant_id, volume_id).await?;
        if volume.state != VolumeState::Available {
            return Err(CoreError::Precondition(format!(
                "volume {volume_id} is {}, must be available",
                volume.state
            )));
        }

        let instance = self.owned_instance(tenant_id, instance_id).await?;
        if !instance.assigned() {
            return Err(CoreError::Precondition(format!(
                "instance {instance_id} is not assigned to a node"
            )));
        }

        self.store
            .set_volume_state(volume_id, VolumeState::Attaching)
            .await?;
        let attachment = match self
            .store
            .create_attachment(instance_id, volume_id, false, false)
            .await
        {
            Ok(att) => att,
            Err(e) => {
                let _ = self
                    .store
                    .set_volume_state(volume_id, VolumeState::Available)
                    .await;
                return Err(e);
            }
        };

        if let Err(e) = self
            .node
            .attach_volume(volume_id, instance_id, &instance.node_id)
            .await
        {
            // The command never left the queue; undo the provisional state.
            let _ = self.store.delete_attachment(attachment.id).await;
            let _ = self
                .store
                .set_volume_state(volume_id, VolumeState::Available)
                .await;
            return Err(e);
        }
        Ok(())
    }

    /// Detach an in-use volume. Boot attachments are refused: the device
    /// holds the instance's root filesystem.
    pub async fn detach_volume(&self, tenant_id: &str, volume_id: Uuid) -> Result<()> {
        let volume = self.owned_volume(tenant_id, volume_id).await?;
        if volume.state != VolumeState::InUse {
            return Err(CoreError::Precondition(format!(
                "volume {volume_id} is {}, only in-use volumes can be detached",
                volume.state
            )));
        }

        let attachment = self
            .store
            .attachment_for_volume(volume_id)
            .await
            .ok_or_else(|| {
                CoreError::Precondition(format!("volume {volume_id} has no attachment"))
            })?;
        if attachment.boot {
            return Err(CoreError::Precondition(format!(
                "volume {volume_id} is a boot volume and cannot be detached"
            )));
        }

        let instance = self.store.get_instance(attachment.instance_id).await?;

        self.store
            .set_volume_state(volume_id, VolumeState::Detaching)
            .await?;
        if let Err(e) = self
            .node
            .detach_volume(volume_id, instance.id, &instance.node_id)
            .await
        {
            let _ = self
                .store
                .set_volume_state(volume_id, VolumeState::InUse)
                .await;
            return Err(e);
        }
        Ok(())
    }

    pub(crate) async fn owned_volume(
        &self,
        tenant_id: &str,
        volume_id: Uuid,
    ) -> Result<BlockDevice> {
        let volume = self.store.get_volume(volume_id).await?;
        if volume.tenant_id != tenant_id {
            return Err(CoreError::ownership("volume", volume_id));
        }
        Ok(volume)
    }
}
