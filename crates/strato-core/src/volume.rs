use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Block device lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VolumeState {
    Available,
    Attaching,
    InUse,
    Detaching,
}

impl std::fmt::Display for VolumeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Available => write!(f, "available"),
            Self::Attaching => write!(f, "attaching"),
            Self::InUse => write!(f, "in-use"),
            Self::Detaching => write!(f, "detaching"),
        }
    }
}

/// Validate a block device state transition.
///
/// available → attaching → in-use → detaching → available; a failed
/// attach or detach returns the device to the stable state it left.
pub fn validate_transition(from: VolumeState, to: VolumeState) -> Result<()> {
    if from == to {
        return Ok(());
    }

    let valid = matches!(
        (from, to),
        (VolumeState::Available, VolumeState::Attaching)
            | (VolumeState::Attaching, VolumeState::InUse)
            | (VolumeState::Attaching, VolumeState::Available)
            | (VolumeState::InUse, VolumeState::Detaching)
            | (VolumeState::Detaching, VolumeState::Available)
            | (VolumeState::Detaching, VolumeState::InUse)
    );

    if valid {
        Ok(())
    } else {
        Err(CoreError::Precondition(format!(
            "invalid volume state transition: {} -> {}",
            from, to
        )))
    }
}

/// Block device row, persisted at volumes/<id>.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDevice {
    pub id: Uuid,
    pub tenant_id: String,
    #[serde(default)]
    pub name: String,
    pub size_gb: i64,
    pub state: VolumeState,
    #[serde(default)]
    pub bootable: bool,
    /// Ephemeral devices are deleted together with their instance.
    #[serde(default)]
    pub ephemeral: bool,
    pub created_at: DateTime<Utc>,
}

impl BlockDevice {
    pub fn new(tenant_id: &str, name: &str, size_gb: i64, bootable: bool, ephemeral: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            size_gb,
            state: VolumeState::Available,
            bootable,
            ephemeral,
            created_at: Utc::now(),
        }
    }
}

/// Instance ↔ block device link. Boot attachments cannot be detached by
/// the generic detach verb. The ordinal preserves declaration order so a
/// restart can re-issue the storage list exactly as it was declared.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub block_id: Uuid,
    #[serde(default)]
    pub boot: bool,
    #[serde(default)]
    pub ephemeral: bool,
    #[serde(default)]
    pub ordinal: u32,
}

impl Attachment {
    pub fn new(instance_id: Uuid, block_id: Uuid, boot: bool, ephemeral: bool, ordinal: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            instance_id,
            block_id,
            boot,
            ephemeral,
            ordinal,
        }
    }
}
