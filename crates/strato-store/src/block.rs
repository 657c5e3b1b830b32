use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use strato_core::error::{CoreError, Result};

/// Block-device backend capability. The controller chooses the device id
/// and hands it to the backend; the backend owns the bytes.
///
/// Real deployments implement this against their storage cluster; the
/// core only depends on the trait.
#[async_trait]
pub trait BlockDriver: Send + Sync {
    /// Create a blank device of the given size.
    async fn create(&self, id: Uuid, size_gb: i64) -> Result<()>;
    /// Create a device holding a copy of an image.
    async fn create_from_image(&self, id: Uuid, image_id: &str) -> Result<()>;
    /// Create a device derived from a snapshot.
    async fn create_from_snapshot(&self, id: Uuid, snapshot_id: &str) -> Result<()>;
    /// Copy an existing device.
    async fn copy(&self, id: Uuid, source: Uuid) -> Result<()>;
    /// Snapshot a device under the given name.
    async fn snapshot(&self, source: Uuid, name: &str) -> Result<()>;
    async fn delete(&self, id: Uuid) -> Result<()>;
}

#[derive(Debug, Clone)]
struct LocalDevice {
    size_gb: i64,
    origin: String,
}

/// In-memory backend for tests and single-node deployments.
#[derive(Default)]
pub struct LocalBlockDriver {
    devices: Mutex<HashMap<Uuid, LocalDevice>>,
    snapshots: Mutex<HashMap<String, Uuid>>,
}

impl LocalBlockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().unwrap().len()
    }

    pub fn exists(&self, id: Uuid) -> bool {
        self.devices.lock().unwrap().contains_key(&id)
    }

    fn insert(&self, id: Uuid, size_gb: i64, origin: String) -> Result<()> {
        let mut devices = self.devices.lock().unwrap();
        if devices.contains_key(&id) {
            return Err(CoreError::Precondition(format!(
                "block device {id} already exists"
            )));
        }
        devices.insert(id, LocalDevice { size_gb, origin });
        Ok(())
    }
}

#[async_trait]
impl BlockDriver for LocalBlockDriver {
    async fn create(&self, id: Uuid, size_gb: i64) -> Result<()> {
        self.insert(id, size_gb, "blank".into())
    }

    async fn create_from_image(&self, id: Uuid, image_id: &str) -> Result<()> {
        self.insert(id, 0, format!("image:{image_id}"))
    }

    async fn create_from_snapshot(&self, id: Uuid, snapshot_id: &str) -> Result<()> {
        if !self.snapshots.lock().unwrap().contains_key(snapshot_id) {
            return Err(CoreError::not_found("snapshot", snapshot_id));
        }
        self.insert(id, 0, format!("snapshot:{snapshot_id}"))
    }

    async fn copy(&self, id: Uuid, source: Uuid) -> Result<()> {
        let size = {
            let devices = self.devices.lock().unwrap();
            devices
                .get(&source)
                .map(|d| d.size_gb)
                .ok_or_else(|| CoreError::not_found("block device", source))?
        };
        self.insert(id, size, format!("copy:{source}"))
    }

    async fn snapshot(&self, source: Uuid, name: &str) -> Result<()> {
        if !self.devices.lock().unwrap().contains_key(&source) {
            return Err(CoreError::not_found("block device", source));
        }
        self.snapshots
            .lock()
            .unwrap()
            .insert(name.to_string(), source);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<()> {
        self.devices
            .lock()
            .unwrap()
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| CoreError::not_found("block device", id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_and_delete() {
        let driver = LocalBlockDriver::new();
        let id = Uuid::new_v4();
        driver.create(id, 10).await.unwrap();
        assert!(driver.exists(id));
        assert!(driver.create(id, 10).await.is_err());

        driver.delete(id).await.unwrap();
        assert!(!driver.exists(id));
        assert!(driver.delete(id).await.is_err());
    }

    #[tokio::test]
    async fn test_snapshot_chain() {
        let driver = LocalBlockDriver::new();
        let src = Uuid::new_v4();
        driver.create_from_image(src, "img-1").await.unwrap();
        driver.snapshot(src, "snap-1").await.unwrap();

        let derived = Uuid::new_v4();
        driver.create_from_snapshot(derived, "snap-1").await.unwrap();
        assert!(driver.exists(derived));
        assert!(
            driver
                .create_from_snapshot(Uuid::new_v4(), "missing")
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_copy_requires_source() {
        let driver = LocalBlockDriver::new();
        assert!(driver.copy(Uuid::new_v4(), Uuid::new_v4()).await.is_err());
    }
}
