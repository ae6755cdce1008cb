//! In-process device store, used with `--no-db` and in tests.

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{DeviceIdentity, DeviceStore};
use crate::client::Jid;
use crate::error::DatabaseError;

/// Device store that lives only as long as the process.
#[derive(Debug, Default)]
pub struct MemoryDeviceStore {
    device: RwLock<Option<DeviceIdentity>>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with an existing identity.
    pub fn with_device(device: DeviceIdentity) -> Self {
        Self {
            device: RwLock::new(Some(device)),
        }
    }

    /// Current identity without creating one.
    pub async fn peek(&self) -> Option<DeviceIdentity> {
        self.device.read().await.clone()
    }
}

#[async_trait]
impl DeviceStore for MemoryDeviceStore {
    async fn get_or_create_device(&self) -> Result<DeviceIdentity, DatabaseError> {
        let mut slot = self.device.write().await;
        Ok(slot.get_or_insert_with(DeviceIdentity::generate).clone())
    }

    async fn mark_paired(&self, device_id: Uuid, jid: &Jid) -> Result<(), DatabaseError> {
        let mut slot = self.device.write().await;
        match slot.as_mut() {
            Some(device) if device.id == device_id => {
                device.jid = Some(jid.clone());
                Ok(())
            }
            _ => Err(DatabaseError::NotFound {
                id: device_id.to_string(),
            }),
        }
    }

    async fn invalidate(&self, device_id: Uuid) -> Result<(), DatabaseError> {
        let mut slot = self.device.write().await;
        if slot.as_ref().is_some_and(|d| d.id == device_id) {
            *slot = None;
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), DatabaseError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_or_create_is_stable() {
        let store = MemoryDeviceStore::new();
        let first = store.get_or_create_device().await.unwrap();
        let second = store.get_or_create_device().await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(!first.paired());
    }

    #[tokio::test]
    async fn test_mark_paired_then_invalidate() {
        let store = MemoryDeviceStore::new();
        let device = store.get_or_create_device().await.unwrap();
        let jid = Jid::new("1555000111", "s.whatsapp.net");

        store.mark_paired(device.id, &jid).await.unwrap();
        assert_eq!(store.peek().await.unwrap().jid, Some(jid));

        store.invalidate(device.id).await.unwrap();
        assert!(store.peek().await.is_none());

        let fresh = store.get_or_create_device().await.unwrap();
        assert_ne!(fresh.id, device.id);
        assert!(!fresh.paired());
    }

    #[tokio::test]
    async fn test_mark_paired_unknown_device() {
        let store = MemoryDeviceStore::new();
        let err = store
            .mark_paired(Uuid::new_v4(), &Jid::new("1", "s.whatsapp.net"))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }
}
