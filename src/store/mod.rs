//! Persistent device identity store.
//!
//! The store holds exactly one identity: the key material this process
//! registers with the protocol, plus the address it was linked to once
//! pairing succeeded.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::Jid;
use crate::error::DatabaseError;

pub use memory::MemoryDeviceStore;
#[cfg(feature = "postgres")]
pub use postgres::PgDeviceStore;

/// Length of the generated identity key.
pub const IDENTITY_KEY_LEN: usize = 32;

/// This process's registered endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: Uuid,
    /// Linked address, set once pairing completed.
    pub jid: Option<Jid>,
    pub registration_id: u32,
    #[serde(skip_serializing)]
    pub identity_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl DeviceIdentity {
    /// Generate a fresh, unpaired identity.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut identity_key = vec![0u8; IDENTITY_KEY_LEN];
        rng.fill(identity_key.as_mut_slice());

        Self {
            id: Uuid::new_v4(),
            jid: None,
            // Registration ids are 14-bit on the wire.
            registration_id: rng.gen_range(1..16380),
            identity_key,
            created_at: Utc::now(),
        }
    }

    pub fn paired(&self) -> bool {
        self.jid.is_some()
    }
}

/// Storage backend for the device identity.
#[async_trait]
pub trait DeviceStore: Send + Sync {
    /// Return the stored identity, creating an unpaired one on first use.
    async fn get_or_create_device(&self) -> Result<DeviceIdentity, DatabaseError>;

    /// Record the address the identity was linked to.
    async fn mark_paired(&self, device_id: Uuid, jid: &Jid) -> Result<(), DatabaseError>;

    /// Forget the identity; the next `get_or_create_device` starts over.
    async fn invalidate(&self, device_id: Uuid) -> Result<(), DatabaseError>;

    /// Cheap liveness probe.
    async fn health_check(&self) -> Result<(), DatabaseError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_identity_is_unpaired() {
        let device = DeviceIdentity::generate();
        assert!(!device.paired());
        assert_eq!(device.identity_key.len(), IDENTITY_KEY_LEN);
        assert!((1..16380).contains(&device.registration_id));
    }

    #[test]
    fn test_identity_key_never_serialized() {
        let device = DeviceIdentity::generate();
        let json = serde_json::to_value(&device).unwrap();
        assert!(json.get("identity_key").is_none());
        assert!(json["jid"].is_null());
    }
}
