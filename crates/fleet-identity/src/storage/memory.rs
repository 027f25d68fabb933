//! Process-local identity store.

use std::sync::Mutex;

use crate::error::StoreError;
use crate::identity::Identity;
use crate::storage::IdentityStore;

/// Holds at most one identity in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    slot: Mutex<Option<Identity>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-populated with `identity`.
    pub fn with_identity(identity: Identity) -> Self {
        Self {
            slot: Mutex::new(Some(identity)),
        }
    }
}

impl IdentityStore for MemoryStore {
    fn load(&self) -> Result<Option<Identity>, StoreError> {
        let slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        Ok(slot.clone())
    }

    fn save(&self, identity: &Identity) -> Result<(), StoreError> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(identity.clone());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
