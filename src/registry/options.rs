//! In-memory volume option store
//!
//! Backs the [`OptionSource`] port for the binary and for tests. Keys are
//! dotted translator options such as `io-threads.thread-count`.

use super::events::RegistryEvent;
use crate::domain::{OptionSource, VolumeId};
use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Per-volume key/value options held in memory
#[derive(Debug, Default)]
pub struct MemoryOptions {
    options: RwLock<BTreeMap<VolumeId, BTreeMap<String, String>>>,
}

impl MemoryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set an option on a volume
    pub fn set(&self, volume: &VolumeId, key: &str, value: &str) -> Result<()> {
        if key.is_empty() || key.chars().any(char::is_whitespace) {
            return Err(Error::Validation(format!("invalid option key {:?}", key)));
        }
        if value.contains('\n') {
            return Err(Error::Validation(format!(
                "option {} value must be a single line",
                key
            )));
        }
        self.options
            .write()
            .entry(volume.clone())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Remove an option; returns the previous value
    pub fn unset(&self, volume: &VolumeId, key: &str) -> Option<String> {
        let mut options = self.options.write();
        let removed = options.get_mut(volume).and_then(|m| m.remove(key));
        if options.get(volume).map(|m| m.is_empty()).unwrap_or(false) {
            options.remove(volume);
        }
        removed
    }

    /// Drop every option of a deleted volume
    pub fn clear(&self, volume: &VolumeId) {
        self.options.write().remove(volume);
    }

    /// Forget a volume's options once the registry deletes it
    pub fn follow(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<RegistryEvent>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(RegistryEvent::VolumeDeleted { volume_id }) => {
                        debug!(volume = %volume_id, "Dropping options of deleted volume");
                        store.clear(&volume_id);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Option store lagged behind registry events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

impl OptionSource for MemoryOptions {
    fn options(&self, volume: &VolumeId) -> BTreeMap<String, String> {
        self.options.read().get(volume).cloned().unwrap_or_default()
    }
}
