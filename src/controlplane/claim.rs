//! Target claims
//!
//! At most one active task per target. A claim is taken atomically through the
//! map's entry API and held by a guard that releases it on drop, whichever way
//! the task ends. A task touching several targets claims all of them or none.

use super::task::Target;
use crate::domain::TaskId;
use crate::error::{Error, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Active task per target
#[derive(Debug, Default)]
pub struct TargetClaims {
    claims: DashMap<Target, TaskId>,
}

impl TargetClaims {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claim `target` for `task`, or fail with a conflict naming the holder
    pub fn claim(self: &Arc<Self>, target: &Target, task: &TaskId) -> Result<ClaimGuard> {
        self.claim_all(std::slice::from_ref(target), task)
    }

    /// Claim every target for `task`. On conflict the targets claimed so far
    /// are released and nothing stays held.
    pub fn claim_all(self: &Arc<Self>, targets: &[Target], task: &TaskId) -> Result<ClaimGuard> {
        let mut guard = ClaimGuard {
            claims: Arc::clone(self),
            targets: Vec::with_capacity(targets.len()),
            task: task.clone(),
        };
        for target in targets {
            match self.claims.entry(target.clone()) {
                Entry::Occupied(held) if held.get() == task => {}
                Entry::Occupied(held) => {
                    return Err(Error::conflict(format!(
                        "task already active on {}: {}",
                        target,
                        held.get()
                    )))
                }
                Entry::Vacant(slot) => {
                    slot.insert(task.clone());
                    debug!(%target, task = %task, "Target claimed");
                    guard.targets.push(target.clone());
                }
            }
        }
        Ok(guard)
    }

    /// Task currently holding `target`
    pub fn holder(&self, target: &Target) -> Option<TaskId> {
        self.claims.get(target).map(|t| t.clone())
    }

    pub fn active_count(&self) -> usize {
        self.claims.len()
    }
}

/// Releases its claims when dropped
#[derive(Debug)]
pub struct ClaimGuard {
    claims: Arc<TargetClaims>,
    targets: Vec<Target>,
    task: TaskId,
}

impl ClaimGuard {
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        for target in &self.targets {
            self.claims
                .claims
                .remove_if(target, |_, holder| holder == &self.task);
            debug!(%target, task = %self.task, "Target released");
        }
    }
}
