use crate::{envelope::SyncEvent, error::SyncError, types::SyncStatus};

/// Worker-side guard over sync status transitions.
///
/// The worker feeds every status it wants to report through here; only real,
/// allowed changes turn into `StatusChanged` events.
#[derive(Debug, Clone, Default)]
pub struct SyncStatusMachine {
    status: SyncStatus,
}

impl SyncStatusMachine {
    pub fn status(&self) -> SyncStatus {
        self.status
    }

    /// Move to `next`.
    ///
    /// Returns `Ok(None)` when already in `next`, and the event to emit
    /// otherwise.
    pub fn transition(&mut self, next: SyncStatus) -> Result<Option<SyncEvent>, SyncError> {
        if self.status == next {
            return Ok(None);
        }
        if !Self::allowed(self.status, next) {
            return Err(SyncError::invalid_transition(self.status, next));
        }

        self.status = next;
        Ok(Some(SyncEvent::StatusChanged { new_value: next }))
    }

    /// Unconditionally enter `Error`.
    pub fn on_error(&mut self) -> Option<SyncEvent> {
        if self.status == SyncStatus::Error {
            return None;
        }
        self.status = SyncStatus::Error;
        Some(SyncEvent::StatusChanged {
            new_value: SyncStatus::Error,
        })
    }

    fn allowed(current: SyncStatus, next: SyncStatus) -> bool {
        use SyncStatus::*;

        match (current, next) {
            (_, Stopped) | (_, Error) => true,
            (Stopped, InitialSync | CatchupSync) => true,
            (InitialSync | CatchupSync, Syncing) => true,
            (Syncing, CatchupSync) => true,
            (Error, InitialSync | CatchupSync | Syncing) => true,
            _ => false,
        }
    }
}
