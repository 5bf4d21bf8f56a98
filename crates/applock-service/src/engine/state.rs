//! Bookkeeping owned by the engine actor: the locked process set (kept in
//! activation order), the unlocked session, the in-flight challenge and the
//! overlay binding. Nothing here talks to a collaborator.

use applock_core::AppId;
use std::collections::{HashMap, VecDeque};

use crate::desktop::{ProcessId, SharedProcess};

#[derive(Clone)]
pub(crate) struct TrackedProcess {
    pub pid: ProcessId,
    pub app_id: AppId,
    pub name: String,
    pub handle: SharedProcess,
}

#[derive(Default)]
pub(crate) struct LockTable {
    tracked: HashMap<ProcessId, TrackedProcess>,
    /// Activation order; the overlay is bound to the front.
    queue: VecDeque<ProcessId>,
    unlocked_session: Option<AppId>,
    pub authenticating: Option<ProcessId>,
    pub overlay_bound: Option<ProcessId>,
}

impl LockTable {
    /// Returns `false` when the process is already tracked.
    pub fn insert(&mut self, handle: SharedProcess, app_id: AppId) -> bool {
        let pid = handle.pid();
        if self.tracked.contains_key(&pid) {
            return false;
        }
        let name = handle.display_name();
        self.tracked.insert(
            pid,
            TrackedProcess {
                pid,
                app_id,
                name,
                handle,
            },
        );
        self.queue.push_back(pid);
        true
    }

    pub fn remove(&mut self, pid: ProcessId) -> Option<TrackedProcess> {
        let removed = self.tracked.remove(&pid)?;
        self.queue.retain(|p| *p != pid);
        Some(removed)
    }

    /// Removes every tracked process of `app_id`, in activation order.
    pub fn remove_app(&mut self, app_id: &AppId) -> Vec<TrackedProcess> {
        let pids: Vec<ProcessId> = self
            .queue
            .iter()
            .copied()
            .filter(|pid| {
                self.tracked
                    .get(pid)
                    .map(|t| &t.app_id == app_id)
                    .unwrap_or(false)
            })
            .collect();
        pids.into_iter().filter_map(|pid| self.remove(pid)).collect()
    }

    pub fn get(&self, pid: ProcessId) -> Option<&TrackedProcess> {
        self.tracked.get(&pid)
    }

    pub fn contains(&self, pid: ProcessId) -> bool {
        self.tracked.contains_key(&pid)
    }

    pub fn front(&self) -> Option<&TrackedProcess> {
        self.queue.front().and_then(|pid| self.tracked.get(pid))
    }

    /// Tracked processes in activation order.
    pub fn iter(&self) -> impl Iterator<Item = &TrackedProcess> {
        self.queue.iter().filter_map(|pid| self.tracked.get(pid))
    }

    pub fn len(&self) -> usize {
        self.tracked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracked.is_empty()
    }

    pub fn clear(&mut self) -> Vec<TrackedProcess> {
        let drained: Vec<TrackedProcess> = self
            .queue
            .drain(..)
            .filter_map(|pid| self.tracked.remove(&pid))
            .collect();
        self.tracked.clear();
        drained
    }

    pub fn unlocked_session(&self) -> Option<&AppId> {
        self.unlocked_session.as_ref()
    }

    pub fn session_matches(&self, app_id: &AppId) -> bool {
        self.unlocked_session.as_ref() == Some(app_id)
    }

    /// Replaces any previous grant; only one application holds a session.
    pub fn grant_session(&mut self, app_id: AppId) {
        self.unlocked_session = Some(app_id);
    }

    /// Clears the session if it belongs to `app_id`.
    pub fn revoke_session_for(&mut self, app_id: &AppId) -> bool {
        if self.session_matches(app_id) {
            self.unlocked_session = None;
            true
        } else {
            false
        }
    }

    pub fn clear_session(&mut self) -> Option<AppId> {
        self.unlocked_session.take()
    }
}
