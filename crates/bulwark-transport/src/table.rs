//! Live sessions keyed by `(peer, service)`.
//!
//! The table holds a handle per running session task. Dropping a handle
//! closes the task's command queue, which makes the task say goodbye and
//! exit, so removing an entry is enough to tear the session down.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::actor::{Command, SessionEnd, SessionStatus};
use crate::frame::{ClusterId, ServiceId};

/// Identifies one session slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    /// Remote cluster.
    pub peer: ClusterId,
    /// Service hash.
    pub svc: ServiceId,
}

pub(crate) struct SessionHandle {
    pub(crate) id: u64,
    pub(crate) commands: mpsc::Sender<Command>,
    pub(crate) status: Arc<Mutex<SessionStatus>>,
    pub(crate) task: JoinHandle<SessionEnd>,
}

impl SessionHandle {
    fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_live(&self) -> bool {
        !self.task.is_finished() && !self.commands.is_closed() && self.status().is_live()
    }
}

/// A slot already holds a live session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("session already live for peer {} on service {}", .0.peer, .0.svc)]
pub struct SessionExists(pub SessionKey);

/// One row of [`SessionTable::snapshot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    /// Slot.
    pub key: SessionKey,
    /// Generation of the session in this slot.
    pub id: u64,
    /// Latest published status.
    pub status: SessionStatus,
}

#[derive(Default)]
pub(crate) struct SessionTable {
    sessions: Mutex<HashMap<SessionKey, SessionHandle>>,
    next_id: AtomicU64,
}

impl SessionTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Fresh generation number for a session about to be inserted.
    pub(crate) fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Inserts a session into an empty or dead slot.
    pub(crate) fn create(&self, key: SessionKey, handle: SessionHandle) -> Result<(), SessionExists> {
        let mut sessions = self.lock();
        if sessions.get(&key).is_some_and(SessionHandle::is_live) {
            return Err(SessionExists(key));
        }
        sessions.insert(key, handle);
        Ok(())
    }

    /// Installs `handle`, closing whatever session held the slot.
    pub(crate) fn rotate(&self, key: SessionKey, handle: SessionHandle) -> bool {
        let replaced = self.lock().insert(key, handle);
        replaced.is_some_and(|old| old.is_live())
    }

    /// Removes the slot's session.
    pub(crate) fn evict(&self, key: &SessionKey) -> bool {
        self.lock().remove(key).is_some()
    }

    /// Removes the slot's session only if it is still generation `id`.
    pub(crate) fn evict_if(&self, key: &SessionKey, id: u64) -> bool {
        let mut sessions = self.lock();
        if sessions.get(key).is_some_and(|h| h.id == id) {
            sessions.remove(key);
            true
        } else {
            false
        }
    }

    /// Queue and generation of the live session in the slot.
    pub(crate) fn sender(&self, key: &SessionKey) -> Option<(mpsc::Sender<Command>, u64)> {
        self.lock()
            .get(key)
            .filter(|h| h.is_live())
            .map(|h| (h.commands.clone(), h.id))
    }

    pub(crate) fn is_live(&self, key: &SessionKey) -> bool {
        self.lock().get(key).is_some_and(SessionHandle::is_live)
    }

    /// Drops every session whose task has ended.
    pub(crate) fn prune(&self) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, h| h.is_live());
        before - sessions.len()
    }

    pub(crate) fn snapshot(&self) -> Vec<SessionSummary> {
        let mut rows: Vec<_> = self
            .lock()
            .iter()
            .map(|(key, h)| SessionSummary {
                key: *key,
                id: h.id,
                status: h.status(),
            })
            .collect();
        rows.sort_by_key(|row| row.key);
        rows
    }

    /// Empties the table and hands back the task handles.
    pub(crate) fn drain(&self) -> Vec<JoinHandle<SessionEnd>> {
        self.lock().drain().map(|(_, h)| h.task).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionKey, SessionHandle>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionStats;

    fn key(peer: u8) -> SessionKey {
        SessionKey {
            peer: ClusterId::from_bytes([peer; 16]),
            svc: ServiceId::from_name("svc"),
        }
    }

    fn idle_status() -> SessionStatus {
        SessionStatus {
            stats: SessionStats::default(),
            rejected: 0,
            epochs: (0, 0),
            ended: None,
        }
    }

    /// A handle whose task parks until its queue closes.
    fn handle(table: &SessionTable) -> (SessionHandle, Arc<Mutex<SessionStatus>>) {
        let (tx, mut rx) = mpsc::channel::<Command>(1);
        let status = Arc::new(Mutex::new(idle_status()));
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {}
            SessionEnd::Closed
        });
        let h = SessionHandle {
            id: table.allocate_id(),
            commands: tx,
            status: Arc::clone(&status),
            task,
        };
        (h, status)
    }

    #[tokio::test]
    async fn create_refuses_a_live_slot() {
        let table = SessionTable::new();
        let (first, _) = handle(&table);
        let (second, _) = handle(&table);
        table.create(key(1), first).unwrap();
        assert_eq!(table.create(key(1), second), Err(SessionExists(key(1))));
        assert!(table.is_live(&key(1)));
    }

    #[tokio::test]
    async fn create_reuses_a_dead_slot() {
        let table = SessionTable::new();
        let (first, status) = handle(&table);
        table.create(key(1), first).unwrap();
        status.lock().unwrap().ended = Some(SessionEnd::Expired);
        assert!(!table.is_live(&key(1)));
        let (second, _) = handle(&table);
        table.create(key(1), second).unwrap();
        assert!(table.is_live(&key(1)));
    }

    #[tokio::test]
    async fn rotate_replaces_and_closes() {
        let table = SessionTable::new();
        let (first, _) = handle(&table);
        let first_id = first.id;
        table.create(key(1), first).unwrap();

        let (second, _) = handle(&table);
        assert!(table.rotate(key(1), second));
        let (_, id) = table.sender(&key(1)).unwrap();
        assert_ne!(id, first_id);
    }

    #[tokio::test]
    async fn evict_if_respects_generation() {
        let table = SessionTable::new();
        let (first, _) = handle(&table);
        let first_id = first.id;
        table.create(key(1), first).unwrap();
        let (second, _) = handle(&table);
        table.rotate(key(1), second);

        assert!(!table.evict_if(&key(1), first_id));
        assert!(table.is_live(&key(1)));
        assert!(table.evict(&key(1)));
        assert!(table.sender(&key(1)).is_none());
    }

    #[tokio::test]
    async fn prune_and_snapshot() {
        let table = SessionTable::new();
        let (a, a_status) = handle(&table);
        let (b, _) = handle(&table);
        table.create(key(2), b).unwrap();
        table.create(key(1), a).unwrap();
        assert_eq!(
            table.snapshot().iter().map(|r| r.key).collect::<Vec<_>>(),
            vec![key(1), key(2)]
        );

        a_status.lock().unwrap().ended = Some(SessionEnd::Misbehaving);
        assert_eq!(table.prune(), 1);
        assert_eq!(table.snapshot().len(), 1);
        assert_eq!(table.drain().len(), 1);
        assert!(table.snapshot().is_empty());
    }
}
