use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{OwnedMutexGuard, mpsc};
use tokio::task::JoinHandle;
use tracing::warn;

use shellmux_protocol::{SessionId, SessionKind};

use crate::session::SessionCommand;

pub(crate) struct SessionEntry {
    pub kind: SessionKind,
    pub instance: u64,
    pub commands: mpsc::UnboundedSender<SessionCommand>,
    pub task: JoinHandle<()>,
}

/// Maps session identifiers to their running tasks. Owned by the composing
/// application and handed to the router; there is no global instance.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    next_instance: AtomicU64,
    /// Per-identifier create/replace locks. Entries exist only while held or
    /// awaited.
    claims: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
}

/// Exclusive claim on one identifier. Dropping it releases the identifier.
pub(crate) struct IdentifierClaim {
    registry: Arc<SessionRegistry>,
    session_id: SessionId,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for IdentifierClaim {
    fn drop(&mut self) {
        self.guard.take();
        let mut claims = self.registry.claims();
        // Only this claim and the map still hold the lock.
        if claims
            .get(&self.session_id)
            .is_some_and(|lock| Arc::ptr_eq(lock, &self.lock))
            && Arc::strong_count(&self.lock) == 2
        {
            claims.remove(&self.session_id);
        }
    }
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.lock().contains_key(session_id)
    }

    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn kind(&self, session_id: &str) -> Option<SessionKind> {
        self.lock().get(session_id).map(|entry| entry.kind)
    }

    /// Wait until no other create or replace is in progress for
    /// `session_id`. Other identifiers are unaffected.
    pub(crate) async fn claim(self: &Arc<Self>, session_id: &str) -> IdentifierClaim {
        let lock = Arc::clone(self.claims().entry(session_id.to_string()).or_default());
        let guard = Arc::clone(&lock).lock_owned().await;
        IdentifierClaim {
            registry: Arc::clone(self),
            session_id: session_id.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    /// Spawn `run` as the task for `session_id`. The entry removes itself
    /// when the task returns, unless it has been replaced in the meantime.
    pub(crate) fn install<F>(
        self: &Arc<Self>,
        session_id: SessionId,
        kind: SessionKind,
        commands: mpsc::UnboundedSender<SessionCommand>,
        run: F,
    ) where
        F: Future<Output = ()> + Send + 'static,
    {
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let registry = Arc::downgrade(self);
        let task_session_id = session_id.clone();

        // Spawned under the lock so the task cannot remove its entry before
        // it is inserted.
        let mut sessions = self.lock();
        let task = tokio::spawn(async move {
            run.await;
            if let Some(registry) = registry.upgrade() {
                registry.remove_instance(&task_session_id, instance);
            }
        });
        let previous = sessions.insert(
            session_id.clone(),
            SessionEntry {
                kind,
                instance,
                commands,
                task,
            },
        );
        if previous.is_some() {
            warn!(session_id = %session_id, "installed over a live session entry");
        }
    }

    pub(crate) fn take(&self, session_id: &str) -> Option<SessionEntry> {
        self.lock().remove(session_id)
    }

    pub(crate) fn take_all(&self) -> Vec<(SessionId, SessionEntry)> {
        self.lock().drain().collect()
    }

    pub(crate) fn sender(&self, session_id: &str) -> Option<mpsc::UnboundedSender<SessionCommand>> {
        self.lock()
            .get(session_id)
            .map(|entry| entry.commands.clone())
    }

    pub(crate) fn senders(&self) -> Vec<mpsc::UnboundedSender<SessionCommand>> {
        self.lock()
            .values()
            .map(|entry| entry.commands.clone())
            .collect()
    }

    fn remove_instance(&self, session_id: &str, instance: u64) {
        let mut sessions = self.lock();
        if sessions
            .get(session_id)
            .is_some_and(|entry| entry.instance == instance)
        {
            sessions.remove(session_id);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SessionId, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn claims(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>> {
        self.claims.lock().unwrap_or_else(|e| e.into_inner())
    }
}
