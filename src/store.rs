//! Durable session registry shared by the hook processes and the daemon.
//!
//! The registry is a JSON object keyed by session id. Every access that may
//! write goes through [`SessionStore::lock`], which takes an exclusive flock on
//! a sidecar `<registry>.lock` file, reloads the registry from disk, and
//! replaces the file atomically on commit. The sidecar keeps the lock on a
//! stable inode while the registry itself is swapped by rename.

use std::{
    collections::{BTreeMap, HashMap},
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use crate::{
    error::StoreError,
    types::{Session, SessionStatus, ThreadId},
};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// In-memory view of the registry with a secondary index on thread id.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    sessions: BTreeMap<String, Session>,
    by_thread: HashMap<ThreadId, String>,
}

impl PartialEq for Registry {
    fn eq(&self, other: &Self) -> bool {
        self.sessions == other.sessions
    }
}

impl Registry {
    fn from_map(raw: BTreeMap<String, Session>) -> Self {
        let mut sessions = BTreeMap::new();
        for (key, mut session) in raw {
            if session.session_id != key {
                tracing::warn!(
                    target = "pane_relay::store",
                    key = %key,
                    session_id = %session.session_id,
                    "registry key does not match record; using key"
                );
                session.session_id = key.clone();
            }
            sessions.insert(key, session);
        }
        let mut registry = Self {
            sessions,
            by_thread: HashMap::new(),
        };
        registry.reindex();
        registry
    }

    fn reindex(&mut self) {
        self.by_thread.clear();
        for (id, session) in &self.sessions {
            if session.is_closed() {
                continue;
            }
            if let Some(existing) = self.by_thread.insert(session.thread_id, id.clone()) {
                tracing::warn!(
                    target = "pane_relay::store",
                    thread_id = session.thread_id,
                    first = %existing,
                    second = %id,
                    "two live sessions share a thread; keeping the first"
                );
                self.by_thread.insert(session.thread_id, existing);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn find_by_session_id(&self, session_id: &str) -> Option<&Session> {
        self.sessions.get(session_id)
    }

    /// Live sessions win; a closed session is returned only when no live one
    /// is bound to the thread.
    pub fn find_by_thread_id(&self, thread_id: ThreadId) -> Option<&Session> {
        if let Some(id) = self.by_thread.get(&thread_id) {
            return self.sessions.get(id);
        }
        self.sessions.values().find(|s| s.thread_id == thread_id)
    }

    /// Insert or replace a session. Fails if another live session already owns
    /// the thread.
    pub fn insert(&mut self, session: Session) -> Result<(), StoreError> {
        if !session.is_closed() {
            if let Some(existing) = self.by_thread.get(&session.thread_id) {
                if existing != &session.session_id {
                    return Err(StoreError::DuplicateThread {
                        thread_id: session.thread_id,
                        existing: existing.clone(),
                    });
                }
            }
        }
        self.sessions.insert(session.session_id.clone(), session);
        self.reindex();
        Ok(())
    }

    pub fn remove(&mut self, session_id: &str) -> Option<Session> {
        let removed = self.sessions.remove(session_id);
        if removed.is_some() {
            self.reindex();
        }
        removed
    }

    /// Apply `f` to one session. Returns the updated session.
    pub fn update<F>(&mut self, session_id: &str, f: F) -> Option<&Session>
    where
        F: FnOnce(&mut Session),
    {
        f(self.sessions.get_mut(session_id)?);
        self.reindex();
        self.sessions.get(session_id)
    }

    /// Set `status` and bump `last_activity_at`. Returns the updated session.
    pub fn touch(&mut self, session_id: &str, status: SessionStatus) -> Option<&Session> {
        let session = self.sessions.get_mut(session_id)?;
        session.touch(status);
        if status == SessionStatus::Closed {
            self.reindex();
        }
        self.sessions.get(session_id)
    }
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        let path = path.into();
        let mut lock_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "sessions.json".into());
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        Self {
            path,
            lock_path,
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Read the registry without locking. A missing or empty file is an empty
    /// registry; an unparsable one is an error.
    pub fn load(&self) -> Result<Registry, StoreError> {
        read_registry(&self.path)
    }

    /// Take the exclusive registry lock and load the current on-disk state.
    ///
    /// Blocks for at most the configured lock timeout.
    pub fn lock(&self) -> Result<RegistryGuard, StoreError> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
            }
        }
        let lock_file = acquire_lock(&self.lock_path, self.lock_timeout)?;
        let registry = read_registry(&self.path)?;
        Ok(RegistryGuard {
            path: self.path.clone(),
            snapshot: registry.clone(),
            registry,
            _lock: lock_file,
        })
    }

    /// Run `f` inside one critical section. The registry is persisted only if
    /// `f` succeeds and actually changed it.
    pub fn with_lock<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&mut Registry) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut guard = self.lock()?;
        let value = f(guard.registry_mut())?;
        guard.commit()?;
        Ok(value)
    }
}

/// Exclusive access to a freshly loaded registry. Dropping the guard without
/// calling [`RegistryGuard::commit`] discards changes; the lock is released
/// on every path.
#[derive(Debug)]
pub struct RegistryGuard {
    path: PathBuf,
    snapshot: Registry,
    registry: Registry,
    _lock: File,
}

impl RegistryGuard {
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Persist the registry if it differs from what was loaded. Returns
    /// whether the file was rewritten.
    pub fn commit(self) -> Result<bool, StoreError> {
        if self.registry == self.snapshot {
            return Ok(false);
        }
        write_registry(&self.path, &self.registry)?;
        Ok(true)
    }
}

fn read_registry(path: &Path) -> Result<Registry, StoreError> {
    let body = match std::fs::read_to_string(path) {
        Ok(body) => body,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Registry::default())
        }
        Err(error) => return Err(StoreError::io(path, error)),
    };
    if body.trim().is_empty() {
        return Ok(Registry::default());
    }
    let raw: BTreeMap<String, Session> =
        serde_json::from_str(&body).map_err(|source| StoreError::Corrupt {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(Registry::from_map(raw))
}

fn write_registry(path: &Path, registry: &Registry) -> Result<(), StoreError> {
    let mut body = serde_json::to_vec_pretty(&registry.sessions).map_err(StoreError::Serialize)?;
    body.push(b'\n');
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    tmp.write_all(&body).map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| StoreError::io(tmp.path(), e))?;
    tmp.persist(path)
        .map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

#[cfg(unix)]
fn acquire_lock(lock_path: &Path, timeout: Duration) -> Result<File, StoreError> {
    use std::os::unix::io::AsRawFd;

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(lock_path)
        .map_err(|e| StoreError::io(lock_path, e))?;
    let fd = file.as_raw_fd();
    let started = Instant::now();

    loop {
        let rc = unsafe { nix::libc::flock(fd, nix::libc::LOCK_EX | nix::libc::LOCK_NB) };
        if rc == 0 {
            return Ok(file);
        }
        let error = std::io::Error::last_os_error();
        match error.raw_os_error() {
            Some(code) if code == nix::libc::EWOULDBLOCK || code == nix::libc::EINTR => {}
            _ => return Err(StoreError::io(lock_path, error)),
        }
        let waited = started.elapsed();
        if waited >= timeout {
            return Err(StoreError::LockTimeout {
                path: lock_path.to_path_buf(),
                waited,
            });
        }
        std::thread::sleep(LOCK_POLL_INTERVAL);
    }
}

#[cfg(not(unix))]
fn acquire_lock(lock_path: &Path, _timeout: Duration) -> Result<File, StoreError> {
    // Advisory locking is unix-only; other platforms get the atomic rename alone.
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(lock_path)
        .map_err(|e| StoreError::io(lock_path, e))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{Registry, SessionStore};
    use crate::{
        error::StoreError,
        types::{Session, SessionStatus},
    };

    fn store_in(dir: &tempfile::TempDir) -> SessionStore {
        SessionStore::new(dir.path().join("sessions.json"), Duration::from_millis(200))
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn empty_object_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "{}\n").unwrap();
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn lock_file_is_a_sidecar() {
        let store = SessionStore::new("/tmp/x/sessions.json", Duration::from_secs(1));
        assert_eq!(
            store.lock_path(),
            std::path::Path::new("/tmp/x/sessions.json.lock")
        );
    }

    #[test]
    fn corrupt_registry_fails_and_is_left_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), "{not json").unwrap();

        let result: Result<(), StoreError> = store.with_lock(|registry| {
            registry.insert(Session::new("s1", 1, "%1", None))?;
            Ok(())
        });
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), "{not json");
    }

    #[test]
    fn with_lock_persists_changes() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .with_lock(|registry| registry.insert(Session::new("s1", 10, "%1", None)))
            .unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.find_by_thread_id(10).unwrap().session_id, "s1");
        assert_eq!(loaded.find_by_session_id("s1").unwrap().pane_address, "%1");
    }

    #[test]
    fn failed_closure_does_not_persist() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let result: Result<(), StoreError> = store.with_lock(|registry| {
            registry.insert(Session::new("s1", 10, "%1", None))?;
            Err(StoreError::LockTimeout {
                path: "x".into(),
                waited: Duration::ZERO,
            })
        });
        assert!(result.is_err());
        assert!(!store.path().exists());
    }

    #[test]
    fn unchanged_registry_is_not_rewritten() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let guard = store.lock().unwrap();
        assert!(!guard.commit().unwrap());
        assert!(!store.path().exists());
    }

    #[test]
    fn second_locker_times_out_while_first_holds() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let held = store.lock().unwrap();
        let err = store.lock().unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout { .. }));
        drop(held);
        assert!(store.lock().is_ok());
    }

    #[test]
    fn duplicate_live_thread_is_rejected() {
        let mut registry = Registry::default();
        registry.insert(Session::new("a", 5, "%1", None)).unwrap();
        let err = registry
            .insert(Session::new("b", 5, "%2", None))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateThread { thread_id: 5, .. }));
    }

    #[test]
    fn closed_session_releases_its_thread() {
        let mut registry = Registry::default();
        registry.insert(Session::new("a", 5, "%1", None)).unwrap();
        registry.touch("a", SessionStatus::Closed);
        registry.insert(Session::new("b", 5, "%2", None)).unwrap();
        assert_eq!(registry.find_by_thread_id(5).unwrap().session_id, "b");
    }

    #[test]
    fn touch_updates_status_and_activity() {
        let mut registry = Registry::default();
        registry.insert(Session::new("a", 5, "%1", None)).unwrap();
        let before = registry.find_by_session_id("a").unwrap().last_activity_at;
        let updated = registry.touch("a", SessionStatus::Idle).unwrap();
        assert_eq!(updated.status, SessionStatus::Idle);
        assert!(updated.last_activity_at >= before);
        assert!(registry.touch("missing", SessionStatus::Idle).is_none());
    }

    #[test]
    fn update_changes_one_session_and_is_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store
            .with_lock(|registry| {
                registry.insert(Session::new("a", 5, "%1", None))?;
                registry.insert(Session::new("b", 6, "%2", None))
            })
            .unwrap();

        store
            .with_lock(|registry| {
                assert!(registry.update("a", |s| s.busy = true).unwrap().busy);
                assert!(registry.update("missing", |s| s.busy = true).is_none());
                Ok::<_, StoreError>(())
            })
            .unwrap();

        let loaded = store.load().unwrap();
        assert!(loaded.find_by_session_id("a").unwrap().busy);
        assert!(!loaded.find_by_session_id("b").unwrap().busy);
    }
}
