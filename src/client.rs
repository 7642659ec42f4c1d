//! Client data manager.
//!
//! Central store of per-process and per-thread client state. The rate
//! limiter, pulse monitor and garbage collector are all clients of this
//! table; none of them keep client state of their own. Two maps under one
//! reader-writer lock: `by_pid` tracks the permission class and thread list
//! of each process, `by_tid` tracks the active handles, health and last
//! request timestamp of each thread.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::TuneError;
use crate::request::{Handle, RequestPriority};
use crate::resource::PermissionClass;

/// OS process/thread id as used by clients.
pub type RawPid = libc::pid_t;

/// Threads one process may register before further requests are rejected.
pub const PER_CLIENT_TID_CAP: usize = 32;

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub client_type: PermissionClass,
    pub tids: Vec<RawPid>,
}

#[derive(Debug)]
pub struct ClientTidData {
    /// Active requests of this thread, with the priority each was accepted
    /// at. The priority rides along so untunes for the handle can be queued
    /// behind the original tune rather than overtaking it.
    pub handles: HashMap<Handle, RequestPriority>,
    pub last_request_ms: i64,
    pub health: f64,
}

impl ClientTidData {
    fn new() -> Self {
        Self {
            handles: HashMap::new(),
            last_request_ms: 0,
            health: 100.0,
        }
    }
}

#[derive(Default)]
struct ClientTables {
    by_pid: HashMap<RawPid, ClientInfo>,
    by_tid: HashMap<RawPid, ClientTidData>,
}

pub struct ClientDataManager {
    tables: RwLock<ClientTables>,
}

impl ClientDataManager {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(ClientTables::default()),
        }
    }

    pub fn client_exists(&self, pid: RawPid, tid: RawPid) -> bool {
        let tables = self.tables.read().unwrap();
        tables
            .by_pid
            .get(&pid)
            .is_some_and(|info| info.tids.contains(&tid))
            && tables.by_tid.contains_key(&tid)
    }

    /// Registers a (pid, tid) pair. The permission class sticks to the
    /// process on first contact; later threads inherit it.
    pub fn create_client(
        &self,
        pid: RawPid,
        tid: RawPid,
        client_type: PermissionClass,
    ) -> Result<(), TuneError> {
        let mut tables = self.tables.write().unwrap();
        let info = tables.by_pid.entry(pid).or_insert_with(|| ClientInfo {
            client_type,
            tids: Vec::new(),
        });
        if !info.tids.contains(&tid) {
            if info.tids.len() >= PER_CLIENT_TID_CAP {
                return Err(TuneError::TooManyThreads);
            }
            info.tids.push(tid);
        }
        tables.by_tid.entry(tid).or_insert_with(ClientTidData::new);
        Ok(())
    }

    pub fn insert_handle(&self, tid: RawPid, handle: Handle, priority: RequestPriority) {
        let mut tables = self.tables.write().unwrap();
        if let Some(data) = tables.by_tid.get_mut(&tid) {
            data.handles.insert(handle, priority);
        }
    }

    pub fn delete_handle(&self, tid: RawPid, handle: Handle) {
        let mut tables = self.tables.write().unwrap();
        if let Some(data) = tables.by_tid.get_mut(&tid) {
            data.handles.remove(&handle);
        }
    }

    pub fn requests_of(&self, tid: RawPid) -> Vec<Handle> {
        let tables = self.tables.read().unwrap();
        tables
            .by_tid
            .get(&tid)
            .map(|data| data.handles.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Active handles of a thread together with their accepted priorities.
    pub fn handles_with_priority(&self, tid: RawPid) -> Vec<(Handle, RequestPriority)> {
        let tables = self.tables.read().unwrap();
        tables
            .by_tid
            .get(&tid)
            .map(|data| data.handles.iter().map(|(&h, &p)| (h, p)).collect())
            .unwrap_or_default()
    }

    /// Priority a handle was accepted at, if the thread owns it.
    pub fn priority_of_handle(&self, tid: RawPid, handle: Handle) -> Option<RequestPriority> {
        let tables = self.tables.read().unwrap();
        tables
            .by_tid
            .get(&tid)
            .and_then(|data| data.handles.get(&handle).copied())
    }

    pub fn health_of(&self, tid: RawPid) -> Option<f64> {
        self.tables.read().unwrap().by_tid.get(&tid).map(|d| d.health)
    }

    pub fn last_request_ms(&self, tid: RawPid) -> Option<i64> {
        let tables = self.tables.read().unwrap();
        tables.by_tid.get(&tid).map(|d| d.last_request_ms)
    }

    /// Read-modify-write access to one thread's rate-limiting fields under
    /// the writer lock, so reward/penalty arithmetic cannot interleave.
    pub fn with_tid_mut<R>(
        &self,
        tid: RawPid,
        f: impl FnOnce(&mut ClientTidData) -> R,
    ) -> Option<R> {
        let mut tables = self.tables.write().unwrap();
        tables.by_tid.get_mut(&tid).map(f)
    }

    pub fn permission_of(&self, pid: RawPid) -> Option<PermissionClass> {
        let tables = self.tables.read().unwrap();
        tables.by_pid.get(&pid).map(|info| info.client_type)
    }

    pub fn threads_of(&self, pid: RawPid) -> Vec<RawPid> {
        let tables = self.tables.read().unwrap();
        tables
            .by_pid
            .get(&pid)
            .map(|info| info.tids.clone())
            .unwrap_or_default()
    }

    pub fn active_pids(&self) -> Vec<RawPid> {
        self.tables.read().unwrap().by_pid.keys().copied().collect()
    }

    pub fn delete_pid(&self, pid: RawPid) {
        self.tables.write().unwrap().by_pid.remove(&pid);
    }

    pub fn delete_tid(&self, tid: RawPid) {
        self.tables.write().unwrap().by_tid.remove(&tid);
    }

    pub fn tracked_pid_count(&self) -> usize {
        self.tables.read().unwrap().by_pid.len()
    }
}

impl Default for ClientDataManager {
    fn default() -> Self {
        Self::new()
    }
}
