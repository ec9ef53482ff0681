use std::cmp::Ordering;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use medialb_common::protocol::{MedialbError, Message, Result};

use crate::backend::BackendServer;

/// Backends chosen for a new session.
pub struct Selection<M> {
    pub primary: Arc<BackendServer<M>>,
    pub backups: Vec<Arc<BackendServer<M>>>,
}

impl<M> Clone for Selection<M> {
    fn clone(&self) -> Self {
        Self {
            primary: self.primary.clone(),
            backups: self.backups.clone(),
        }
    }
}

struct BackendEntry<M> {
    server: Arc<BackendServer<M>>,
    sessions: HashSet<String>,
    backup_sessions: usize,
}

impl<M> BackendEntry<M> {
    fn load(&self, backup_weight: f64) -> f64 {
        self.sessions.len() as f64 + self.backup_sessions as f64 * backup_weight
    }
}

/// Load-aware backend pool.
///
/// The load of a backend is its primary session count plus
/// `backup_weight` per session it backs up. It is derived from the two
/// counters, so every update that moves a session keeps it exact.
pub struct LoadBalancer<M> {
    backends: Vec<BackendEntry<M>>,
    backup_servers: usize,
    backup_weight: f64,
}

impl<M: Message> LoadBalancer<M> {
    pub fn new(backup_servers: usize, backup_weight: f64) -> Self {
        Self {
            backends: Vec::new(),
            backup_servers,
            backup_weight,
        }
    }

    /// Adds a backend to the pool; returns `false` if its address is taken
    pub fn add_backend(&mut self, server: Arc<BackendServer<M>>) -> bool {
        if self.contains(server.addr()) {
            return false;
        }
        self.backends.push(BackendEntry {
            server,
            sessions: HashSet::new(),
            backup_sessions: 0,
        });
        true
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.entry(addr).is_some()
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    pub fn backends(&self) -> Vec<Arc<BackendServer<M>>> {
        self.backends.iter().map(|e| e.server.clone()).collect()
    }

    pub fn backend(&self, addr: SocketAddr) -> Option<Arc<BackendServer<M>>> {
        self.entry(addr).map(|e| e.server.clone())
    }

    pub fn backup_weight(&self) -> f64 {
        self.backup_weight
    }

    pub fn load(&self, addr: SocketAddr) -> Option<f64> {
        self.entry(addr).map(|e| e.load(self.backup_weight))
    }

    /// Keys of the sessions whose primary is `addr`
    pub fn sessions_on(&self, addr: SocketAddr) -> Vec<String> {
        self.entry(addr)
            .map(|e| e.sessions.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn backup_sessions(&self, addr: SocketAddr) -> Option<usize> {
        self.entry(addr).map(|e| e.backup_sessions)
    }

    fn entry(&self, addr: SocketAddr) -> Option<&BackendEntry<M>> {
        self.backends.iter().find(|e| e.server.addr() == addr)
    }

    fn entry_mut(&mut self, addr: SocketAddr) -> Option<&mut BackendEntry<M>> {
        self.backends.iter_mut().find(|e| e.server.addr() == addr)
    }

    /// Picks the least loaded online backend as primary and the next
    /// `backup_servers` online ones as backups. Offline backends are skipped.
    pub fn pick_server(&mut self) -> Result<Selection<M>> {
        let weight = self.backup_weight;
        self.backends.sort_by(|a, b| {
            a.load(weight)
                .partial_cmp(&b.load(weight))
                .unwrap_or(Ordering::Equal)
        });

        let mut online = self
            .backends
            .iter()
            .filter(|e| e.server.online())
            .map(|e| e.server.clone());

        let primary = online.next().ok_or(MedialbError::NoServerAvailable)?;
        let backups = online.take(self.backup_servers).collect();

        Ok(Selection { primary, backups })
    }

    /// Accounts a new session on the backends of `selection`.
    pub fn register_session(&mut self, key: &str, selection: &Selection<M>) {
        if let Some(entry) = self.entry_mut(selection.primary.addr()) {
            entry.sessions.insert(key.to_string());
        }
        for backup in &selection.backups {
            if let Some(entry) = self.entry_mut(backup.addr()) {
                entry.backup_sessions += 1;
            }
        }
    }

    /// Reverses [`LoadBalancer::register_session`].
    pub fn unregister_session(&mut self, key: &str, primary: SocketAddr, backups: &[SocketAddr]) {
        if let Some(entry) = self.entry_mut(primary) {
            entry.sessions.remove(key);
        }
        for backup in backups {
            if let Some(entry) = self.entry_mut(*backup) {
                entry.backup_sessions = entry.backup_sessions.saturating_sub(1);
            }
        }
    }

    /// Moves session `key` from `failed` to `new`.
    ///
    /// When `new` backed the session up, its reservation turns into the
    /// primary slot: its load grows by `1 - backup_weight`.
    pub fn complete_failover(
        &mut self,
        key: &str,
        failed: SocketAddr,
        new: SocketAddr,
        was_backup: bool,
    ) {
        if let Some(entry) = self.entry_mut(failed) {
            entry.sessions.remove(key);
        }
        if let Some(entry) = self.entry_mut(new) {
            entry.sessions.insert(key.to_string());
            if was_backup {
                entry.backup_sessions = entry.backup_sessions.saturating_sub(1);
            }
        }
    }
}
