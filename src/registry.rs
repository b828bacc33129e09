//! In-memory catalogue of known remote workers.
//!
//! All mutation funnels through the mutex held inside the registry; readers
//! get cloned snapshots so planning never observes a half-updated list.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::log_info;

pub const RPC_DEFAULT_PORT: u16 = 50052;

/// One remote compute contributor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub host: String,
    pub port: u16,
    pub device_name: String,
    pub available_ram_mb: u64,
    /// Layer range assigned by the last plan, for display.
    pub assigned_layers: Option<(u32, u32)>,
    pub connected: bool,
    pub enabled: bool,
    /// Reference to a persisted worker row, when one exists.
    pub saved_id: Option<i64>,
    /// User-set load proportion override (0.0-1.0). `None` = auto by RAM.
    pub proportion: Option<f32>,
}

impl WorkerDescriptor {
    pub fn new(host: impl Into<String>, port: u16, device_name: impl Into<String>, ram_mb: u64) -> Self {
        Self {
            host: host.into(),
            port,
            device_name: device_name.into(),
            available_ram_mb: ram_mb,
            assigned_layers: None,
            // Manually entered workers are assumed reachable until a session
            // reports otherwise.
            connected: true,
            enabled: true,
            saved_id: None,
            proportion: None,
        }
    }

    pub fn with_proportion(mut self, proportion: Option<f32>) -> Self {
        self.proportion = proportion.map(|p| p.clamp(0.0, 1.0));
        self
    }

    /// `host:port` identity key, also the wire address handed to the server.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Snapshot filter for [`WorkerRegistry::list`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerFilter {
    All,
    EnabledOnly,
}

/// Registry of known workers. Insertion order is preserved so the `--rpc`
/// address list and the `-ts` split stay aligned.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: Mutex<Vec<WorkerDescriptor>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a worker. Duplicate addresses are rejected (no-op, returns false).
    pub fn add(&self, mut worker: WorkerDescriptor) -> bool {
        worker.proportion = worker.proportion.map(|p| p.clamp(0.0, 1.0));
        let mut workers = self.workers.lock().expect("registry poisoned");
        if workers
            .iter()
            .any(|w| w.host == worker.host && w.port == worker.port)
        {
            return false;
        }
        log_info!(
            "Registry: added worker {} at {} with {} MB RAM, proportion={:?}",
            worker.device_name,
            worker.address(),
            worker.available_ram_mb,
            worker.proportion
        );
        workers.push(worker);
        true
    }

    pub fn remove(&self, host: &str, port: u16) -> bool {
        let mut workers = self.workers.lock().expect("registry poisoned");
        let before = workers.len();
        workers.retain(|w| !(w.host == host && w.port == port));
        before != workers.len()
    }

    pub fn clear(&self) {
        self.workers.lock().expect("registry poisoned").clear();
    }

    pub fn set_enabled(&self, host: &str, port: u16, enabled: bool) -> bool {
        self.mutate(host, port, |w| w.enabled = enabled)
    }

    /// Update name/RAM/proportion of an existing worker.
    pub fn update_worker(
        &self,
        host: &str,
        port: u16,
        device_name: &str,
        ram_mb: u64,
        proportion: Option<f32>,
    ) -> bool {
        self.mutate(host, port, |w| {
            w.device_name = device_name.to_string();
            w.available_ram_mb = ram_mb;
            w.proportion = proportion.map(|p| p.clamp(0.0, 1.0));
        })
    }

    /// Declared sync point for supervision: only the connected flag is
    /// written back from session observations.
    pub fn update_connection_state(&self, host: &str, port: u16, connected: bool) -> bool {
        self.mutate(host, port, |w| w.connected = connected)
    }

    pub fn set_assigned_layers(&self, host: &str, port: u16, range: Option<(u32, u32)>) -> bool {
        self.mutate(host, port, |w| w.assigned_layers = range)
    }

    pub fn mark_all_disconnected(&self) {
        let mut workers = self.workers.lock().expect("registry poisoned");
        for w in workers.iter_mut() {
            w.connected = false;
        }
    }

    /// Consistent snapshot of the worker list.
    pub fn list(&self, filter: WorkerFilter) -> Vec<WorkerDescriptor> {
        let workers = self.workers.lock().expect("registry poisoned");
        match filter {
            WorkerFilter::All => workers.clone(),
            WorkerFilter::EnabledOnly => workers.iter().filter(|w| w.enabled).cloned().collect(),
        }
    }

    /// Addresses of connected workers, in registry order.
    pub fn worker_addresses(&self) -> Vec<String> {
        self.workers
            .lock()
            .expect("registry poisoned")
            .iter()
            .filter(|w| w.connected)
            .map(WorkerDescriptor::address)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.lock().expect("registry poisoned").is_empty()
    }

    fn mutate(&self, host: &str, port: u16, f: impl FnOnce(&mut WorkerDescriptor)) -> bool {
        let mut workers = self.workers.lock().expect("registry poisoned");
        match workers.iter_mut().find(|w| w.host == host && w.port == port) {
            Some(w) => {
                f(w);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn worker(host: &str, ram: u64) -> WorkerDescriptor {
        WorkerDescriptor::new(host, RPC_DEFAULT_PORT, "Test", ram)
    }

    #[test]
    fn test_duplicate_address_is_rejected() {
        let registry = WorkerRegistry::new();
        assert!(registry.add(worker("10.0.0.1", 4096)));
        assert!(!registry.add(worker("10.0.0.1", 8192)));
        let snapshot = registry.list(WorkerFilter::All);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].available_ram_mb, 4096);
    }

    #[test]
    fn test_disabled_workers_stay_in_registry_but_filter_out() {
        let registry = WorkerRegistry::new();
        registry.add(worker("10.0.0.1", 4096));
        registry.add(worker("10.0.0.2", 4096));
        assert!(registry.set_enabled("10.0.0.1", RPC_DEFAULT_PORT, false));
        assert_eq!(registry.list(WorkerFilter::All).len(), 2);
        let enabled = registry.list(WorkerFilter::EnabledOnly);
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].host, "10.0.0.2");
    }

    #[test]
    fn test_connection_state_sync() {
        let registry = WorkerRegistry::new();
        registry.add(worker("10.0.0.1", 4096));
        registry.add(worker("10.0.0.2", 4096));
        assert!(registry.update_connection_state("10.0.0.2", RPC_DEFAULT_PORT, false));
        assert_eq!(registry.worker_addresses(), vec!["10.0.0.1:50052"]);
        registry.mark_all_disconnected();
        assert!(registry.worker_addresses().is_empty());
    }

    #[test]
    fn test_proportion_is_clamped() {
        let registry = WorkerRegistry::new();
        registry.add(worker("10.0.0.1", 4096).with_proportion(Some(3.5)));
        assert_eq!(registry.list(WorkerFilter::All)[0].proportion, Some(1.0));
    }

    #[test]
    fn test_remove_and_clear() {
        let registry = WorkerRegistry::new();
        registry.add(worker("10.0.0.1", 4096));
        registry.add(worker("10.0.0.2", 4096));
        assert!(registry.remove("10.0.0.1", RPC_DEFAULT_PORT));
        assert!(!registry.remove("10.0.0.1", RPC_DEFAULT_PORT));
        registry.clear();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_mutation_loses_no_updates() {
        let registry = Arc::new(WorkerRegistry::new());
        let mut handles = Vec::new();
        for i in 0..8 {
            let reg = registry.clone();
            handles.push(std::thread::spawn(move || {
                for j in 0..50 {
                    reg.add(worker(&format!("10.0.{i}.{j}"), 1024));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(registry.list(WorkerFilter::All).len(), 8 * 50);
    }
}
