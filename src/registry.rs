//! In-memory authoritative map of managed hosts.
//!
//! Each host sits behind its own lock so unrelated hosts never contend;
//! the outer map lock is only held to find or insert an entry.  Neither
//! lock is ever held across an engine call: the reconciler fences its
//! writes with the generation it read instead.
//!
//! Generations never go backwards for an id, even across removal: the
//! last generation of a removed host is remembered and a host recreated
//! under the same id continues from it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::types::{DesiredState, EngineHandle, Host, HostError, HostId, HostSpec, ObservedState};

/// Result of a reconciler observation, applied atomically to one host.
#[derive(Debug, Clone)]
pub struct Observation {
    pub state: ObservedState,
    pub error: Option<HostError>,
}

impl Observation {
    pub fn ok(state: ObservedState) -> Self {
        Self { state, error: None }
    }

    pub fn failed(state: ObservedState, error: HostError) -> Self {
        Self {
            state,
            error: Some(error),
        }
    }
}

#[derive(Default)]
pub struct HostRegistry {
    hosts: RwLock<HashMap<HostId, Arc<Mutex<Host>>>>,
    /// Last generation of each removed host.  Only touched while the
    /// `hosts` write lock is held.
    retired: Mutex<HashMap<HostId, u64>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, id: &HostId) -> Option<Arc<Mutex<Host>>> {
        self.hosts.read().get(id).cloned()
    }

    /// Detached copy of one host.
    pub fn get(&self, id: &HostId) -> Option<Host> {
        self.entry(id).map(|h| h.lock().clone())
    }

    pub fn contains(&self, id: &HostId) -> bool {
        self.hosts.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.hosts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.read().is_empty()
    }

    pub fn ids(&self) -> Vec<HostId> {
        let mut ids: Vec<_> = self.hosts.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Set the desired state (and optionally replace the spec), bumping
    /// the generation.  Creates the host when the id is unknown.
    ///
    /// Policy checks belong to the command queue; this only applies.
    pub fn upsert_desired(
        &self,
        id: &HostId,
        spec: Option<HostSpec>,
        desired: DesiredState,
    ) -> (Host, u64) {
        let entry = match self.entry(id) {
            Some(entry) => entry,
            None => {
                let mut hosts = self.hosts.write();
                hosts
                    .entry(id.clone())
                    .or_insert_with(|| {
                        let mut host = Host::new(id.clone(), desired, None);
                        host.generation = self.retired.lock().remove(id).unwrap_or(0);
                        Arc::new(Mutex::new(host))
                    })
                    .clone()
            }
        };

        let mut host = entry.lock();
        host.desired = desired;
        if let Some(spec) = spec {
            host.spec_digest = Some(spec.digest());
            host.spec = Some(spec);
        }
        host.generation += 1;
        debug!("Host {} desired {} at generation {}", id, desired, host.generation);
        (host.clone(), host.generation)
    }

    /// Apply an observation taken at `generation`.
    ///
    /// Returns `false` and leaves the host untouched when the host is gone
    /// or the generation is older than the current one.
    pub fn update_observed(&self, id: &HostId, generation: u64, observation: Observation) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        let mut host = entry.lock();
        if generation < host.generation {
            debug!(
                "Discarding stale observation for {} (generation {} < {})",
                id, generation, host.generation
            );
            return false;
        }
        host.observed = observation.state;
        host.last_error = observation.error;
        host.observed_generation = generation;
        host.observed_at = Some(Utc::now());
        true
    }

    /// Consistent, ordered copy of every host.
    pub fn snapshot(&self) -> Vec<Host> {
        let hosts = self.hosts.read();
        let mut out: Vec<Host> = hosts.values().map(|h| h.lock().clone()).collect();
        drop(hosts);
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Drop a host that is confirmed Absent/Absent at `generation`.
    pub fn remove_collectable(&self, id: &HostId, generation: u64) -> bool {
        let mut hosts = self.hosts.write();
        let collectable = match hosts.get(id) {
            Some(entry) => {
                let host = entry.lock();
                host.generation == generation
                    && host.desired == DesiredState::Absent
                    && host.observed == ObservedState::Absent
            }
            None => false,
        };
        if collectable {
            if let Some(entry) = hosts.remove(id) {
                self.retire(&entry.lock());
            }
        }
        collectable
    }

    /// Administrative removal regardless of state.
    pub fn purge(&self, id: &HostId) -> Option<Host> {
        let mut hosts = self.hosts.write();
        let host = hosts.remove(id)?.lock().clone();
        self.retire(&host);
        Some(host)
    }

    fn retire(&self, host: &Host) {
        self.retired.lock().insert(host.id.clone(), host.generation);
    }

    /// Load a persisted intent at startup.  Observed state starts Unknown
    /// so the reconciler inspects before acting.
    pub fn hydrate(&self, id: HostId, desired: DesiredState, spec: Option<HostSpec>) {
        let mut host = Host::new(id.clone(), desired, spec);
        let mut hosts = self.hosts.write();
        host.generation = self.retired.lock().remove(&id).unwrap_or(0) + 1;
        hosts.insert(id, Arc::new(Mutex::new(host)));
    }
}

/// Name of the engine container backing a host.
pub fn container_name(prefix: &str, id: &HostId) -> String {
    format!("{}{}", prefix, id)
}

/// Handle for a host's container when none has been observed yet.
pub fn handle_for(prefix: &str, id: &HostId) -> EngineHandle {
    EngineHandle::named(container_name(prefix, id))
}
