//! Entry point for external lifecycle intents.
//!
//! The queue is the only writer of desired state.  Intents for one host
//! are serialised by a per-host gate and applied in arrival order; intents
//! for different hosts proceed independently.  Every accepted intent is
//! persisted, applied to the registry (bumping the generation), and then
//! handed to the reconciler for immediate attention.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::CommandError;
use crate::registry::HostRegistry;
use crate::store::{DesiredRecord, DesiredStateStore};
use crate::types::{DesiredState, Host, HostId, HostSpec, Ticket};

/// Which desired states a host may leave with a different spec.
///
/// The default only allows a new spec once the host is desired Absent,
/// i.e. a recreate goes through removal first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionPolicy {
    respec_from: HashSet<DesiredState>,
}

impl TransitionPolicy {
    pub fn new(respec_from: impl IntoIterator<Item = DesiredState>) -> Self {
        Self {
            respec_from: respec_from.into_iter().collect(),
        }
    }

    /// Spec changes are accepted from any state.
    pub fn permissive() -> Self {
        Self::new([DesiredState::Absent, DesiredState::Stopped, DesiredState::Running])
    }

    pub fn allows_respec_from(&self, current: DesiredState) -> bool {
        self.respec_from.contains(&current)
    }
}

impl Default for TransitionPolicy {
    fn default() -> Self {
        Self::new([DesiredState::Absent])
    }
}

#[derive(Debug, PartialEq)]
enum Admission {
    /// Same as the pending intent; nothing to do.
    Duplicate(u64),
    /// Apply, replacing the spec when one is given.
    Apply(Option<HostSpec>),
}

fn admit(
    id: &HostId,
    current: Option<&Host>,
    desired: DesiredState,
    spec: Option<HostSpec>,
    policy: &TransitionPolicy,
) -> Result<Admission, CommandError> {
    let Some(host) = current else {
        if desired != DesiredState::Absent && spec.is_none() {
            return Err(CommandError::MissingSpec(id.clone()));
        }
        return Ok(Admission::Apply(spec));
    };

    // Re-sending the current spec is not a change
    let spec = spec.filter(|s| host.spec_digest.as_deref() != Some(s.digest().as_str()));

    if spec.is_some() && host.spec.is_some() && !policy.allows_respec_from(host.desired) {
        return Err(CommandError::InvalidTransition {
            id: id.clone(),
            from: host.desired,
            to: desired,
        });
    }
    if desired != DesiredState::Absent && host.spec.is_none() && spec.is_none() {
        return Err(CommandError::MissingSpec(id.clone()));
    }
    if spec.is_none() && host.desired == desired && host.is_pending() {
        return Ok(Admission::Duplicate(host.generation));
    }
    Ok(Admission::Apply(spec))
}

pub struct CommandQueue {
    registry: Arc<HostRegistry>,
    store: Arc<dyn DesiredStateStore>,
    policy: TransitionPolicy,
    kick: mpsc::UnboundedSender<HostId>,
    gates: Mutex<HashMap<HostId, Arc<Mutex<()>>>>,
}

impl CommandQueue {
    pub fn new(
        registry: Arc<HostRegistry>,
        store: Arc<dyn DesiredStateStore>,
        policy: TransitionPolicy,
        kick: mpsc::UnboundedSender<HostId>,
    ) -> Self {
        Self {
            registry,
            store,
            policy,
            kick,
            gates: Mutex::new(HashMap::new()),
        }
    }

    fn gate(&self, id: &HostId) -> Arc<Mutex<()>> {
        self.gates
            .lock()
            .entry(id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn release_gate(&self, id: &HostId, gate: &Arc<Mutex<()>>) {
        let mut gates = self.gates.lock();
        // Map + caller; anyone else is already waiting on this gate
        if Arc::strong_count(gate) <= 2 {
            gates.remove(id);
        }
    }

    /// Run `f` holding the gate of `id`, then drop the gate from the map
    /// when nobody else wants it.  Whatever `f` returns, the gate is
    /// released.
    fn gated<T>(&self, id: &HostId, f: impl FnOnce() -> T) -> T {
        let gate = self.gate(id);
        let held = gate.lock();
        let out = f();
        drop(held);
        self.release_gate(id, &gate);
        out
    }

    /// Submit a lifecycle intent for `id`.
    ///
    /// Fails synchronously on policy violations or when the intent cannot
    /// be persisted; convergence itself is asynchronous and reported
    /// through the status publisher.
    pub fn enqueue(
        &self,
        id: &HostId,
        desired: DesiredState,
        spec: Option<HostSpec>,
    ) -> Result<Ticket, CommandError> {
        if let Some(spec) = &spec {
            spec.validate().map_err(|reason| CommandError::InvalidSpec {
                id: id.clone(),
                reason,
            })?;
        }

        self.gated(id, || self.apply(id, desired, spec))
    }

    fn apply(
        &self,
        id: &HostId,
        desired: DesiredState,
        spec: Option<HostSpec>,
    ) -> Result<Ticket, CommandError> {
        let current = self.registry.get(id);
        let spec = match admit(id, current.as_ref(), desired, spec, &self.policy)? {
            Admission::Duplicate(generation) => {
                debug!("Intent {} for {} already pending at generation {}", desired, id, generation);
                return Ok(Ticket {
                    host_id: id.clone(),
                    generation,
                    deduplicated: true,
                });
            }
            Admission::Apply(spec) => spec,
        };

        let record = DesiredRecord {
            id: id.clone(),
            desired,
            spec: spec.clone().or_else(|| current.and_then(|h| h.spec)),
        };
        self.store.record(&record)?;

        let (_, generation) = self.registry.upsert_desired(id, spec, desired);
        info!("Accepted intent {} for {} at generation {}", desired, id, generation);

        if self.kick.send(id.clone()).is_err() {
            warn!("Reconciler is not running; {} waits for the next start", id);
        }

        Ok(Ticket {
            host_id: id.clone(),
            generation,
            deduplicated: false,
        })
    }

    /// Administrative removal of a host record, whatever its state.
    ///
    /// The container itself is left alone; request `absent` first to have
    /// it removed.  The store is updated first: when it fails the host is
    /// kept in both places.
    pub fn purge(&self, id: &HostId) -> Result<Host, CommandError> {
        self.gated(id, || {
            if !self.registry.contains(id) {
                return Err(CommandError::NotFound(id.clone()));
            }
            self.store.forget(id)?;
            let host = self
                .registry
                .purge(id)
                .ok_or_else(|| CommandError::NotFound(id.clone()))?;
            info!("Purged host {} at generation {}", id, host.generation);
            Ok(host)
        })
    }

    /// Drop a host confirmed Absent/Absent at `generation`.
    ///
    /// Runs under the host's gate so it cannot interleave with a new
    /// intent for the same id.
    pub fn collect(&self, id: &HostId, generation: u64) -> bool {
        self.gated(id, || {
            let removed = self.registry.remove_collectable(id, generation);
            if removed {
                // A leftover record only re-hydrates an absent host
                if let Err(e) = self.store.forget(id) {
                    warn!("Failed to forget collected host {}: {}", id, e);
                }
                info!("Collected host {}", id);
            }
            removed
        })
    }
}
