//! Control loop driving observed state toward desired state.
//!
//! The engine offers no reliable event stream, so hosts are polled: every
//! tick each idle host whose backoff has elapsed gets a job, and every
//! accepted intent gets one immediately.  A job inspects the container,
//! plans the corrective steps for the (desired, observed) pair, runs them,
//! and commits the confirmed result tagged with the generation it started
//! from.  A commit that loses to a newer intent is dropped by the registry
//! and the job simply starts over on the new generation.
//!
//! Jobs run on a shared bounded pool; a host is never handled by two jobs
//! at once.  An intent arriving for a busy host is remembered and replayed
//! when the running job finishes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinError;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::EngineError;
use crate::queue::CommandQueue;
use crate::registry::{handle_for, HostRegistry, Observation};
use crate::runtime::{ContainerEngine, CreateRequest, Inspection};
use crate::types::{DesiredState, EngineHandle, Host, HostError, HostId, ObservedState};

/// Exponential retry delay: `base`, `2*base`, `4*base`, ... up to `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap: cap.max(base),
        }
    }

    /// Delay after `failures` consecutive failures.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub interval: Duration,
    pub workers: usize,
    pub stop_grace: Duration,
    pub backoff: Backoff,
    /// How long a host stays Absent/Absent before its record is dropped.
    pub gc_grace: Duration,
    /// Corrective steps one job may take before yielding to the next tick.
    pub max_steps: usize,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            workers: 4,
            stop_grace: Duration::from_secs(10),
            backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(60)),
            gc_grace: Duration::from_secs(30),
            max_steps: 8,
        }
    }
}

/// One engine action within a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    EnsureImage,
    Create,
    Start,
    Stop,
    Remove,
}

/// Steps to run and the state they should leave the container in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub steps: Vec<Step>,
    pub expect: ObservedState,
}

impl Plan {
    fn new(steps: &[Step], expect: ObservedState) -> Self {
        Self {
            steps: steps.to_vec(),
            expect,
        }
    }
}

/// Corrective plan for a host, or `None` when it is converged.
///
/// A container built from a different spec than the host's is torn down
/// first; the following step recreates it.
pub fn plan(desired: DesiredState, current: &Inspection, spec_digest: Option<&str>) -> Option<Plan> {
    use ObservedState as O;
    use Step::*;

    let exists = matches!(current.state, O::Running | O::Stopped);
    if exists && desired != DesiredState::Absent {
        if let Some(want) = spec_digest {
            if current.spec_digest.as_deref() != Some(want) {
                return Some(match current.state {
                    O::Running => Plan::new(&[Stop, Remove], O::Absent),
                    _ => Plan::new(&[Remove], O::Absent),
                });
            }
        }
    }

    match (desired, current.state) {
        (DesiredState::Running, O::Absent) => Some(Plan::new(&[EnsureImage, Create, Start], O::Running)),
        (DesiredState::Running, O::Stopped) => Some(Plan::new(&[Start], O::Running)),
        (DesiredState::Stopped, O::Running) => Some(Plan::new(&[Stop], O::Stopped)),
        (DesiredState::Stopped, O::Absent) => Some(Plan::new(&[EnsureImage, Create], O::Stopped)),
        (DesiredState::Absent, O::Running) => Some(Plan::new(&[Stop, Remove], O::Absent)),
        (DesiredState::Absent, O::Stopped) => Some(Plan::new(&[Remove], O::Absent)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// Periodic pass; honours backoff.
    Tick,
    /// New intent; runs as soon as the host is idle.
    Intent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Converged,
    Failed,
    /// Step budget spent without settling.
    Unsettled,
    /// Host no longer in the registry.
    Gone,
}

struct RetryState {
    failures: u32,
    not_before: Instant,
}

#[derive(Default)]
struct Scheduling {
    in_flight: HashSet<HostId>,
    rerun: HashSet<HostId>,
    retry: HashMap<HostId, RetryState>,
    /// Absent/Absent hosts with the time and generation they got there.
    absent_since: HashMap<HostId, (Instant, u64)>,
}

pub struct Reconciler {
    registry: Arc<HostRegistry>,
    queue: Arc<CommandQueue>,
    engine: Arc<dyn ContainerEngine>,
    settings: ReconcilerSettings,
    prefix: String,
    workers: Arc<Semaphore>,
    sched: Mutex<Scheduling>,
}

impl Reconciler {
    pub fn new(
        registry: Arc<HostRegistry>,
        queue: Arc<CommandQueue>,
        engine: Arc<dyn ContainerEngine>,
        settings: ReconcilerSettings,
        prefix: impl Into<String>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(settings.workers.max(1)));
        Self {
            registry,
            queue,
            engine,
            settings,
            prefix: prefix.into(),
            workers,
            sched: Mutex::new(Scheduling::default()),
        }
    }

    /// Run until the intent channel closes.
    pub async fn run(self: Arc<Self>, mut intents: mpsc::UnboundedReceiver<HostId>) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Reconciler started: interval {:?}, {} workers",
            self.settings.interval, self.settings.workers
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick(),
                intent = intents.recv() => match intent {
                    Some(id) => self.dispatch(id, Trigger::Intent),
                    None => {
                        info!("Intent channel closed, reconciler stopping");
                        break;
                    }
                },
            }
        }
    }

    fn tick(self: &Arc<Self>) {
        self.collect_garbage();
        let ids = self.registry.ids();
        self.forget_departed(&ids);
        for id in ids {
            self.dispatch(id, Trigger::Tick);
        }
    }

    /// Drop scheduling state of hosts that left the registry, e.g. by purge.
    fn forget_departed(&self, live: &[HostId]) {
        let live: HashSet<&HostId> = live.iter().collect();
        let mut sched = self.sched.lock();
        let Scheduling {
            in_flight,
            retry,
            absent_since,
            ..
        } = &mut *sched;
        retry.retain(|id, _| live.contains(id) || in_flight.contains(id));
        absent_since.retain(|id, _| live.contains(id) || in_flight.contains(id));
    }

    fn dispatch(self: &Arc<Self>, id: HostId, trigger: Trigger) {
        {
            let mut sched = self.sched.lock();
            if sched.in_flight.contains(&id) {
                if trigger == Trigger::Intent {
                    debug!("Host {} busy, deferring intent", id);
                    sched.rerun.insert(id);
                }
                return;
            }
            if trigger == Trigger::Tick {
                if let Some(retry) = sched.retry.get(&id) {
                    if Instant::now() < retry.not_before {
                        return;
                    }
                }
            }
            sched.in_flight.insert(id.clone());
        }

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let permit = match Arc::clone(&this.workers).acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    this.sched.lock().in_flight.remove(&id);
                    return;
                }
            };
            // The job runs as its own task so a panic inside it still
            // clears the single-flight marker below.
            let job = {
                let this = Arc::clone(&this);
                let id = id.clone();
                tokio::spawn(async move { this.reconcile(&id).await })
            };
            let outcome = match job.await {
                Ok(outcome) => outcome,
                Err(e) => this.aborted(&id, e),
            };
            drop(permit);
            this.finish(id, outcome);
        });
    }

    /// Turn a job that died without an outcome into a recorded failure.
    fn aborted(&self, id: &HostId, e: JoinError) -> Outcome {
        error!("Reconcile job for {} died: {}", id, e);
        let Some(host) = self.registry.get(id) else {
            return Outcome::Gone;
        };
        let e = EngineError::failed(format!("reconcile job died: {}", e));
        self.fail(&host, host.generation, &e);
        Outcome::Failed
    }

    fn finish(self: &Arc<Self>, id: HostId, outcome: Outcome) {
        let rerun = {
            let mut sched = self.sched.lock();
            sched.in_flight.remove(&id);
            match outcome {
                Outcome::Failed => {
                    let failures = sched.retry.get(&id).map_or(0, |r| r.failures) + 1;
                    let delay = self.settings.backoff.delay(failures);
                    debug!("Host {} failed {} times, next attempt in {:?}", id, failures, delay);
                    sched.retry.insert(
                        id.clone(),
                        RetryState {
                            failures,
                            not_before: Instant::now() + delay,
                        },
                    );
                }
                Outcome::Converged | Outcome::Unsettled => {
                    sched.retry.remove(&id);
                }
                Outcome::Gone => {
                    sched.retry.remove(&id);
                    sched.absent_since.remove(&id);
                }
            }
            sched.rerun.remove(&id)
        };
        if rerun {
            self.dispatch(id, Trigger::Intent);
        }
    }

    fn collect_garbage(&self) {
        let grace = self.settings.gc_grace;
        let due: Vec<(HostId, u64)> = {
            let sched = self.sched.lock();
            sched
                .absent_since
                .iter()
                .filter(|(id, entry)| entry.0.elapsed() >= grace && !sched.in_flight.contains(*id))
                .map(|(id, entry)| (id.clone(), entry.1))
                .collect()
        };
        for (id, generation) in due {
            if !self.queue.collect(&id, generation) {
                debug!("Host {} changed since it went absent, keeping it", id);
            }
            let mut sched = self.sched.lock();
            sched.absent_since.remove(&id);
            sched.retry.remove(&id);
        }
    }

    async fn reconcile(&self, id: &HostId) -> Outcome {
        let mut carried: Option<(u64, Inspection)> = None;

        for _ in 0..self.settings.max_steps {
            let Some(host) = self.registry.get(id) else {
                return Outcome::Gone;
            };
            let generation = host.generation;
            let fallback = handle_for(&self.prefix, id);

            let current = match carried.take() {
                Some((g, inspection)) if g == generation => inspection,
                _ => match self.engine.inspect(&fallback).await {
                    Ok(inspection) => inspection,
                    Err(e) => match self.fail(&host, generation, &e) {
                        true => return Outcome::Failed,
                        false => continue,
                    },
                },
            };

            let Some(next) = plan(host.desired, &current, host.spec_digest.as_deref()) else {
                self.settle(&host, generation, current.state);
                return Outcome::Converged;
            };

            debug!(
                "Host {} ({} -> {}) at generation {}: {:?}",
                id, current.state, host.desired, generation, next.steps
            );
            let handle = current.handle.clone().unwrap_or(fallback);
            if let Err(e) = self.execute(&host, &next, &handle).await {
                match self.fail(&host, generation, &e) {
                    true => return Outcome::Failed,
                    false => continue,
                }
            }

            let confirmed = match self.engine.inspect(&handle).await {
                Ok(inspection) => inspection,
                Err(e) => match self.fail(&host, generation, &e) {
                    true => return Outcome::Failed,
                    false => continue,
                },
            };
            if confirmed.state != next.expect {
                let e = EngineError::failed(format!(
                    "expected {} after {:?}, engine reports {}",
                    next.expect, next.steps, confirmed.state
                ));
                match self.fail(&host, generation, &e) {
                    true => return Outcome::Failed,
                    false => continue,
                }
            }

            let observation = Observation::ok(confirmed.state);
            if self.registry.update_observed(id, generation, observation) {
                self.track_absence(&host, generation, confirmed.state);
                carried = Some((generation, confirmed));
            } else {
                debug!("Host {} superseded during {:?}, starting over", id, next.steps);
            }
        }

        debug!("Host {} did not settle within {} steps", id, self.settings.max_steps);
        Outcome::Unsettled
    }

    async fn execute(&self, host: &Host, plan: &Plan, handle: &EngineHandle) -> Result<(), EngineError> {
        for step in &plan.steps {
            match step {
                Step::EnsureImage => {
                    let spec = host
                        .spec
                        .as_ref()
                        .ok_or_else(|| EngineError::failed(format!("host {} has no spec", host.id)))?;
                    self.engine.ensure_image(&spec.image_ref()).await?;
                }
                Step::Create => {
                    let spec = host
                        .spec
                        .as_ref()
                        .ok_or_else(|| EngineError::failed(format!("host {} has no spec", host.id)))?;
                    let digest = host.spec_digest.clone().unwrap_or_else(|| spec.digest());
                    self.engine
                        .create(CreateRequest {
                            name: &handle.name,
                            host_id: &host.id,
                            spec,
                            spec_digest: &digest,
                        })
                        .await?;
                }
                Step::Start => self.engine.start(handle).await?,
                Step::Stop => self.stop(handle).await?,
                Step::Remove => match self.engine.remove(handle).await {
                    Err(e) if !e.is_not_found() => return Err(e),
                    _ => {}
                },
            }
        }
        Ok(())
    }

    /// Graceful stop, escalating to a kill when the stop times out.
    async fn stop(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        match self.engine.stop(handle, self.settings.stop_grace).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) if e.is_timeout() => {
                warn!("Stop of {} timed out, killing it", handle.name);
                match self.engine.kill(handle).await {
                    Err(e) if !e.is_not_found() => Err(e),
                    _ => Ok(()),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Record a failure at `generation`.  Returns `false` when the failure
    /// belongs to a superseded intent and was dropped.
    fn fail(&self, host: &Host, generation: u64, e: &EngineError) -> bool {
        let applied = self.registry.update_observed(
            &host.id,
            generation,
            Observation::failed(ObservedState::Errored, HostError::from(e)),
        );
        if applied {
            warn!("Host {} failed at generation {}: {}", host.id, generation, e);
        } else {
            debug!("Dropping failure for superseded generation {} of {}", generation, host.id);
        }
        applied
    }

    /// Commit a converged observation when it changes anything.
    fn settle(&self, host: &Host, generation: u64, state: ObservedState) {
        let changed = host.observed != state || host.last_error.is_some() || host.is_pending();
        if changed && self.registry.update_observed(&host.id, generation, Observation::ok(state)) {
            info!("Host {} converged: {}", host.id, state);
        }
        self.track_absence(host, generation, state);
    }

    fn track_absence(&self, host: &Host, generation: u64, state: ObservedState) {
        let mut sched = self.sched.lock();
        if host.desired == DesiredState::Absent && state == ObservedState::Absent {
            let keep = matches!(sched.absent_since.get(&host.id), Some((_, g)) if *g == generation);
            if !keep {
                sched.absent_since.insert(host.id.clone(), (Instant::now(), generation));
            }
        } else {
            sched.absent_since.remove(&host.id);
        }
    }

    /// Number of hosts with a job running right now.
    pub fn in_flight(&self) -> usize {
        self.sched.lock().in_flight.len()
    }

    /// Consecutive failures recorded for `id`.
    pub fn failures(&self, id: &HostId) -> u32 {
        self.sched.lock().retry.get(id).map_or(0, |r| r.failures)
    }
}
