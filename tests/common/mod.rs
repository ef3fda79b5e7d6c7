//! Scripted in-memory container engine for driving the full service.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use hostlife::runtime::{ContainerEngine, CreateRequest, Inspection, ManagedContainer};
use hostlife::types::EngineHandle;
use hostlife::{
    Backoff, EngineError, EngineErrorKind, HostId, HostStatus, Hostlife, MemoryStore, ObservedState,
    ReconcilerSettings, ServiceOptions, TransitionPolicy,
};

pub const PREFIX: &str = "hl_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Create,
    Start,
    Stop,
    Kill,
    Remove,
    Inspect,
    EnsureImage,
    Pull,
    ImageExists,
    List,
    Version,
}

impl Op {
    pub fn is_mutating(self) -> bool {
        matches!(self, Op::Create | Op::Start | Op::Stop | Op::Kill | Op::Remove)
    }
}

#[derive(Debug, Clone)]
pub struct Call {
    pub op: Op,
    pub target: String,
    pub at: Instant,
}

/// How a scripted operation misbehaves.
#[derive(Debug, Clone)]
pub enum Behaviour {
    Fail(EngineErrorKind),
    /// Never returns; pair with a timeout wrapper.
    Hang,
    /// Panics once, then behaves.
    Panic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeContainer {
    pub host_id: HostId,
    pub running: bool,
    pub spec_digest: Option<String>,
    pub image: String,
}

#[derive(Default)]
struct State {
    containers: HashMap<String, FakeContainer>,
    images: HashSet<String>,
    calls: Vec<Call>,
    behaviour: HashMap<Op, Behaviour>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    start_gate: Mutex<Option<Arc<Notify>>>,
    start_entered: Notify,
}

#[derive(Clone, Default)]
pub struct FakeEngine {
    inner: Arc<Inner>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script `op` to misbehave until cleared.
    pub fn script(&self, op: Op, behaviour: Behaviour) {
        self.inner.state.lock().behaviour.insert(op, behaviour);
    }

    pub fn clear(&self, op: Op) {
        self.inner.state.lock().behaviour.remove(&op);
    }

    /// Make the next `start` wait until the returned notify fires.
    pub fn hold_next_start(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.inner.start_gate.lock() = Some(Arc::clone(&gate));
        gate
    }

    /// Resolves once a held `start` has been entered.
    pub async fn start_entered(&self) {
        self.inner.start_entered.notified().await
    }

    pub fn seed(&self, host: &str, running: bool, spec_digest: Option<&str>) {
        self.seed_named(&format!("{}{}", PREFIX, host), host, running, spec_digest);
    }

    /// Seed a managed container under an arbitrary engine name.
    pub fn seed_named(&self, name: &str, host: &str, running: bool, spec_digest: Option<&str>) {
        self.inner.state.lock().containers.insert(
            name.to_string(),
            FakeContainer {
                host_id: HostId::new(host),
                running,
                spec_digest: spec_digest.map(str::to_string),
                image: "seeded".into(),
            },
        );
    }

    /// Change a container's state without going through the service.
    pub fn set_running(&self, host: &str, running: bool) {
        if let Some(c) = self.inner.state.lock().containers.get_mut(&format!("{}{}", PREFIX, host)) {
            c.running = running;
        }
    }

    pub fn container_named(&self, name: &str) -> Option<FakeContainer> {
        self.inner.state.lock().containers.get(name).cloned()
    }

    pub fn seed_image(&self, image: &str) {
        self.inner.state.lock().images.insert(image.to_string());
    }

    pub fn has_image(&self, image: &str) -> bool {
        self.inner.state.lock().images.contains(image)
    }

    pub fn container(&self, host: &str) -> Option<FakeContainer> {
        self.inner
            .state
            .lock()
            .containers
            .get(&format!("{}{}", PREFIX, host))
            .cloned()
    }

    pub fn calls(&self, op: Op) -> Vec<Call> {
        self.inner
            .state
            .lock()
            .calls
            .iter()
            .filter(|c| c.op == op)
            .cloned()
            .collect()
    }

    pub fn count(&self, op: Op) -> usize {
        self.calls(op).len()
    }

    pub fn mutating_calls(&self) -> usize {
        self.inner.state.lock().calls.iter().filter(|c| c.op.is_mutating()).count()
    }

    pub fn clear_calls(&self) {
        self.inner.state.lock().calls.clear();
    }

    async fn enter(&self, op: Op, target: &str) -> Result<(), EngineError> {
        let behaviour = {
            let mut state = self.inner.state.lock();
            state.calls.push(Call {
                op,
                target: target.to_string(),
                at: Instant::now(),
            });
            let behaviour = state.behaviour.get(&op).cloned();
            if matches!(behaviour, Some(Behaviour::Panic)) {
                state.behaviour.remove(&op);
            }
            behaviour
        };
        match behaviour {
            None => Ok(()),
            Some(Behaviour::Fail(kind)) => Err(EngineError::new(kind, format!("scripted {:?} failure", op))),
            Some(Behaviour::Hang) => std::future::pending().await,
            Some(Behaviour::Panic) => panic!("scripted {:?} panic on {}", op, target),
        }
    }

    fn with_container<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut FakeContainer) -> T,
    ) -> Result<T, EngineError> {
        let mut state = self.inner.state.lock();
        match state.containers.get_mut(name) {
            Some(c) => Ok(f(c)),
            None => Err(EngineError::not_found(format!("no such container: {}", name))),
        }
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn create(&self, req: CreateRequest<'_>) -> Result<EngineHandle, EngineError> {
        self.enter(Op::Create, req.name).await?;
        let mut state = self.inner.state.lock();
        if state.containers.contains_key(req.name) {
            return Err(EngineError::failed(format!("name {} already in use", req.name)));
        }
        state.containers.insert(
            req.name.to_string(),
            FakeContainer {
                host_id: req.host_id.clone(),
                running: false,
                spec_digest: Some(req.spec_digest.to_string()),
                image: req.spec.image_ref(),
            },
        );
        Ok(EngineHandle {
            name: req.name.to_string(),
            id: Some(format!("id-{}", req.name)),
        })
    }

    async fn start(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.enter(Op::Start, &handle.name).await?;
        let gate = self.inner.start_gate.lock().take();
        if let Some(gate) = gate {
            self.inner.start_entered.notify_one();
            gate.notified().await;
        }
        self.with_container(&handle.name, |c| c.running = true)
    }

    async fn stop(&self, handle: &EngineHandle, _grace: Duration) -> Result<(), EngineError> {
        self.enter(Op::Stop, &handle.name).await?;
        self.with_container(&handle.name, |c| c.running = false)
    }

    async fn kill(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.enter(Op::Kill, &handle.name).await?;
        self.with_container(&handle.name, |c| c.running = false)
    }

    async fn remove(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        self.enter(Op::Remove, &handle.name).await?;
        match self.inner.state.lock().containers.remove(&handle.name) {
            Some(_) => Ok(()),
            None => Err(EngineError::not_found(format!("no such container: {}", handle.name))),
        }
    }

    async fn inspect(&self, handle: &EngineHandle) -> Result<Inspection, EngineError> {
        self.enter(Op::Inspect, &handle.name).await?;
        let state = self.inner.state.lock();
        Ok(match state.containers.get(&handle.name) {
            None => Inspection::absent(),
            Some(c) => Inspection {
                state: if c.running {
                    ObservedState::Running
                } else {
                    ObservedState::Stopped
                },
                handle: Some(EngineHandle {
                    name: handle.name.clone(),
                    id: Some(format!("id-{}", handle.name)),
                }),
                spec_digest: c.spec_digest.clone(),
            },
        })
    }

    async fn ensure_image(&self, image: &str) -> Result<(), EngineError> {
        self.enter(Op::EnsureImage, image).await?;
        self.seed_image(image);
        Ok(())
    }

    async fn pull(&self, image: &str) -> Result<(), EngineError> {
        self.enter(Op::Pull, image).await?;
        self.seed_image(image);
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        self.enter(Op::ImageExists, image).await?;
        Ok(self.has_image(image))
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, EngineError> {
        self.enter(Op::List, "engine").await?;
        let state = self.inner.state.lock();
        let mut out: Vec<_> = state
            .containers
            .iter()
            .map(|(name, c)| ManagedContainer {
                host_id: c.host_id.clone(),
                handle: EngineHandle::named(name.clone()),
            })
            .collect();
        out.sort_by(|a, b| a.handle.name.cmp(&b.handle.name));
        Ok(out)
    }

    async fn version(&self) -> Result<String, EngineError> {
        self.enter(Op::Version, "engine").await?;
        Ok("fake-1.0".into())
    }
}

/// Fast settings for paused-clock tests.
pub fn options() -> ServiceOptions {
    ServiceOptions {
        container_prefix: PREFIX.into(),
        default_registry: None,
        settings: ReconcilerSettings {
            interval: Duration::from_millis(100),
            workers: 4,
            stop_grace: Duration::from_secs(1),
            backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(4)),
            gc_grace: Duration::from_secs(2),
            max_steps: 8,
        },
        policy: TransitionPolicy::default(),
    }
}

pub fn service(engine: Arc<dyn ContainerEngine>, store: Arc<MemoryStore>) -> Arc<Hostlife> {
    Arc::new(Hostlife::new(engine, store, options()))
}

pub fn id(s: &str) -> HostId {
    HostId::new(s)
}

/// Poll `check` until it holds; panics after a minute of (virtual) time.
pub async fn wait_for<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let waited = tokio::time::timeout(Duration::from_secs(60), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {}", what);
}

pub async fn wait_for_state(hostlife: &Hostlife, host: &str, observed: ObservedState) -> HostStatus {
    let target = id(host);
    wait_for(&format!("{} to be {}", host, observed), || {
        hostlife.host(&target).map_or(false, |s| s.observed == observed)
    })
    .await;
    hostlife.host(&target).expect("host vanished")
}

/// Let the reconciler run for `d` of virtual time.
pub async fn run_for(d: Duration) {
    tokio::time::sleep(d).await;
}
