use std::time::Duration;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::types::{EngineHandle, HostId, HostSpec, ObservedState};

pub mod docker;
pub mod timeout;

pub use docker::DockerEngine;
pub use timeout::{EngineTimeouts, TimeoutEngine};

/// Label marking containers owned by hostlife.
pub const LABEL_MANAGED: &str = "hostlife.managed";
/// Label carrying the owning host id.
pub const LABEL_HOST: &str = "hostlife.host";
/// Label carrying the digest of the spec the container was created from.
pub const LABEL_SPEC: &str = "hostlife.spec";

/// What the engine reported about one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inspection {
    pub state: ObservedState,
    pub handle: Option<EngineHandle>,
    pub spec_digest: Option<String>,
}

impl Inspection {
    pub fn absent() -> Self {
        Self {
            state: ObservedState::Absent,
            handle: None,
            spec_digest: None,
        }
    }
}

/// A container found in the engine carrying the managed label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedContainer {
    pub host_id: HostId,
    pub handle: EngineHandle,
}

/// Parameters of a single `create` call.
#[derive(Debug, Clone, Copy)]
pub struct CreateRequest<'a> {
    pub name: &'a str,
    pub host_id: &'a HostId,
    pub spec: &'a HostSpec,
    pub spec_digest: &'a str,
}

/// Lifecycle commands against a container engine.
///
/// Implementations never retry: a failed call is reported once and the
/// reconciler decides when to try again.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create (but do not start) a container.
    async fn create(&self, req: CreateRequest<'_>) -> Result<EngineHandle, EngineError>;

    async fn start(&self, handle: &EngineHandle) -> Result<(), EngineError>;

    /// Graceful stop; the engine kills the container once `grace` elapses.
    async fn stop(&self, handle: &EngineHandle, grace: Duration) -> Result<(), EngineError>;

    /// Forced stop, used when a graceful stop did not return in time.
    async fn kill(&self, handle: &EngineHandle) -> Result<(), EngineError>;

    async fn remove(&self, handle: &EngineHandle) -> Result<(), EngineError>;

    /// Current state of the container.  An unknown container is
    /// reported as [`ObservedState::Absent`], not as an error.
    async fn inspect(&self, handle: &EngineHandle) -> Result<Inspection, EngineError>;

    /// Make sure `image` is present locally, pulling it if needed.
    async fn ensure_image(&self, image: &str) -> Result<(), EngineError>;

    /// Pull `image` unconditionally.
    async fn pull(&self, image: &str) -> Result<(), EngineError>;

    /// Whether a local image is tagged exactly `image`.
    async fn image_exists(&self, image: &str) -> Result<bool, EngineError>;

    /// Every container carrying the managed label.
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, EngineError>;

    /// Engine version string.
    async fn version(&self) -> Result<String, EngineError>;
}
