//! Deadline enforcement for engine calls.
//!
//! Every call made through [`TimeoutEngine`] either finishes within its
//! budget or resolves to an [`EngineErrorKind::Timeout`] error.  The
//! underlying request is dropped, not retried.
//!
//! [`EngineErrorKind::Timeout`]: crate::error::EngineErrorKind::Timeout

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use log::warn;

use super::{ContainerEngine, CreateRequest, Inspection, ManagedContainer};
use crate::error::EngineError;
use crate::types::EngineHandle;

/// Per-call time budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineTimeouts {
    /// Budget for ordinary calls.
    pub call: Duration,
    /// Budget for image pulls.
    pub pull: Duration,
}

impl Default for EngineTimeouts {
    fn default() -> Self {
        Self {
            call: Duration::from_secs(30),
            pull: Duration::from_secs(600),
        }
    }
}

pub struct TimeoutEngine<E> {
    inner: E,
    timeouts: EngineTimeouts,
}

impl<E: ContainerEngine> TimeoutEngine<E> {
    pub fn new(inner: E, timeouts: EngineTimeouts) -> Self {
        Self { inner, timeouts }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }
}

async fn bounded<T, F>(op: &str, target: &str, budget: Duration, fut: F) -> Result<T, EngineError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    match tokio::time::timeout(budget, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!("Engine {} on {} timed out after {:?}", op, target, budget);
            Err(EngineError::timeout(op, budget))
        }
    }
}

#[async_trait]
impl<E: ContainerEngine> ContainerEngine for TimeoutEngine<E> {
    async fn create(&self, req: CreateRequest<'_>) -> Result<EngineHandle, EngineError> {
        bounded("create", req.name, self.timeouts.call, self.inner.create(req)).await
    }

    async fn start(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        bounded("start", &handle.name, self.timeouts.call, self.inner.start(handle)).await
    }

    async fn stop(&self, handle: &EngineHandle, grace: Duration) -> Result<(), EngineError> {
        // The engine itself waits up to `grace` before killing
        let budget = self.timeouts.call + grace;
        bounded("stop", &handle.name, budget, self.inner.stop(handle, grace)).await
    }

    async fn kill(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        bounded("kill", &handle.name, self.timeouts.call, self.inner.kill(handle)).await
    }

    async fn remove(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        bounded("remove", &handle.name, self.timeouts.call, self.inner.remove(handle)).await
    }

    async fn inspect(&self, handle: &EngineHandle) -> Result<Inspection, EngineError> {
        bounded("inspect", &handle.name, self.timeouts.call, self.inner.inspect(handle)).await
    }

    async fn ensure_image(&self, image: &str) -> Result<(), EngineError> {
        bounded("ensure_image", image, self.timeouts.pull, self.inner.ensure_image(image)).await
    }

    async fn pull(&self, image: &str) -> Result<(), EngineError> {
        bounded("pull", image, self.timeouts.pull, self.inner.pull(image)).await
    }

    async fn image_exists(&self, image: &str) -> Result<bool, EngineError> {
        bounded("image_exists", image, self.timeouts.call, self.inner.image_exists(image)).await
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>, EngineError> {
        bounded("list", "engine", self.timeouts.call, self.inner.list_managed()).await
    }

    async fn version(&self) -> Result<String, EngineError> {
        bounded("version", "engine", self.timeouts.call, self.inner.version()).await
    }
}
