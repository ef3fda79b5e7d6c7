//! Container lifecycle core: keeps each managed host's container in the
//! state its owner asked for.
//!
//! Intents enter through [`CommandQueue`], land in the [`HostRegistry`],
//! and are driven to completion by the [`Reconciler`] against a
//! [`ContainerEngine`].  [`StatusPublisher`] exposes the result.

pub mod config;
pub mod error;
pub mod publisher;
pub mod queue;
pub mod reconciler;
pub mod registry;
pub mod runtime;
pub mod service;
pub mod store;
pub mod types;

pub use config::Config;
pub use error::{CommandError, EngineError, EngineErrorKind, StoreError};
pub use publisher::StatusPublisher;
pub use queue::{CommandQueue, TransitionPolicy};
pub use reconciler::{Backoff, Reconciler, ReconcilerSettings};
pub use registry::HostRegistry;
pub use runtime::{ContainerEngine, DockerEngine, EngineTimeouts, TimeoutEngine};
pub use service::{Hostlife, ServiceOptions};
pub use store::{DesiredRecord, DesiredStateStore, JsonFileStore, MemoryStore};
pub use types::{
    DesiredState, Host, HostError, HostId, HostSpec, HostStatus, ImageStatus, ObservedState, Ticket,
};
