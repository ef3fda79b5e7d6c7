//! Read-only view of the registry for the web layer.

use std::sync::Arc;

use crate::registry::HostRegistry;
use crate::types::{HostId, HostStatus};

#[derive(Clone)]
pub struct StatusPublisher {
    registry: Arc<HostRegistry>,
}

impl StatusPublisher {
    pub fn new(registry: Arc<HostRegistry>) -> Self {
        Self { registry }
    }

    /// Every host ordered by id, taken from one registry snapshot.
    pub fn list(&self) -> Vec<HostStatus> {
        self.registry.snapshot().iter().map(HostStatus::from).collect()
    }

    pub fn get(&self, id: &HostId) -> Option<HostStatus> {
        self.registry.get(id).as_ref().map(HostStatus::from)
    }
}
