//! Data structures shared by every part of the lifecycle core.
//!
//! A [`Host`] is one managed container.  Its desired state is written by
//! the command queue, its observed state and last error by the reconciler.
//! Everything here is plain data and serialises with
//! [`serde`](https://serde.rs/) so the web layer can hand snapshots
//! straight to its templates.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{EngineError, EngineErrorKind};

/// Stable opaque identifier of a managed host.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(String);

impl HostId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HostId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for HostId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Lifecycle state requested by an external actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    Absent,
    Stopped,
    Running,
}

impl fmt::Display for DesiredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
        }
    }
}

/// Lifecycle state last confirmed from the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservedState {
    Unknown,
    Absent,
    Stopped,
    Running,
    Errored,
}

impl ObservedState {
    /// Whether this observation satisfies `desired`.
    pub fn satisfies(self, desired: DesiredState) -> bool {
        matches!(
            (desired, self),
            (DesiredState::Absent, ObservedState::Absent)
                | (DesiredState::Stopped, ObservedState::Stopped)
                | (DesiredState::Running, ObservedState::Running)
        )
    }
}

impl fmt::Display for ObservedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Absent => write!(f, "absent"),
            Self::Stopped => write!(f, "stopped"),
            Self::Running => write!(f, "running"),
            Self::Errored => write!(f, "errored"),
        }
    }
}

/// A bind mount from the engine host into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Largest accepted memory limit (1 PiB).
pub const MAX_MEMORY_MB: u64 = 1 << 30;
/// Largest accepted CPU limit, in thousandths of a core.
pub const MAX_CPU_MILLIS: u64 = 1 << 20;

/// Immutable creation parameters of a host's container.
///
/// A spec is never edited in place: a different spec means the container
/// is recreated.  Maps are ordered so the [`digest`](HostSpec::digest) is
/// stable across processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpec {
    pub image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    /// CPU limit in millicores (1000 = one core).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_millis: Option<u64>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
}

impl HostSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            registry: None,
            memory_mb: None,
            cpu_millis: None,
            mounts: Vec::new(),
            env: BTreeMap::new(),
            command: None,
        }
    }

    pub fn registry(mut self, registry: impl Into<String>) -> Self {
        self.registry = Some(registry.into());
        self
    }

    pub fn memory_mb(mut self, mb: u64) -> Self {
        self.memory_mb = Some(mb);
        self
    }

    pub fn cpu_millis(mut self, millis: u64) -> Self {
        self.cpu_millis = Some(millis);
        self
    }

    pub fn mount(mut self, source: impl Into<String>, target: impl Into<String>, read_only: bool) -> Self {
        self.mounts.push(Mount {
            source: source.into(),
            target: target.into(),
            read_only,
        });
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn command(mut self, command: Vec<String>) -> Self {
        self.command = Some(command);
        self
    }

    /// Check the spec can be handed to the engine at all.
    pub fn validate(&self) -> Result<(), String> {
        if image_reference(self.registry.as_deref(), &self.image).is_empty() {
            return Err("image cannot be empty".into());
        }
        match self.memory_mb {
            Some(0) => return Err("memory limit must be positive".into()),
            Some(mb) if mb > MAX_MEMORY_MB => {
                return Err(format!("memory limit {} MB exceeds {} MB", mb, MAX_MEMORY_MB))
            }
            _ => {}
        }
        match self.cpu_millis {
            Some(0) => return Err("cpu limit must be positive".into()),
            Some(m) if m > MAX_CPU_MILLIS => {
                return Err(format!("cpu limit {}m exceeds {}m", m, MAX_CPU_MILLIS))
            }
            _ => {}
        }
        if let Some(m) = self.mounts.iter().find(|m| m.source.is_empty() || m.target.is_empty()) {
            return Err(format!("mount {:?} -> {:?} is incomplete", m.source, m.target));
        }
        Ok(())
    }

    /// Fully qualified image reference, registry included.
    pub fn image_ref(&self) -> String {
        image_reference(self.registry.as_deref(), &self.image)
    }

    /// Hex sha256 over the canonical JSON form.
    ///
    /// Stamped on created containers so a container built from an older
    /// spec is recognised after a restart.
    pub fn digest(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }
}

fn strip_scheme(value: &str) -> &str {
    let value = value.trim();
    match value.find("://") {
        Some(pos) if pos > 0 && value[..pos].chars().all(|c| c.is_ascii_alphabetic()) => {
            &value[pos + 3..]
        }
        _ => value,
    }
}

/// Normalise a registry: no scheme, no trailing slash.
pub fn sanitize_registry(registry: &str) -> String {
    strip_scheme(registry).trim_end_matches('/').to_string()
}

/// Normalise an image name: no scheme, no repeated slashes.
pub fn sanitize_image(image: &str) -> String {
    let image = strip_scheme(image);
    let mut out = String::with_capacity(image.len());
    let mut prev_slash = false;
    for c in image.chars() {
        if c == '/' && prev_slash {
            continue;
        }
        prev_slash = c == '/';
        out.push(c);
    }
    out
}

/// Combine registry and image without doubling the registry prefix.
pub fn image_reference(registry: Option<&str>, image: &str) -> String {
    let image = sanitize_image(image);
    let registry = registry.map(sanitize_registry).unwrap_or_default();
    if registry.is_empty() {
        return image;
    }
    if image.is_empty() {
        return registry;
    }
    if image.starts_with(&format!("{}/", registry)) {
        return image;
    }
    format!("{}/{}", registry, image)
}

/// Split `repo[:tag]` into repository and tag, defaulting to `latest`.
///
/// Only a colon after the last slash separates a tag, so
/// `registry:5000/app` keeps its port.  Digest references are returned
/// with an empty tag.
pub fn split_tag(reference: &str) -> (&str, &str) {
    if reference.contains('@') {
        return (reference, "");
    }
    let name_start = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[name_start..].rfind(':') {
        Some(i) => {
            let at = name_start + i;
            (&reference[..at], &reference[at + 1..])
        }
        None => (reference, "latest"),
    }
}

/// Structured record of the last failure seen for a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostError {
    pub kind: EngineErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl HostError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

impl From<&EngineError> for HostError {
    fn from(e: &EngineError) -> Self {
        Self::new(e.kind, e.message.clone())
    }
}

/// Reference to a container inside the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EngineHandle {
    /// Container name, deterministic per host.
    pub name: String,
    /// Engine-assigned id, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl EngineHandle {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
        }
    }
}

/// A managed unit: desired and observed lifecycle of one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,
    pub desired: DesiredState,
    pub observed: ObservedState,
    pub spec: Option<HostSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec_digest: Option<String>,
    pub last_error: Option<HostError>,
    pub generation: u64,
    /// Generation of the last observation the reconciler committed.
    pub observed_generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_at: Option<DateTime<Utc>>,
}

impl Host {
    pub(crate) fn new(id: HostId, desired: DesiredState, spec: Option<HostSpec>) -> Self {
        let spec_digest = spec.as_ref().map(HostSpec::digest);
        Self {
            id,
            desired,
            observed: ObservedState::Unknown,
            spec,
            spec_digest,
            last_error: None,
            generation: 0,
            observed_generation: 0,
            observed_at: None,
        }
    }

    pub fn is_converged(&self) -> bool {
        self.observed.satisfies(self.desired)
    }

    /// The latest intent has not been acted on by the reconciler yet.
    pub fn is_pending(&self) -> bool {
        self.observed_generation < self.generation
    }
}

/// Receipt for an accepted (or absorbed) lifecycle intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub host_id: HostId,
    pub generation: u64,
    /// The intent matched one still pending and changed nothing.
    pub deduplicated: bool,
}

/// Read-only row exposed to the web layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostStatus {
    pub id: HostId,
    pub desired: DesiredState,
    pub observed: ObservedState,
    pub last_error: Option<HostError>,
    pub generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub converged: bool,
}

impl From<&Host> for HostStatus {
    fn from(h: &Host) -> Self {
        Self {
            id: h.id.clone(),
            desired: h.desired,
            observed: h.observed,
            last_error: h.last_error.clone(),
            generation: h.generation,
            image: h.spec.as_ref().map(HostSpec::image_ref),
            converged: h.is_converged(),
        }
    }
}

/// Whether the image of one host is present in the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageStatus {
    pub host_id: HostId,
    pub image: String,
    pub exists: bool,
}
