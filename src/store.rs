//! Durable record of desired state.
//!
//! The registry itself is in-memory; whatever the command queue accepts is
//! written here first so the registry can be rebuilt on startup.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use log::{debug, info};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::types::{DesiredState, HostId, HostSpec};

/// Persisted intent for one host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredRecord {
    pub id: HostId,
    pub desired: DesiredState,
    pub spec: Option<HostSpec>,
}

pub trait DesiredStateStore: Send + Sync {
    fn load(&self) -> Result<Vec<DesiredRecord>, StoreError>;

    fn record(&self, record: &DesiredRecord) -> Result<(), StoreError>;

    fn forget(&self, id: &HostId) -> Result<(), StoreError>;
}

/// Keeps records in process memory only.
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<HostId, DesiredRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = DesiredRecord>) -> Self {
        let store = Self::new();
        store
            .records
            .lock()
            .extend(records.into_iter().map(|r| (r.id.clone(), r)));
        store
    }

    pub fn get(&self, id: &HostId) -> Option<DesiredRecord> {
        self.records.lock().get(id).cloned()
    }
}

impl DesiredStateStore for MemoryStore {
    fn load(&self) -> Result<Vec<DesiredRecord>, StoreError> {
        Ok(self.records.lock().values().cloned().collect())
    }

    fn record(&self, record: &DesiredRecord) -> Result<(), StoreError> {
        self.records.lock().insert(record.id.clone(), record.clone());
        Ok(())
    }

    fn forget(&self, id: &HostId) -> Result<(), StoreError> {
        self.records.lock().remove(id);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    hosts: Vec<DesiredRecord>,
}

/// JSON file holding every record, rewritten atomically on each change.
pub struct JsonFileStore {
    path: PathBuf,
    records: Mutex<BTreeMap<HostId, DesiredRecord>>,
}

impl JsonFileStore {
    /// Open the store at `path`; a missing file is an empty store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let records = match fs::read(&path) {
            Ok(bytes) if bytes.is_empty() => BTreeMap::new(),
            Ok(bytes) => {
                let file: StoreFile = serde_json::from_slice(&bytes)?;
                file.hosts.into_iter().map(|r| (r.id.clone(), r)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        info!("Opened state file {} with {} hosts", path.display(), records.len());
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    fn flush(&self, records: &BTreeMap<HostId, DesiredRecord>) -> Result<(), StoreError> {
        let file = StoreFile {
            hosts: records.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;

        let tmp = self.path.with_extension("json.tmp");
        {
            let mut out = fs::File::create(&tmp)?;
            out.write_all(&bytes)?;
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!("Wrote {} hosts to {}", file.hosts.len(), self.path.display());
        Ok(())
    }
}

impl DesiredStateStore for JsonFileStore {
    fn load(&self) -> Result<Vec<DesiredRecord>, StoreError> {
        Ok(self.records.lock().values().cloned().collect())
    }

    fn record(&self, record: &DesiredRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        let previous = records.insert(record.id.clone(), record.clone());
        if let Err(e) = self.flush(&records) {
            // Keep memory in step with disk
            match previous {
                Some(p) => records.insert(p.id.clone(), p),
                None => records.remove(&record.id),
            };
            return Err(e);
        }
        Ok(())
    }

    fn forget(&self, id: &HostId) -> Result<(), StoreError> {
        let mut records = self.records.lock();
        if let Some(previous) = records.remove(id) {
            if let Err(e) = self.flush(&records) {
                records.insert(previous.id.clone(), previous);
                return Err(e);
            }
        }
        Ok(())
    }
}
