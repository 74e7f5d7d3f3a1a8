//! The approval gate.
//!
//! A node only executes training plans whose source has been approved. Plans are identified by the
//! SHA-256 hash of their source. The first time a node sees a plan, the plan is registered as
//! pending and an operator has to [`approve`] it before it can run.
//!
//! [`approve`]: ApprovalGate::approve

use std::{
    collections::BTreeMap,
    fs,
    io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use displaydoc::Display;
use serde::{Deserialize, Serialize};
use sodiumoxide::crypto::hash::sha256;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use fedlab_core::message::ApprovalStatus;

/// Errors of the approval gate.
#[derive(Debug, Display, Error)]
pub enum ApprovalError {
    /// No training plan with hash {0} is registered.
    UnknownHash(String),
    /// Failed to access the plan registry: {0}.
    Io(#[from] io::Error),
    /// The plan registry is corrupted: {0}.
    Corrupted(#[from] serde_json::Error),
    /// The plan registry is poisoned.
    Poisoned,
}

/// The trust decision for a training plan.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    /// The hex encoded SHA-256 hash of the plan source.
    pub hash: String,
    pub status: ApprovalStatus,
    /// The name the plan was first seen under.
    pub name: String,
}

/// The outcome of [`ApprovalGate::check`].
#[derive(Clone, Debug, PartialEq)]
pub struct ApprovalOutcome {
    /// Whether the plan may be executed.
    pub approved: bool,
    /// The record of the plan. `None` if approval is disabled.
    pub record: Option<ApprovalRecord>,
}

/// A durable store of approval records.
pub trait PlanRegistry: Send {
    fn get(&self, hash: &str) -> Result<Option<ApprovalRecord>, ApprovalError>;

    /// Inserts or replaces a record.
    fn put(&mut self, record: ApprovalRecord) -> Result<(), ApprovalError>;

    fn records(&self) -> Result<Vec<ApprovalRecord>, ApprovalError>;
}

/// A registry living in memory only.
#[derive(Debug, Default)]
pub struct MemoryRegistry(BTreeMap<String, ApprovalRecord>);

impl PlanRegistry for MemoryRegistry {
    fn get(&self, hash: &str) -> Result<Option<ApprovalRecord>, ApprovalError> {
        Ok(self.0.get(hash).cloned())
    }

    fn put(&mut self, record: ApprovalRecord) -> Result<(), ApprovalError> {
        self.0.insert(record.hash.clone(), record);
        Ok(())
    }

    fn records(&self) -> Result<Vec<ApprovalRecord>, ApprovalError> {
        Ok(self.0.values().cloned().collect())
    }
}

/// A registry persisted as a JSON file. Every change is written through.
#[derive(Debug)]
pub struct JsonRegistry {
    path: PathBuf,
    records: BTreeMap<String, ApprovalRecord>,
}

impl JsonRegistry {
    /// Opens the registry at `path`. A missing file is an empty registry.
    ///
    /// # Errors
    /// Fails if the file can't be read or doesn't hold a registry.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ApprovalError> {
        let path = path.into();
        let records = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<(), ApprovalError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&self.records)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl PlanRegistry for JsonRegistry {
    fn get(&self, hash: &str) -> Result<Option<ApprovalRecord>, ApprovalError> {
        Ok(self.records.get(hash).cloned())
    }

    fn put(&mut self, record: ApprovalRecord) -> Result<(), ApprovalError> {
        self.records.insert(record.hash.clone(), record);
        self.persist()
    }

    fn records(&self) -> Result<Vec<ApprovalRecord>, ApprovalError> {
        Ok(self.records.values().cloned().collect())
    }
}

/// Gates the execution of training plans.
pub struct ApprovalGate {
    enabled: bool,
    registry: Mutex<Box<dyn PlanRegistry>>,
}

impl ApprovalGate {
    /// Creates a gate. If `enabled` is false every plan is approved.
    pub fn new(enabled: bool, registry: impl PlanRegistry + 'static) -> Self {
        Self {
            enabled,
            registry: Mutex::new(Box::new(registry)),
        }
    }

    /// Whether plans need to be approved before they run.
    pub fn requires_approval(&self) -> bool {
        self.enabled
    }

    /// Computes the hex encoded SHA-256 hash of a plan source.
    pub fn hash(source: &[u8]) -> String {
        hex::encode(sha256::hash(source).as_ref())
    }

    fn with_registry<T>(
        &self,
        f: impl FnOnce(&mut dyn PlanRegistry) -> Result<T, ApprovalError>,
    ) -> Result<T, ApprovalError> {
        let mut registry = self.registry.lock().map_err(|_| ApprovalError::Poisoned)?;
        f(registry.as_mut())
    }

    /// Checks whether a plan may be executed.
    ///
    /// An unknown plan is registered as pending under `name` and is not approved. Checking the
    /// same plan again doesn't create another record.
    ///
    /// # Errors
    /// Fails if the registry can't be accessed.
    pub fn check(&self, source: &[u8], name: &str) -> Result<ApprovalOutcome, ApprovalError> {
        if !self.enabled {
            debug!("plan approval is disabled");
            return Ok(ApprovalOutcome {
                approved: true,
                record: None,
            });
        }
        let hash = Self::hash(source);
        let record = self.with_registry(|registry| match registry.get(&hash)? {
            Some(record) => Ok(record),
            None => {
                let record = ApprovalRecord {
                    hash: hash.clone(),
                    status: ApprovalStatus::Pending,
                    name: name.to_string(),
                };
                registry.put(record.clone())?;
                warn!("training plan {} ({}) registered as pending", name, hash);
                Ok(record)
            }
        })?;
        let approved = record.status == ApprovalStatus::Approved;
        debug!(
            "training plan {} has status {}",
            record.hash, record.status
        );
        Ok(ApprovalOutcome {
            approved,
            record: Some(record),
        })
    }

    /// Looks a plan up without registering it.
    pub fn status(&self, source: &[u8]) -> Result<Option<ApprovalRecord>, ApprovalError> {
        let hash = Self::hash(source);
        self.with_registry(|registry| registry.get(&hash))
    }

    /// Registers a plan as pending, unless it's already known.
    pub fn register(&self, source: &[u8], name: &str) -> Result<ApprovalRecord, ApprovalError> {
        let hash = Self::hash(source);
        self.with_registry(|registry| {
            if let Some(record) = registry.get(&hash)? {
                return Ok(record);
            }
            let record = ApprovalRecord {
                hash,
                status: ApprovalStatus::Pending,
                name: name.to_string(),
            };
            registry.put(record.clone())?;
            Ok(record)
        })
    }

    /// Approves a registered plan.
    pub fn approve(&self, hash: &str) -> Result<ApprovalRecord, ApprovalError> {
        self.set_status(hash, ApprovalStatus::Approved)
    }

    /// Rejects a registered plan.
    pub fn reject(&self, hash: &str) -> Result<ApprovalRecord, ApprovalError> {
        self.set_status(hash, ApprovalStatus::Rejected)
    }

    /// Registers and approves a plan in one go.
    pub fn register_approved(
        &self,
        source: &[u8],
        name: &str,
    ) -> Result<ApprovalRecord, ApprovalError> {
        let record = self.register(source, name)?;
        self.approve(&record.hash)
    }

    fn set_status(
        &self,
        hash: &str,
        status: ApprovalStatus,
    ) -> Result<ApprovalRecord, ApprovalError> {
        let record = self.with_registry(|registry| {
            let mut record = registry
                .get(hash)?
                .ok_or_else(|| ApprovalError::UnknownHash(hash.to_string()))?;
            record.status = status;
            registry.put(record.clone())?;
            Ok(record)
        })?;
        info!("training plan {} is now {}", record.hash, record.status);
        Ok(record)
    }

    pub fn records(&self) -> Result<Vec<ApprovalRecord>, ApprovalError> {
        self.with_registry(|registry| registry.records())
    }
}
