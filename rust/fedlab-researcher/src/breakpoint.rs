//! Experiment breakpoints.
//!
//! A breakpoint is a directory `breakpoint_NNNN` holding `breakpoint_NNNN.json` and every file
//! the experiment needs to resume. Files are linked into the directory and referenced relative to
//! it, so a breakpoint can be moved around as a whole.

use std::{
    collections::BTreeMap,
    fs,
    io,
    path::{Path, PathBuf},
};

use displaydoc::Display;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use fedlab_core::{ArgBag, JobId, ResearcherId};

use crate::{datasets::FederatedDataset, job::JobState};

const PREFIX: &str = "breakpoint_";

/// Errors of the breakpoints.
#[derive(Debug, Display, Error)]
pub enum BreakpointError {
    /// Failed to access the breakpoint {0:?}: {1}.
    Io(PathBuf, io::Error),
    /// The breakpoint {0:?} is corrupted: {1}.
    Corrupted(PathBuf, serde_json::Error),
    /// The file {0:?} can't be linked into a breakpoint.
    InvalidFile(PathBuf),
}

/// The saved state of a component of the experiment, e.g. the aggregator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComponentState {
    pub name: String,
    #[serde(default)]
    pub parameters: serde_json::Value,
}

impl ComponentState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: serde_json::Value::Null,
        }
    }
}

/// The aggregated parameters of a round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregatedParamsRecord {
    pub params_path: PathBuf,
}

/// The state of an experiment after a round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub researcher_id: ResearcherId,
    pub job_id: JobId,
    /// The number of rounds done.
    pub round_number: u32,
    /// The number of rounds to do in total.
    pub round_number_due: u32,
    pub training_data: FederatedDataset,
    pub training_args: ArgBag,
    pub model_args: ArgBag,
    /// The training plan source.
    pub model_path: PathBuf,
    pub model_class: String,
    pub aggregator: ComponentState,
    pub node_selection_strategy: ComponentState,
    pub tags: Vec<String>,
    pub aggregated_params: BTreeMap<u32, AggregatedParamsRecord>,
    pub job: JobState,
}

/// The directory holding the breakpoints of an experiment.
#[derive(Clone, Debug)]
pub struct BreakpointStore {
    root: PathBuf,
}

impl BreakpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the directory of the breakpoint taken after `round` rounds.
    ///
    /// # Errors
    /// Fails if the directory can't be created.
    pub fn create(&self, round: u32) -> Result<BreakpointDir, BreakpointError> {
        let path = self.root.join(format!("{}{:04}", PREFIX, round));
        fs::create_dir_all(&path).map_err(|err| BreakpointError::Io(path.clone(), err))?;
        Ok(BreakpointDir { path, round })
    }

    /// Finds the breakpoint of the latest round.
    ///
    /// # Errors
    /// Fails if the store can't be read.
    pub fn latest(&self) -> Result<Option<PathBuf>, BreakpointError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(BreakpointError::Io(self.root.clone(), err)),
        };
        let mut latest: Option<(u32, PathBuf)> = None;
        for entry in entries {
            let entry = entry.map_err(|err| BreakpointError::Io(self.root.clone(), err))?;
            let round = entry
                .file_name()
                .to_str()
                .and_then(|name| name.strip_prefix(PREFIX))
                .and_then(|round| round.parse::<u32>().ok());
            if let Some(round) = round {
                if entry.path().join(file_name(round)).is_file()
                    && latest.as_ref().map_or(true, |(latest, _)| round > *latest)
                {
                    latest = Some((round, entry.path()));
                }
            }
        }
        Ok(latest.map(|(_, path)| path))
    }
}

fn file_name(round: u32) -> String {
    format!("{}{:04}.json", PREFIX, round)
}

/// The directory of one breakpoint, being written.
#[derive(Debug)]
pub struct BreakpointDir {
    path: PathBuf,
    round: u32,
}

impl BreakpointDir {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Links a file into the breakpoint and returns its path relative to the breakpoint.
    ///
    /// Hard links are used where possible, files are copied otherwise.
    ///
    /// # Errors
    /// Fails if the file can neither be linked nor copied.
    pub fn link(&self, file: &Path) -> Result<PathBuf, BreakpointError> {
        let name = file
            .file_name()
            .ok_or_else(|| BreakpointError::InvalidFile(file.to_path_buf()))?;
        let target = self.path.join(name);
        if target.exists() {
            if is_same_file(file, &target) {
                return Ok(PathBuf::from(name));
            }
            // a stale file of an earlier experiment
            fs::remove_file(&target).map_err(|err| BreakpointError::Io(target.clone(), err))?;
        }
        if let Err(err) = fs::hard_link(file, &target) {
            debug!("failed to link {:?}, copying it: {}", file, err);
            fs::copy(file, &target).map_err(|err| BreakpointError::Io(file.to_path_buf(), err))?;
        }
        Ok(PathBuf::from(name))
    }

    /// Writes the breakpoint file.
    ///
    /// # Errors
    /// Fails if the file can't be written.
    pub fn write(&self, breakpoint: &Breakpoint) -> Result<PathBuf, BreakpointError> {
        let path = self.path.join(file_name(self.round));
        let json = serde_json::to_vec_pretty(breakpoint)
            .map_err(|err| BreakpointError::Corrupted(path.clone(), err))?;
        fs::write(&path, json).map_err(|err| BreakpointError::Io(path.clone(), err))?;
        info!("breakpoint saved to {:?}", self.path);
        Ok(path)
    }
}

fn is_same_file(left: &Path, right: &Path) -> bool {
    match (fs::canonicalize(left), fs::canonicalize(right)) {
        (Ok(left), Ok(right)) => left == right,
        _ => false,
    }
}

/// Reads the breakpoint of a breakpoint directory.
///
/// # Errors
/// Fails if the directory doesn't hold a breakpoint.
pub fn read(dir: &Path) -> Result<Breakpoint, BreakpointError> {
    let path = fs::read_dir(dir)
        .map_err(|err| BreakpointError::Io(dir.to_path_buf(), err))?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .find(|path| {
            path.extension().map_or(false, |ext| ext == "json")
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map_or(false, |name| name.starts_with(PREFIX))
        })
        .ok_or_else(|| {
            BreakpointError::Io(
                dir.to_path_buf(),
                io::Error::new(io::ErrorKind::NotFound, "no breakpoint file"),
            )
        })?;
    let json = fs::read(&path).map_err(|err| BreakpointError::Io(path.clone(), err))?;
    serde_json::from_slice(&json).map_err(|err| BreakpointError::Corrupted(path, err))
}

/// Resolves a path stored in a breakpoint.
pub fn resolve(dir: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        dir.join(path)
    }
}
