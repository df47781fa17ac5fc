//! Durable per-symbol position state behind a small key-value interface.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::types::Direction;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state store I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("state file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("could not replace state file: {0}")]
    Persist(#[from] tempfile::PersistError),
}

/// What was planned when the position was entered.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct PositionPlan {
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub quantity: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    pub plan: Option<PositionPlan>,
    pub partial_closed: bool,
    pub last_known_size: Option<f64>,
    /// Stop currently in force once it has been moved (breakeven or trail).
    pub active_stop: Option<f64>,
}

/// Symbol-keyed position state. Storing the default state is the same as
/// deleting the symbol: `get` then returns `None` and `symbols` omits it.
pub trait StateStore {
    fn get(&self, symbol: &str) -> Result<Option<PositionState>, StoreError>;
    fn put(&mut self, symbol: &str, state: PositionState) -> Result<(), StoreError>;
    fn delete(&mut self, symbol: &str) -> Result<(), StoreError>;
    /// Every symbol with stored state, sorted.
    fn symbols(&self) -> Result<Vec<String>, StoreError>;
}

// ─── In memory ────────────────────────────────────────────────────────────────

#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    states: HashMap<String, PositionState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn get(&self, symbol: &str) -> Result<Option<PositionState>, StoreError> {
        Ok(self.states.get(symbol).cloned())
    }

    fn put(&mut self, symbol: &str, state: PositionState) -> Result<(), StoreError> {
        if state == PositionState::default() {
            self.states.remove(symbol);
        } else {
            self.states.insert(symbol.to_string(), state);
        }
        Ok(())
    }

    fn delete(&mut self, symbol: &str) -> Result<(), StoreError> {
        self.states.remove(symbol);
        Ok(())
    }

    fn symbols(&self) -> Result<Vec<String>, StoreError> {
        let mut out: Vec<String> = self.states.keys().cloned().collect();
        out.sort();
        Ok(out)
    }
}

// ─── JSON file ────────────────────────────────────────────────────────────────

/// On-disk layout: independent symbol-keyed maps. An absent
/// `partial_closed` entry means `false`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    partial_closed: BTreeMap<String, bool>,
    #[serde(default)]
    last_known_size: BTreeMap<String, f64>,
    #[serde(default)]
    plans: BTreeMap<String, PositionPlan>,
    #[serde(default)]
    active_stop: BTreeMap<String, f64>,
}

/// State persisted in one JSON file. Every write goes to a temp file in the
/// same directory and is renamed over the original, so readers never see a
/// torn file. There is no cross-process lock.
#[derive(Clone, Debug)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        JsonFileStore { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<StateFile, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(raw) if raw.trim().is_empty() => Ok(StateFile::default()),
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(StateFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, file: &StateFile) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;

        let mut tmp = NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut tmp, file)?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)?;
        Ok(())
    }
}

impl StateStore for JsonFileStore {
    fn get(&self, symbol: &str) -> Result<Option<PositionState>, StoreError> {
        let file = self.load()?;
        let state = PositionState {
            plan: file.plans.get(symbol).copied(),
            partial_closed: file.partial_closed.get(symbol).copied().unwrap_or(false),
            last_known_size: file.last_known_size.get(symbol).copied(),
            active_stop: file.active_stop.get(symbol).copied(),
        };
        Ok((state != PositionState::default()).then_some(state))
    }

    fn put(&mut self, symbol: &str, state: PositionState) -> Result<(), StoreError> {
        let mut file = self.load()?;
        let key = symbol.to_string();

        if state.partial_closed {
            file.partial_closed.insert(key.clone(), true);
        } else {
            file.partial_closed.remove(&key);
        }
        set_or_remove(&mut file.last_known_size, &key, state.last_known_size);
        set_or_remove(&mut file.plans, &key, state.plan);
        set_or_remove(&mut file.active_stop, &key, state.active_stop);

        self.save(&file)
    }

    fn delete(&mut self, symbol: &str) -> Result<(), StoreError> {
        let mut file = self.load()?;
        let had = file.partial_closed.remove(symbol).is_some()
            | file.last_known_size.remove(symbol).is_some()
            | file.plans.remove(symbol).is_some()
            | file.active_stop.remove(symbol).is_some();
        if had {
            self.save(&file)?;
        }
        Ok(())
    }

    fn symbols(&self) -> Result<Vec<String>, StoreError> {
        let file = self.load()?;
        let all: BTreeSet<String> = file
            .partial_closed
            .keys()
            .chain(file.last_known_size.keys())
            .chain(file.plans.keys())
            .chain(file.active_stop.keys())
            .cloned()
            .collect();
        Ok(all.into_iter().collect())
    }
}

fn set_or_remove<V>(map: &mut BTreeMap<String, V>, key: &str, value: Option<V>) {
    match value {
        Some(v) => {
            map.insert(key.to_string(), v);
        }
        None => {
            map.remove(key);
        }
    }
}
