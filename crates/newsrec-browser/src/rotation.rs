//! Identity rotation: a pure selection function plus pluggable state stores.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::{BrowserError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RotationMode {
    #[default]
    RoundRobin,
    Random,
    Sticky,
}

impl RotationMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" | "roundrobin" => Some(Self::RoundRobin),
            "random" => Some(Self::Random),
            "sticky" => Some(Self::Sticky),
            _ => None,
        }
    }
}

/// Per-pool round-robin counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RotationState {
    #[serde(default)]
    pub counters: BTreeMap<String, u64>,
}

impl RotationState {
    pub fn counter(&self, pool: &str) -> u64 {
        self.counters.get(pool).copied().unwrap_or(0)
    }

    pub fn advance(&mut self, pool: &str) {
        *self.counters.entry(pool.to_string()).or_default() += 1;
    }
}

fn stable_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

/// Picks an index into a pool of `len` identities.
///
/// Sticky mode without a key degrades to round-robin.
pub fn select_index(
    len: usize,
    mode: RotationMode,
    key: Option<&str>,
    counter: u64,
    random: u64,
) -> Option<usize> {
    if len == 0 {
        return None;
    }
    let len64 = len as u64;
    let idx = match (mode, key) {
        (RotationMode::Sticky, Some(key)) => stable_hash(key) % len64,
        (RotationMode::Random, _) => random % len64,
        _ => counter % len64,
    };
    Some(idx as usize)
}

#[async_trait]
pub trait RotationStore: Send + Sync {
    async fn load(&self) -> Result<RotationState>;
    async fn save(&self, state: &RotationState) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct InMemoryRotationStore {
    state: Mutex<RotationState>,
}

#[async_trait]
impl RotationStore for InMemoryRotationStore {
    async fn load(&self) -> Result<RotationState> {
        Ok(self.state.lock().await.clone())
    }

    async fn save(&self, state: &RotationState) -> Result<()> {
        *self.state.lock().await = state.clone();
        Ok(())
    }
}

/// JSON file store; read-then-write without a lock (last writer wins).
#[derive(Debug, Clone)]
pub struct FileRotationStore {
    path: PathBuf,
}

impl FileRotationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RotationStore for FileRotationStore {
    async fn load(&self) -> Result<RotationState> {
        newsrec_storage::read_json_file(&self.path)
            .await
            .map(Option::unwrap_or_default)
            .map_err(|e| BrowserError::RotationState(format!("{e:#}")))
    }

    async fn save(&self, state: &RotationState) -> Result<()> {
        newsrec_storage::write_json_atomic(&self.path, state)
            .await
            .map_err(|e| BrowserError::RotationState(format!("{e:#}")))
    }
}
