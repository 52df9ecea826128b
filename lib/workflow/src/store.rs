//! Persistence of execution states.
//!
//! The runner persists the whole state at every workflow transition and
//! merges node records at every node transition. Stores must accept a
//! repeated terminal node write without changing anything.

use crate::error::{StateError, StoreError};
use crate::execution::{ExecutionState, NodeUpdate};
use crate::node::NodeId;
use async_trait::async_trait;
use rootcause::prelude::Report;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use strata_core::DispatchId;
use tokio::sync::Mutex;
use tracing::debug;

/// Storage for execution states, keyed by dispatch id.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Writes the full state, replacing any previous version.
    async fn persist(&self, state: &ExecutionState) -> Result<(), Report<StoreError>>;

    /// Reads a state.
    async fn load(&self, dispatch_id: &DispatchId) -> Result<ExecutionState, Report<StoreError>>;

    /// Merges an update into one node record of a stored state.
    ///
    /// Returns whether the record changed; a repeated terminal write returns
    /// `false`.
    async fn update_node_record(
        &self,
        dispatch_id: &DispatchId,
        node_id: NodeId,
        update: NodeUpdate,
    ) -> Result<bool, Report<StoreError>>;

    /// Removes a state and every state nested under it.
    ///
    /// Returns false if the state itself was not stored.
    async fn delete(&self, dispatch_id: &DispatchId) -> Result<bool, Report<StoreError>>;
}

fn apply_update(
    state: &mut ExecutionState,
    node_id: NodeId,
    update: NodeUpdate,
) -> Result<bool, StoreError> {
    state
        .update_node(node_id, update)
        .map_err(|e: StateError| StoreError::Rejected {
            reason: e.to_string(),
        })
}

/// Keeps states in process memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    states: Arc<RwLock<HashMap<DispatchId, ExecutionState>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored states.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn persist(&self, state: &ExecutionState) -> Result<(), Report<StoreError>> {
        self.states
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(state.dispatch_id.clone(), state.clone());
        Ok(())
    }

    async fn load(&self, dispatch_id: &DispatchId) -> Result<ExecutionState, Report<StoreError>> {
        self.states
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(dispatch_id)
            .cloned()
            .ok_or_else(|| {
                StoreError::NotFound {
                    dispatch_id: dispatch_id.clone(),
                }
                .into()
            })
    }

    async fn update_node_record(
        &self,
        dispatch_id: &DispatchId,
        node_id: NodeId,
        update: NodeUpdate,
    ) -> Result<bool, Report<StoreError>> {
        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        let state = states.get_mut(dispatch_id).ok_or_else(|| StoreError::NotFound {
            dispatch_id: dispatch_id.clone(),
        })?;
        Ok(apply_update(state, node_id, update)?)
    }

    async fn delete(&self, dispatch_id: &DispatchId) -> Result<bool, Report<StoreError>> {
        let mut states = self.states.write().unwrap_or_else(PoisonError::into_inner);
        let existed = states.contains_key(dispatch_id);
        states.retain(|id, _| !id.is_within(dispatch_id));
        Ok(existed)
    }
}

/// Version of the on-disk document format.
const CURRENT_VERSION: u32 = 1;

/// On-disk document: a version header around the state.
#[derive(Serialize)]
struct Envelope<'a> {
    version: u32,
    payload: &'a ExecutionState,
}

/// A document read back before its version is checked.
#[derive(Deserialize)]
struct RawEnvelope {
    version: u32,
    payload: serde_json::Value,
}

/// Keeps one JSON document per dispatch in a directory.
///
/// Nested dispatches get their own documents. Writes go to a temporary file
/// that is renamed over the target.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    writes: Arc<Mutex<()>>,
}

impl FileStore {
    /// Creates a store in `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Io` if the directory can't be created.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, Report<StoreError>> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await.map_err(io_error)?;
        Ok(Self {
            dir,
            writes: Arc::new(Mutex::new(())),
        })
    }

    /// The directory holding the documents.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, dispatch_id: &DispatchId) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(dispatch_id)))
    }

    async fn read(&self, dispatch_id: &DispatchId) -> Result<ExecutionState, Report<StoreError>> {
        let bytes = match tokio::fs::read(self.path_for(dispatch_id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    dispatch_id: dispatch_id.clone(),
                }
                .into());
            }
            Err(e) => return Err(io_error(e).into()),
        };
        let raw: RawEnvelope = serde_json::from_slice(&bytes).map_err(serialization_error)?;
        if raw.version != CURRENT_VERSION {
            return Err(StoreError::UnsupportedVersion {
                version: raw.version,
            }
            .into());
        }
        Ok(serde_json::from_value(raw.payload).map_err(serialization_error)?)
    }

    async fn write(&self, state: &ExecutionState) -> Result<(), Report<StoreError>> {
        let bytes = serde_json::to_vec_pretty(&Envelope {
            version: CURRENT_VERSION,
            payload: state,
        })
        .map_err(serialization_error)?;
        let path = self.path_for(&state.dispatch_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, bytes).await.map_err(io_error)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_error)?;
        debug!(dispatch_id = %state.dispatch_id, path = %path.display(), "state written");
        Ok(())
    }
}

fn file_stem(dispatch_id: &DispatchId) -> String {
    dispatch_id.to_string().replace(':', ".")
}

fn io_error(e: std::io::Error) -> StoreError {
    StoreError::Io {
        message: e.to_string(),
    }
}

fn serialization_error(e: serde_json::Error) -> StoreError {
    StoreError::Serialization {
        message: e.to_string(),
    }
}

#[async_trait]
impl StateStore for FileStore {
    async fn persist(&self, state: &ExecutionState) -> Result<(), Report<StoreError>> {
        let _guard = self.writes.lock().await;
        self.write(state).await
    }

    async fn load(&self, dispatch_id: &DispatchId) -> Result<ExecutionState, Report<StoreError>> {
        self.read(dispatch_id).await
    }

    async fn update_node_record(
        &self,
        dispatch_id: &DispatchId,
        node_id: NodeId,
        update: NodeUpdate,
    ) -> Result<bool, Report<StoreError>> {
        let _guard = self.writes.lock().await;
        let mut state = self.read(dispatch_id).await?;
        if !apply_update(&mut state, node_id, update)? {
            return Ok(false);
        }
        self.write(&state).await?;
        Ok(true)
    }

    async fn delete(&self, dispatch_id: &DispatchId) -> Result<bool, Report<StoreError>> {
        let _guard = self.writes.lock().await;
        let existed = match tokio::fs::remove_file(self.path_for(dispatch_id)).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(io_error(e).into()),
        };

        let nested_prefix = format!("{}.", file_stem(dispatch_id));
        let mut entries = tokio::fs::read_dir(&self.dir).await.map_err(io_error)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with(&nested_prefix) && name.ends_with(".json") {
                tokio::fs::remove_file(entry.path()).await.map_err(io_error)?;
            }
        }
        Ok(existed)
    }
}
