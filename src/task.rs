//! Background task state and registry.
//!
//! One task = one upload. The registry lock only guards the id → state
//! map; each task's state is mutated by its single owning worker thread
//! and read concurrently by the status/result handlers, so the per-task
//! `RwLock` is never contended on the write side.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::ocr::OcrBackend;
use crate::table::{FailureRow, ResultRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

/// Running counters surfaced by the status endpoint.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Totals {
    pub tokens: u64,
    #[serde(rename = "identifier-hits")]
    pub identifier_hits: u64,
    #[serde(rename = "specification-hits")]
    pub specification_hits: u64,
    pub failures: u64,
}

/// Mutable state of one background processing run. Never mutated again
/// after reaching `Completed` or `Error`.
#[derive(Debug)]
pub struct TaskState {
    pub status: TaskStatus,
    pub error: Option<String>,
    pub progress: u8,
    pub pages: usize,
    pub totals: Totals,
    pub backend_requested: Option<OcrBackend>,
    /// Provenance label of the last processed document ("text-layer" or a
    /// backend name).
    pub backend_used: Option<String>,
    pub results: Vec<ResultRow>,
    pub failures: Vec<FailureRow>,
    pub results_path: Option<PathBuf>,
    pub failures_path: Option<PathBuf>,
}

impl TaskState {
    fn new() -> Self {
        Self {
            status: TaskStatus::Pending,
            error: None,
            progress: 0,
            pages: 0,
            totals: Totals::default(),
            backend_requested: None,
            backend_used: None,
            results: Vec::new(),
            failures: Vec::new(),
            results_path: None,
            failures_path: None,
        }
    }

    /// Transition to the terminal error state.
    pub fn fail(&mut self, message: String) {
        self.status = TaskStatus::Error;
        self.error = Some(message);
    }
}

pub type SharedTask = Arc<RwLock<TaskState>>;

/// Concurrent-safe id → task map.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<Mutex<HashMap<String, SharedTask>>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh pending task and return its generated id.
    pub fn create(&self) -> (String, SharedTask) {
        let task_id = Uuid::new_v4().to_string();
        let task: SharedTask = Arc::new(RwLock::new(TaskState::new()));
        self.inner
            .lock()
            .unwrap()
            .insert(task_id.clone(), task.clone());
        (task_id, task)
    }

    pub fn get(&self, task_id: &str) -> Option<SharedTask> {
        self.inner.lock().unwrap().get(task_id).cloned()
    }
}

/// Per-task storage directory under the configured root.
pub fn task_dir(storage_root: &Path, task_id: &str) -> PathBuf {
    storage_root.join(task_id)
}

/// Create the storage directory for a task if it does not exist.
pub fn init_task_storage(storage_root: &Path, task_id: &str) -> Result<PathBuf, PipelineError> {
    let dir = task_dir(storage_root, task_id);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Convert a (total, current) pair into a clamped percentage.
pub fn to_progress(total: usize, current: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((current as f64 / total as f64) * 100.0).min(100.0) as u8
}
