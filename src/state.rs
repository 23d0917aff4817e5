//! Durable workflow state: phase machine, task checkpoints, atomic persistence.
//!
//! State is a resumability aid, never the sole source of truth for an
//! in-flight execution: a missing, empty, or corrupt state file loads as the
//! default state instead of failing.

use anyhow::Context;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex};

use crate::errors::StateError;

/// Workflow phases. Transitions between them are restricted to
/// [`valid_targets`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Specification,
    AwaitingSpecValidation,
    Implementation,
    Qa,
    AwaitingQaValidation,
    Pr,
    Completed,
    Failed,
    Rejected,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Specification => "specification",
            Phase::AwaitingSpecValidation => "awaiting_spec_validation",
            Phase::Implementation => "implementation",
            Phase::Qa => "qa",
            Phase::AwaitingQaValidation => "awaiting_qa_validation",
            Phase::Pr => "pr",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
            Phase::Rejected => "rejected",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(value.to_string())).ok()
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution order of the active phases, used to decide which phases a
/// resumed workflow may skip.
pub const PHASE_ORDER: [Phase; 6] = [
    Phase::Specification,
    Phase::AwaitingSpecValidation,
    Phase::Implementation,
    Phase::Qa,
    Phase::AwaitingQaValidation,
    Phase::Pr,
];

/// Valid transition targets for each phase.
///
/// `Idle` may enter any active phase directly so an interrupted workflow can
/// resume mid-sequence (failed/rejected -> idle -> resume point).
pub fn valid_targets(from: Phase) -> &'static [Phase] {
    match from {
        Phase::Idle => &[
            Phase::Specification,
            Phase::AwaitingSpecValidation,
            Phase::Implementation,
            Phase::Qa,
            Phase::AwaitingQaValidation,
            Phase::Pr,
        ],
        Phase::Specification => &[Phase::AwaitingSpecValidation, Phase::Failed],
        Phase::AwaitingSpecValidation => &[Phase::Implementation, Phase::Rejected],
        Phase::Implementation => &[Phase::Qa, Phase::Failed],
        Phase::Qa => &[Phase::AwaitingQaValidation, Phase::Failed],
        Phase::AwaitingQaValidation => &[Phase::Pr, Phase::Rejected],
        Phase::Pr => &[Phase::Completed, Phase::Failed],
        Phase::Completed => &[],
        Phase::Failed => &[Phase::Idle],
        Phase::Rejected => &[Phase::Idle],
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Task checkpoint status. Marking a task completed clears any in-progress
/// marker; the two are mutually exclusive per write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStatus {
    Completed,
    InProgress,
}

/// Persisted workflow state. Serialized as a flat field list so the document
/// round-trips losslessly, including null optional fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub phase: Phase,
    pub status: Status,
    pub started_at: Option<String>,
    pub tasks_completed: u32,
    pub tasks_total: u32,
    pub error_message: Option<String>,
    // Informational mirror of the last execution's circuit breaker.
    pub circuit_breaker_state: String,
    pub circuit_breaker_attempts: u32,
    pub circuit_breaker_last_trigger: Option<String>,
    // Resume markers.
    pub last_completed_phase: Option<String>,
    pub last_completed_task_id: Option<String>,
    pub last_in_progress_task_id: Option<String>,
    pub task_checkpoint_time: Option<String>,
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            status: Status::Pending,
            started_at: None,
            tasks_completed: 0,
            tasks_total: 0,
            error_message: None,
            circuit_breaker_state: "closed".into(),
            circuit_breaker_attempts: 0,
            circuit_breaker_last_trigger: None,
            last_completed_phase: None,
            last_completed_task_id: None,
            last_in_progress_task_id: None,
            task_checkpoint_time: None,
        }
    }
}

static FEATURE_NAME_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]*$").unwrap());

/// Reject feature names that could escape the project directory.
pub fn validate_feature_name(name: &str) -> Result<(), StateError> {
    let reject = |reason: &str| {
        Err(StateError::InvalidFeatureName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };
    if name.contains("..") {
        return reject("contains '..'");
    }
    if name.contains('/') {
        return reject("contains '/'");
    }
    if name.contains('\\') {
        return reject("contains '\\'");
    }
    if !FEATURE_NAME_RE.is_match(name) {
        return reject(
            "must start with an alphanumeric and contain only alphanumerics, hyphens, or underscores",
        );
    }
    Ok(())
}

/// Thread-safe store for [`WorkflowState`] with atomic file persistence.
///
/// Only the snapshot-and-stringify step runs under the lock; the actual file
/// write and rename happen outside it, so concurrent saves do not serialize
/// their disk I/O. Each write goes to a temp file unique per process and
/// thread, then renames over the canonical file (last rename wins).
#[derive(Debug)]
pub struct StateStore {
    state_file: PathBuf,
    inner: Mutex<WorkflowState>,
}

impl StateStore {
    /// Open the store for a feature, loading existing state if present.
    ///
    /// The state file lives at `docs/features/<name>/.waypoint/state.json`.
    pub fn open(project_dir: &Path, feature_name: &str) -> Result<Self, StateError> {
        validate_feature_name(feature_name)?;
        let state_file = crate::config::feature_dir(project_dir, feature_name)
            .join(".waypoint")
            .join("state.json");
        let state = Self::load_from(&state_file);
        Ok(Self {
            state_file,
            inner: Mutex::new(state),
        })
    }

    /// Open a store backed by an explicit file path. Used by tests and by
    /// tools that inspect state outside a feature directory.
    pub fn at_path(state_file: PathBuf) -> Self {
        let state = Self::load_from(&state_file);
        Self {
            state_file,
            inner: Mutex::new(state),
        }
    }

    fn load_from(path: &Path) -> WorkflowState {
        let Ok(content) = std::fs::read_to_string(path) else {
            return WorkflowState::default();
        };
        if content.trim().is_empty() {
            return WorkflowState::default();
        }
        match serde_json::from_str(&content) {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "corrupt state file, using defaults");
                WorkflowState::default()
            }
        }
    }

    /// Snapshot of the current state.
    pub fn state(&self) -> WorkflowState {
        self.inner.lock().expect("state lock poisoned").clone()
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    /// Serialize under the lock, then write and rename outside it.
    pub fn save(&self) -> Result<(), StateError> {
        let document = {
            let state = self.inner.lock().expect("state lock poisoned");
            serde_json::to_string_pretty(&*state)
                .context("Failed to serialize workflow state")?
        };
        self.write_atomic(&document)
    }

    fn write_atomic(&self, document: &str) -> Result<(), StateError> {
        if let Some(parent) = self.state_file.parent() {
            std::fs::create_dir_all(parent).map_err(|source| StateError::PersistFailed {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let suffix = format!(
            ".{}.{:?}.tmp",
            std::process::id(),
            std::thread::current().id()
        );
        let mut temp_name = self.state_file.as_os_str().to_os_string();
        temp_name.push(suffix);
        let temp_file = PathBuf::from(temp_name);

        let result = std::fs::write(&temp_file, document)
            .and_then(|_| std::fs::rename(&temp_file, &self.state_file));
        if let Err(source) = result {
            let _ = std::fs::remove_file(&temp_file);
            return Err(StateError::PersistFailed {
                path: self.state_file.clone(),
                source,
            });
        }
        Ok(())
    }

    fn mutate_and_save<F>(&self, mutate: F) -> Result<(), StateError>
    where
        F: FnOnce(&mut WorkflowState),
    {
        let document = {
            let mut state = self.inner.lock().expect("state lock poisoned");
            mutate(&mut state);
            serde_json::to_string_pretty(&*state)
                .context("Failed to serialize workflow state")?
        };
        self.write_atomic(&document)
    }

    /// Whether moving to `target` is allowed from the current phase.
    pub fn can_transition(&self, target: Phase) -> bool {
        let current = self.inner.lock().expect("state lock poisoned").phase;
        valid_targets(current).contains(&target)
    }

    /// Transition to `target` if the table allows it, persisting the new
    /// phase and status together. Returns false (state unchanged) otherwise.
    pub fn transition(&self, target: Phase) -> Result<bool, StateError> {
        let document = {
            let mut state = self.inner.lock().expect("state lock poisoned");
            if !valid_targets(state.phase).contains(&target) {
                return Ok(false);
            }
            state.phase = target;
            state.status = match target {
                Phase::Completed
                | Phase::Failed
                | Phase::Rejected
                | Phase::AwaitingSpecValidation
                | Phase::AwaitingQaValidation => Status::Pending,
                _ => Status::Running,
            };
            if target == Phase::Specification {
                state.started_at = Some(Utc::now().to_rfc3339());
            }
            serde_json::to_string_pretty(&*state)
                .context("Failed to serialize workflow state")?
        };
        self.write_atomic(&document)?;
        Ok(true)
    }

    /// Mark the workflow failed, recording the originating message.
    pub fn set_failed(&self, message: Option<&str>) -> Result<(), StateError> {
        self.mutate_and_save(|state| {
            state.phase = Phase::Failed;
            state.status = Status::Failed;
            state.error_message = message.map(str::to_string);
        })
    }

    pub fn update_tasks(&self, completed: u32, total: u32) -> Result<(), StateError> {
        self.mutate_and_save(|state| {
            state.tasks_completed = completed;
            state.tasks_total = total;
        })
    }

    /// Record a phase as completed. Preserved across failures so a later run
    /// can compute its resume point.
    pub fn mark_phase_completed(&self, phase: Phase) -> Result<(), StateError> {
        self.mutate_and_save(|state| {
            state.last_completed_phase = Some(phase.as_str().to_string());
        })
    }

    /// Persist a per-task checkpoint.
    pub fn checkpoint_task(
        &self,
        task_id: &str,
        status: CheckpointStatus,
    ) -> Result<(), StateError> {
        self.mutate_and_save(|state| {
            match status {
                CheckpointStatus::Completed => {
                    state.last_completed_task_id = Some(task_id.to_string());
                    state.last_in_progress_task_id = None;
                }
                CheckpointStatus::InProgress => {
                    state.last_in_progress_task_id = Some(task_id.to_string());
                }
            }
            state.task_checkpoint_time = Some(Utc::now().to_rfc3339());
        })
    }

    /// Task to resume from: an interrupted in-progress task is redone, else
    /// the caller looks for the next pending task after the last completed
    /// one, else None to start from the beginning.
    pub fn get_resume_task_id(&self) -> Option<String> {
        let state = self.inner.lock().expect("state lock poisoned");
        state
            .last_in_progress_task_id
            .clone()
            .or_else(|| state.last_completed_task_id.clone())
    }

    /// Clear task checkpoints at phase boundaries.
    pub fn clear_task_checkpoints(&self) -> Result<(), StateError> {
        self.mutate_and_save(|state| {
            state.last_completed_task_id = None;
            state.last_in_progress_task_id = None;
            state.task_checkpoint_time = None;
        })
    }

    /// Mirror the circuit breaker summary of the most recent execution.
    pub fn record_breaker(
        &self,
        breaker_state: &str,
        attempts: u32,
        last_trigger: Option<&str>,
    ) -> Result<(), StateError> {
        self.mutate_and_save(|state| {
            state.circuit_breaker_state = breaker_state.to_string();
            state.circuit_breaker_attempts = attempts;
            state.circuit_breaker_last_trigger = last_trigger.map(str::to_string);
        })
    }

    /// Reset to defaults. The state is never deleted, only reset.
    pub fn reset(&self) -> Result<(), StateError> {
        self.mutate_and_save(|state| *state = WorkflowState::default())
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.state().phase,
            Phase::Specification | Phase::Implementation | Phase::Qa | Phase::Pr
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_store() -> (StateStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = StateStore::at_path(dir.path().join("state.json"));
        (store, dir)
    }

    #[test]
    fn transition_table_is_exhaustive() {
        // Every (from, to) pair either succeeds and sets the phase, or fails
        // and leaves it unchanged, exactly per the table.
        let all = [
            Phase::Idle,
            Phase::Specification,
            Phase::AwaitingSpecValidation,
            Phase::Implementation,
            Phase::Qa,
            Phase::AwaitingQaValidation,
            Phase::Pr,
            Phase::Completed,
            Phase::Failed,
            Phase::Rejected,
        ];
        for from in all {
            for to in all {
                let dir = tempdir().unwrap();
                let store = StateStore::at_path(dir.path().join("state.json"));
                {
                    let mut state = store.inner.lock().unwrap();
                    state.phase = from;
                }
                let allowed = valid_targets(from).contains(&to);
                assert_eq!(store.can_transition(to), allowed);
                let moved = store.transition(to).unwrap();
                assert_eq!(moved, allowed, "{from} -> {to}");
                let now = store.state().phase;
                if allowed {
                    assert_eq!(now, to);
                } else {
                    assert_eq!(now, from);
                }
            }
        }
    }

    #[test]
    fn idle_allows_resume_into_any_active_phase() {
        for target in PHASE_ORDER {
            let (store, _dir) = make_store();
            assert!(store.transition(target).unwrap(), "idle -> {target}");
        }
    }

    #[test]
    fn completed_is_terminal() {
        let (store, _dir) = make_store();
        assert!(store.transition(Phase::Specification).unwrap());
        {
            let mut state = store.inner.lock().unwrap();
            state.phase = Phase::Completed;
        }
        assert!(!store.transition(Phase::Idle).unwrap());
        assert!(!store.transition(Phase::Specification).unwrap());
    }

    #[test]
    fn transition_sets_status_and_started_at() {
        let (store, _dir) = make_store();
        assert!(store.transition(Phase::Specification).unwrap());
        let state = store.state();
        assert_eq!(state.status, Status::Running);
        assert!(state.started_at.is_some());

        assert!(store.transition(Phase::AwaitingSpecValidation).unwrap());
        assert_eq!(store.state().status, Status::Pending);
    }

    #[test]
    fn state_roundtrips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::at_path(path.clone());
        store.transition(Phase::Specification).unwrap();
        store
            .checkpoint_task("1.3", CheckpointStatus::InProgress)
            .unwrap();
        store.update_tasks(2, 9).unwrap();
        let before = store.state();

        let reloaded = StateStore::at_path(path);
        assert_eq!(reloaded.state(), before);
    }

    #[test]
    fn roundtrip_preserves_null_optional_fields() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::at_path(path.clone());
        store.save().unwrap();

        let reloaded = StateStore::at_path(path);
        let state = reloaded.state();
        assert_eq!(state, WorkflowState::default());
        assert!(state.started_at.is_none());
        assert!(state.error_message.is_none());
        assert!(state.last_completed_phase.is_none());
    }

    #[test]
    fn load_tolerates_missing_empty_and_corrupt_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = StateStore::at_path(path.clone());
        assert_eq!(store.state(), WorkflowState::default());

        std::fs::write(&path, "").unwrap();
        let store = StateStore::at_path(path.clone());
        assert_eq!(store.state(), WorkflowState::default());

        std::fs::write(&path, "{not json").unwrap();
        let store = StateStore::at_path(path);
        assert_eq!(store.state(), WorkflowState::default());
    }

    #[test]
    fn checkpoint_completed_clears_in_progress() {
        let (store, _dir) = make_store();
        store
            .checkpoint_task("1.2", CheckpointStatus::InProgress)
            .unwrap();
        store
            .checkpoint_task("1.2", CheckpointStatus::Completed)
            .unwrap();
        let state = store.state();
        assert_eq!(state.last_completed_task_id.as_deref(), Some("1.2"));
        assert!(state.last_in_progress_task_id.is_none());
        assert!(state.task_checkpoint_time.is_some());
    }

    #[test]
    fn resume_task_prefers_in_progress() {
        let (store, _dir) = make_store();
        store
            .checkpoint_task("1.2", CheckpointStatus::Completed)
            .unwrap();
        assert_eq!(store.get_resume_task_id().as_deref(), Some("1.2"));

        store
            .checkpoint_task("1.3", CheckpointStatus::InProgress)
            .unwrap();
        assert_eq!(store.get_resume_task_id().as_deref(), Some("1.3"));
    }

    #[test]
    fn resume_task_none_without_checkpoints() {
        let (store, _dir) = make_store();
        assert!(store.get_resume_task_id().is_none());
    }

    #[test]
    fn clear_task_checkpoints_removes_all_markers() {
        let (store, _dir) = make_store();
        store
            .checkpoint_task("2.1", CheckpointStatus::InProgress)
            .unwrap();
        store.clear_task_checkpoints().unwrap();
        let state = store.state();
        assert!(state.last_completed_task_id.is_none());
        assert!(state.last_in_progress_task_id.is_none());
        assert!(state.task_checkpoint_time.is_none());
    }

    #[test]
    fn save_is_idempotent_byte_for_byte() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::at_path(path.clone());
        store.transition(Phase::Specification).unwrap();

        store.save().unwrap();
        let first = std::fs::read(&path).unwrap();
        store.save().unwrap();
        let second = std::fs::read(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn set_failed_records_message() {
        let (store, _dir) = make_store();
        store.transition(Phase::Specification).unwrap();
        store.set_failed(Some("agent exploded")).unwrap();
        let state = store.state();
        assert_eq!(state.phase, Phase::Failed);
        assert_eq!(state.status, Status::Failed);
        assert_eq!(state.error_message.as_deref(), Some("agent exploded"));
    }

    #[test]
    fn reset_returns_defaults_but_keeps_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::at_path(path.clone());
        store.transition(Phase::Specification).unwrap();
        store.reset().unwrap();
        assert_eq!(store.state(), WorkflowState::default());
        assert!(path.exists());
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = StateStore::at_path(path);
        store.save().unwrap();
        store.save().unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn feature_names_are_validated() {
        assert!(validate_feature_name("login-form").is_ok());
        assert!(validate_feature_name("feature_2").is_ok());
        assert!(validate_feature_name("../escape").is_err());
        assert!(validate_feature_name("a/b").is_err());
        assert!(validate_feature_name("a\\b").is_err());
        assert!(validate_feature_name("-leading").is_err());
        assert!(validate_feature_name("").is_err());
    }

    #[test]
    fn open_rejects_bad_feature_name() {
        let dir = tempdir().unwrap();
        let err = StateStore::open(dir.path(), "../../etc").unwrap_err();
        assert!(matches!(err, StateError::InvalidFeatureName { .. }));
    }

    #[test]
    fn phase_parse_matches_serialization() {
        assert_eq!(
            Phase::parse("awaiting_spec_validation"),
            Some(Phase::AwaitingSpecValidation)
        );
        assert_eq!(Phase::parse("qa"), Some(Phase::Qa));
        assert_eq!(Phase::parse("bogus"), None);
    }
}
