//! Workflow orchestrator: sequences the agent phases, the validation gates,
//! and the durable state transitions, with resume support.
//!
//! Phase order: specification → spec validation → implementation → QA →
//! QA validation → PR → completed. A failed or rejected run can resume:
//! the resume point is derived from the last completed phase plus artifact
//! checks, phases strictly before it are skipped, and the resume-point
//! phase itself re-executes.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::agent::dev::{DevAgent, TaskEvent, detect_task_event};
use crate::agent::pr::PrAgent;
use crate::agent::qa::QaAgent;
use crate::agent::spec::SpecAgent;
use crate::agent::{AgentContext, AgentResult, RunOptions, run_agent};
use crate::config::{ProjectConfig, feature_dir, waypoint_dir};
use crate::errors::WorkflowError;
use crate::reader::OutputHook;
use crate::runner::AbortRegistry;
use crate::state::{CheckpointStatus, PHASE_ORDER, Phase, StateStore, validate_feature_name};
use crate::stream::TokenUsage;
use crate::validation::HumanValidator;

/// Artifact size floors; smaller files are treated as absent on resume.
const MIN_SPEC_FILE_BYTES: u64 = 1000;
const MIN_TASKS_FILE_BYTES: u64 = 200;
const MIN_QA_REPORT_FILE_BYTES: u64 = 500;

pub struct Orchestrator {
    project_dir: PathBuf,
    feature_name: String,
    feature_dir: PathBuf,
    config: ProjectConfig,
    store: Arc<StateStore>,
    validator: HumanValidator,
    registry: AbortRegistry,
    ctx: AgentContext,
}

impl Orchestrator {
    pub fn new(
        project_dir: &Path,
        feature_name: &str,
        auto_approve: bool,
    ) -> Result<Self, WorkflowError> {
        validate_feature_name(feature_name)?;
        let config = ProjectConfig::load(project_dir).map_err(WorkflowError::Other)?;
        let store = StateStore::open(project_dir, feature_name)?;
        let feature = feature_dir(project_dir, feature_name);
        let mut ctx = AgentContext::new(project_dir, &feature, config.clone());
        ctx.on_usage = Some(Arc::new(|usage: &TokenUsage, cost: f64| {
            let context_used = format!("{:.1}%", usage.context_utilization());
            tracing::debug!(
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                %context_used,
                cost_usd = cost,
                "token usage"
            );
        }));
        Ok(Self {
            project_dir: project_dir.to_path_buf(),
            feature_name: feature_name.to_string(),
            feature_dir: feature,
            config,
            store: Arc::new(store),
            validator: HumanValidator::new(auto_approve),
            registry: AbortRegistry::default(),
            ctx,
        })
    }

    /// Handle for cancelling whatever agent invocation is in flight.
    pub fn abort_registry(&self) -> AbortRegistry {
        self.registry.clone()
    }

    pub fn state_store(&self) -> &StateStore {
        &self.store
    }

    /// Override the agent CLI binary. Used by tests with a stub executable.
    pub fn set_agent_binary(&mut self, binary: impl Into<String>) {
        self.ctx.binary = binary.into();
    }

    /// Cancel the in-flight invocation and mark the workflow failed.
    pub fn abort(&self) -> Result<(), WorkflowError> {
        self.registry.abort();
        self.store.set_failed(Some("Aborted by user"))?;
        Ok(())
    }

    /// Run the workflow to completion. `fresh` forbids resume. Returns
    /// Ok(true) on full success, Ok(false) on a phase failure or a rejected
    /// validation (state already records why).
    pub async fn run(&self, fresh: bool) -> Result<bool, WorkflowError> {
        // Prerequisite failures must not clobber the stored state.
        self.validate_prerequisites()?;
        std::fs::create_dir_all(waypoint_dir(&self.project_dir))
            .map_err(|err| WorkflowError::Other(err.into()))?;
        std::fs::create_dir_all(&self.feature_dir)
            .map_err(|err| WorkflowError::Other(err.into()))?;

        match self.run_phases(fresh).await {
            Ok(done) => Ok(done),
            Err(err) => {
                if let Err(save_err) = self.store.set_failed(Some(&err.to_string())) {
                    tracing::error!(%save_err, "failed to record workflow failure");
                }
                Err(err)
            }
        }
    }

    async fn run_phases(&self, fresh: bool) -> Result<bool, WorkflowError> {
        let mut resume_phase = None;
        if matches!(self.store.state().phase, Phase::Failed | Phase::Rejected) {
            if !fresh {
                resume_phase = self.determine_resume_phase();
                if let Some(phase) = resume_phase {
                    tracing::info!(%phase, "resuming workflow");
                }
            }
            self.safe_transition(Phase::Idle)?;
        }

        if !self.should_skip(Phase::Specification, resume_phase) {
            if !self.run_specification_phase().await? {
                return Ok(false);
            }
            self.store.mark_phase_completed(Phase::Specification)?;
        } else {
            tracing::info!("specification already completed, skipping");
            self.restore_task_count()?;
        }

        if !self.should_skip(Phase::AwaitingSpecValidation, resume_phase) {
            if !self.run_spec_validation()? {
                return Ok(false);
            }
            self.store
                .mark_phase_completed(Phase::AwaitingSpecValidation)?;
        } else {
            tracing::info!("specification already validated, skipping");
        }

        if !self.should_skip(Phase::Implementation, resume_phase) {
            if !self.run_implementation_phase().await? {
                return Ok(false);
            }
            self.store.mark_phase_completed(Phase::Implementation)?;
        } else {
            tracing::info!("implementation already completed, skipping");
        }

        if !self.should_skip(Phase::Qa, resume_phase) {
            if !self.run_qa_phase().await? {
                return Ok(false);
            }
            self.store.mark_phase_completed(Phase::Qa)?;
        } else {
            tracing::info!("QA already completed, skipping");
        }

        if !self.should_skip(Phase::AwaitingQaValidation, resume_phase) {
            if !self.run_qa_validation()? {
                return Ok(false);
            }
            self.store
                .mark_phase_completed(Phase::AwaitingQaValidation)?;
        } else {
            tracing::info!("QA already validated, skipping");
        }

        if !self.should_skip(Phase::Pr, resume_phase) {
            if !self.run_pr_phase().await? {
                return Ok(false);
            }
            self.store.mark_phase_completed(Phase::Pr)?;
        }

        self.safe_transition(Phase::Completed)?;
        tracing::info!(feature = %self.feature_name, "workflow completed");
        Ok(true)
    }

    fn validate_prerequisites(&self) -> Result<(), WorkflowError> {
        if !self.feature_dir.join("PRD.md").exists() {
            return Err(WorkflowError::MissingPrd(self.feature_dir.clone()));
        }
        if self.store.is_running() {
            return Err(WorkflowError::AlreadyRunning);
        }
        Ok(())
    }

    fn safe_transition(&self, target: Phase) -> Result<(), WorkflowError> {
        let from = self.store.state().phase;
        if !self.store.transition(target)? {
            return Err(crate::errors::StateError::InvalidTransition {
                from: from.as_str().to_string(),
                to: target.as_str().to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn options(&self, phase: Phase, timeout_secs: u64, model: &str) -> RunOptions {
        RunOptions {
            phase,
            timeout: Duration::from_secs(timeout_secs),
            model: Some(model.to_string()),
            registry: Some(self.registry.clone()),
        }
    }

    /// Mirror the breaker summary, then persist a failure if there is one.
    /// Returns whether the phase succeeded.
    fn settle_phase(&self, result: &AgentResult) -> Result<bool, WorkflowError> {
        if let Some(snapshot) = &result.breaker {
            self.store.record_breaker(
                &snapshot.state,
                snapshot.attempts,
                snapshot.last_trigger.as_deref(),
            )?;
        }
        if !result.success {
            self.store.set_failed(result.error.as_deref())?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn run_specification_phase(&self) -> Result<bool, WorkflowError> {
        self.safe_transition(Phase::Specification)?;
        let result = run_agent(
            &SpecAgent,
            &self.ctx,
            self.options(
                Phase::Specification,
                self.config.timeouts.specification,
                &self.config.models.specification,
            ),
        )
        .await;
        if !self.settle_phase(&result)? {
            return Ok(false);
        }

        let tasks_total = SpecAgent::count_tasks(&self.ctx);
        self.store.update_tasks(0, tasks_total)?;
        self.store.clear_task_checkpoints()?;
        Ok(true)
    }

    fn run_spec_validation(&self) -> Result<bool, WorkflowError> {
        self.safe_transition(Phase::AwaitingSpecValidation)?;
        let tasks_total = self.store.state().tasks_total;
        let approved = self
            .validator
            .request_spec_validation(&self.feature_dir, tasks_total)?;
        if !approved {
            self.safe_transition(Phase::Rejected)?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn run_implementation_phase(&self) -> Result<bool, WorkflowError> {
        let resume_task = self.get_implementation_resume_task();
        if let Some(task_id) = &resume_task {
            tracing::info!(task_id, "resuming implementation from checkpoint");
        }

        self.safe_transition(Phase::Implementation)?;
        let agent = match resume_task {
            Some(task_id) => DevAgent::resuming_from(task_id),
            None => DevAgent::default(),
        };
        // Checkpoint tasks as the agent announces them so an interrupted
        // run knows where to pick up.
        let mut ctx = self.ctx.clone();
        ctx.on_output = Some(task_checkpoint_hook(Arc::clone(&self.store)));
        let result = run_agent(
            &agent,
            &ctx,
            self.options(
                Phase::Implementation,
                self.config.timeouts.implementation,
                &self.config.models.implementation,
            ),
        )
        .await;
        if !self.settle_phase(&result)? {
            return Ok(false);
        }

        let (completed, total) = DevAgent::count_task_status(&self.ctx);
        self.store.update_tasks(completed, total)?;
        Ok(true)
    }

    async fn run_qa_phase(&self) -> Result<bool, WorkflowError> {
        self.safe_transition(Phase::Qa)?;
        let result = run_agent(
            &QaAgent,
            &self.ctx,
            self.options(Phase::Qa, self.config.timeouts.qa, &self.config.models.qa),
        )
        .await;
        self.settle_phase(&result)
    }

    fn run_qa_validation(&self) -> Result<bool, WorkflowError> {
        self.safe_transition(Phase::AwaitingQaValidation)?;
        // Re-parsed from the report file so a resumed run has a summary.
        let summary = QaAgent::report_summary(&self.ctx);
        let approved = self
            .validator
            .request_qa_validation(&self.feature_dir, &summary)?;
        if !approved {
            self.safe_transition(Phase::Rejected)?;
            return Ok(false);
        }
        Ok(true)
    }

    async fn run_pr_phase(&self) -> Result<bool, WorkflowError> {
        self.safe_transition(Phase::Pr)?;
        let agent = PrAgent::new(&self.feature_name);
        let result = run_agent(
            &agent,
            &self.ctx,
            self.options(Phase::Pr, self.config.timeouts.pr, &self.config.models.pr),
        )
        .await;
        if !self.settle_phase(&result)? {
            return Ok(false);
        }
        for file in &result.files_generated {
            if file.starts_with("PR:") {
                tracing::info!(%file, "pull request created");
            }
        }
        Ok(true)
    }

    /// Phase to resume at, derived from the last completed phase when its
    /// required artifacts still look real. None means start over.
    fn determine_resume_phase(&self) -> Option<Phase> {
        let last = self.store.state().last_completed_phase?;
        let completed = Phase::parse(&last)?;
        let next = match completed {
            Phase::Specification if self.spec_artifacts_valid() => Phase::AwaitingSpecValidation,
            Phase::AwaitingSpecValidation if self.spec_artifacts_valid() => Phase::Implementation,
            Phase::Implementation if self.spec_artifacts_valid() => Phase::Qa,
            Phase::Qa if self.spec_artifacts_valid() && self.qa_artifacts_valid() => {
                Phase::AwaitingQaValidation
            }
            Phase::AwaitingQaValidation
                if self.spec_artifacts_valid() && self.qa_artifacts_valid() =>
            {
                Phase::Pr
            }
            _ => return None,
        };
        Some(next)
    }

    /// Phases strictly before the resume point are skipped; the resume-point
    /// phase itself re-executes.
    fn should_skip(&self, phase: Phase, resume_from: Option<Phase>) -> bool {
        let Some(resume) = resume_from else {
            return false;
        };
        let index = |p: Phase| PHASE_ORDER.iter().position(|&candidate| candidate == p);
        match (index(phase), index(resume)) {
            (Some(phase_idx), Some(resume_idx)) => phase_idx < resume_idx,
            _ => false,
        }
    }

    /// When the specification phase is skipped on resume, restore the task
    /// counters from TASKS.md.
    fn restore_task_count(&self) -> Result<(), WorkflowError> {
        let (completed, total) = DevAgent::count_task_status(&self.ctx);
        if total > 0 {
            self.store.update_tasks(completed, total)?;
        }
        Ok(())
    }

    /// Task id the implementation phase should resume from, or None to run
    /// from the top. An interrupted in-progress task is redone; a completed
    /// checkpoint advances to the next not-completed task. With no stored
    /// checkpoint, an `in_progress` marker left in TASKS.md serves as one.
    fn get_implementation_resume_task(&self) -> Option<String> {
        let resume_task_id = self
            .store
            .get_resume_task_id()
            .or_else(|| DevAgent::get_in_progress_task(&self.ctx))?;
        if let Some(next) = DevAgent::get_next_pending_task_after(&self.ctx, &resume_task_id) {
            return Some(next);
        }
        let (completed, total) = DevAgent::count_task_status(&self.ctx);
        if completed >= total {
            return None;
        }
        Some(resume_task_id)
    }

    fn spec_artifacts_valid(&self) -> bool {
        artifact_valid(&self.feature_dir.join("SPEC.md"), MIN_SPEC_FILE_BYTES)
            && artifact_valid(&self.feature_dir.join("TASKS.md"), MIN_TASKS_FILE_BYTES)
    }

    fn qa_artifacts_valid(&self) -> bool {
        artifact_valid(
            &self.feature_dir.join("QA_REPORT.md"),
            MIN_QA_REPORT_FILE_BYTES,
        )
    }
}

fn artifact_valid(path: &Path, min_bytes: u64) -> bool {
    std::fs::metadata(path).map(|m| m.len() > min_bytes).unwrap_or(false)
}

/// Output hook persisting a task checkpoint whenever the implementation
/// agent announces a task start or completion.
fn task_checkpoint_hook(store: Arc<StateStore>) -> OutputHook {
    Arc::new(move |line: &str| {
        let (task_id, status) = match detect_task_event(line) {
            Some(TaskEvent::Started(id)) => (id, CheckpointStatus::InProgress),
            Some(TaskEvent::Completed(id)) => (id, CheckpointStatus::Completed),
            None => return,
        };
        tracing::debug!(task_id, ?status, "task checkpoint");
        if let Err(err) = store.checkpoint_task(&task_id, status) {
            tracing::warn!(%err, "failed to persist task checkpoint");
        }
    })
}
