//! Development agent: implements TASKS.md task by task.

use anyhow::{Result, bail};
use regex::Regex;
use std::sync::LazyLock;

use super::{AgentContext, AgentResult, WorkflowAgent};
use crate::errors::ExecError;
use crate::runner::ExecutionResponse;

const PROMPT_FILE: &str = "dev_agent.md";
const DEFAULT_PROMPT: &str = include_str!("templates/dev_agent.md");

static TASK_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#{2,3}\s*Task\s+[\d.]+").expect("valid regex"));

/// Captures a task id and the status that follows its heading.
static TASK_STATUS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?mi)^#{2,3}\s*Task\s+([\d.]+)[^\n]*\n[^#]*?\*\*Status\*\*:\s*(\w+)")
        .expect("valid regex")
});

static COMPLETED_STATUS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\*\*Status\*\*:\s*completed").expect("valid regex"));

static TASK_STARTED_EVENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:working on|starting|implementing)\s+task\s+([\d.]+)").expect("valid regex")
});

static TASK_COMPLETED_EVENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:completed\s+task\s+([\d.]+)|task\s+([\d.]+)[^\n]*?\bcompleted\b)")
        .expect("valid regex")
});

/// Task lifecycle announcement detected in the agent's output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskEvent {
    Started(String),
    Completed(String),
}

/// Detect a task start or completion announcement in one output line.
/// Completion wins when a line mentions both.
pub fn detect_task_event(line: &str) -> Option<TaskEvent> {
    if let Some(caps) = TASK_COMPLETED_EVENT.captures(line) {
        let id = caps.get(1).or_else(|| caps.get(2))?.as_str();
        return Some(TaskEvent::Completed(id.trim_end_matches('.').to_string()));
    }
    let caps = TASK_STARTED_EVENT.captures(line)?;
    Some(TaskEvent::Started(caps[1].trim_end_matches('.').to_string()))
}

/// Implementation agent. `start_from_task` is set when resuming an
/// interrupted run so the prompt tells the agent where to pick up.
#[derive(Default)]
pub struct DevAgent {
    pub start_from_task: Option<String>,
}

impl WorkflowAgent for DevAgent {
    fn name(&self) -> &'static str {
        "dev-agent"
    }

    fn is_dev_agent(&self) -> bool {
        true
    }

    fn build_prompt(&self, ctx: &AgentContext) -> Result<String> {
        let template = ctx.load_prompt_template(PROMPT_FILE, DEFAULT_PROMPT);
        let Some(spec_content) = ctx.read_feature_file("SPEC.md") else {
            bail!("SPEC.md not found in {}", ctx.feature_dir.display());
        };
        let Some(tasks_content) = ctx.read_feature_file("TASKS.md") else {
            bail!("TASKS.md not found in {}", ctx.feature_dir.display());
        };
        let resume_instruction = self
            .start_from_task
            .as_deref()
            .map(resume_instruction)
            .unwrap_or_default();
        Ok(ctx.apply_placeholders(
            &template,
            &[
                ("spec_content", spec_content.as_str()),
                ("tasks_content", tasks_content.as_str()),
                ("resume_instruction", resume_instruction.as_str()),
            ],
        ))
    }

    fn parse_output(&self, ctx: &AgentContext, response: &ExecutionResponse) -> AgentResult {
        let (completed, total) = Self::count_task_status(ctx);
        if completed < total {
            return AgentResult::failure(
                response.output.clone(),
                format!("Incomplete tasks: {completed}/{total}"),
            );
        }
        AgentResult {
            success: response.exit_signal,
            output: response.output.clone(),
            files_generated: Vec::new(),
            error: (!response.exit_signal).then(|| ExecError::MissingExitSignal.to_string()),
            breaker: None,
        }
    }
}

impl DevAgent {
    pub fn resuming_from(task_id: impl Into<String>) -> Self {
        Self {
            start_from_task: Some(task_id.into()),
        }
    }

    /// (completed, total) counts from TASKS.md.
    pub fn count_task_status(ctx: &AgentContext) -> (u32, u32) {
        let Some(content) = ctx.read_feature_file("TASKS.md") else {
            return (0, 0);
        };
        let total = TASK_HEADING.find_iter(&content).count() as u32;
        let completed = COMPLETED_STATUS.find_iter(&content).count() as u32;
        (completed, total)
    }

    /// Id of the task currently marked `in_progress`, if any.
    pub fn get_in_progress_task(ctx: &AgentContext) -> Option<String> {
        let content = ctx.read_feature_file("TASKS.md")?;
        TASK_STATUS
            .captures_iter(&content)
            .find(|caps| caps[2].eq_ignore_ascii_case("in_progress"))
            .map(|caps| caps[1].to_string())
    }

    /// First not-completed task at or after `task_id`, in document order.
    /// Used on resume when the checkpointed task may itself be done.
    pub fn get_next_pending_task_after(ctx: &AgentContext, task_id: &str) -> Option<String> {
        let content = ctx.read_feature_file("TASKS.md")?;
        let mut found_target = false;
        for caps in TASK_STATUS.captures_iter(&content) {
            let id = &caps[1];
            let completed = caps[2].eq_ignore_ascii_case("completed");
            if id == task_id {
                found_target = true;
                if !completed {
                    return Some(id.to_string());
                }
            } else if found_target && !completed {
                return Some(id.to_string());
            }
        }
        None
    }
}

fn resume_instruction(task_id: &str) -> String {
    format!(
        "## RESUME MODE\n\
         \n\
         You are resuming an interrupted session.\n\
         - Skip every task BEFORE task {task_id}; they are already completed.\n\
         - Start directly at task {task_id}.\n\
         - If task {task_id} is `in_progress` it was interrupted: re-implement it.\n\
         - Continue sequentially to the end.\n\
         - Do NOT re-implement tasks marked `completed`.\n\
         \n\
         Before starting, read TASKS.md and confirm the tasks before {task_id} are completed.\n"
    )
}
