//! Specification agent: turns PRD.md into SPEC.md and TASKS.md.

use anyhow::{Result, bail};
use regex::Regex;
use std::sync::LazyLock;

use super::{AgentContext, AgentResult, WorkflowAgent};
use crate::errors::ExecError;
use crate::runner::ExecutionResponse;

const PROMPT_FILE: &str = "spec_agent.md";
const DEFAULT_PROMPT: &str = include_str!("templates/spec_agent.md");

/// Minimum byte sizes below which the generated artifacts are treated as
/// placeholders rather than real content.
const MIN_SPEC_BYTES: u64 = 1000;
const MIN_TASKS_BYTES: u64 = 500;

static TASK_HEADING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^#{2,3}\s*Task\s+[\d.]+").expect("valid regex"));

pub struct SpecAgent;

impl WorkflowAgent for SpecAgent {
    fn name(&self) -> &'static str {
        "spec-agent"
    }

    fn build_prompt(&self, ctx: &AgentContext) -> Result<String> {
        let template = ctx.load_prompt_template(PROMPT_FILE, DEFAULT_PROMPT);
        let Some(prd_content) = ctx.read_feature_file("PRD.md") else {
            bail!("PRD.md not found in {}", ctx.feature_dir.display());
        };
        Ok(ctx.apply_placeholders(&template, &[("prd_content", &prd_content)]))
    }

    fn parse_output(&self, ctx: &AgentContext, response: &ExecutionResponse) -> AgentResult {
        let mut files_generated = Vec::new();
        let mut missing = Vec::new();
        for name in ["SPEC.md", "TASKS.md"] {
            if ctx.feature_dir.join(name).exists() {
                files_generated.push(name.to_string());
            } else {
                missing.push(name);
            }
        }
        if !missing.is_empty() {
            return AgentResult {
                success: false,
                output: response.output.clone(),
                files_generated,
                error: Some(format!("Missing files: {}", missing.join(", "))),
                breaker: None,
            };
        }

        let spec_ok = file_size(ctx, "SPEC.md") > MIN_SPEC_BYTES;
        let tasks_ok = file_size(ctx, "TASKS.md") > MIN_TASKS_BYTES;
        let error = if !response.exit_signal {
            Some(ExecError::MissingExitSignal.to_string())
        } else if !spec_ok || !tasks_ok {
            Some("Generated files are too small to be real artifacts".to_string())
        } else {
            None
        };

        AgentResult {
            success: error.is_none(),
            output: response.output.clone(),
            files_generated,
            error,
            breaker: None,
        }
    }
}

impl SpecAgent {
    /// Number of task headings in TASKS.md.
    pub fn count_tasks(ctx: &AgentContext) -> u32 {
        match ctx.read_feature_file("TASKS.md") {
            Some(content) => TASK_HEADING.find_iter(&content).count() as u32,
            None => 0,
        }
    }
}

fn file_size(ctx: &AgentContext, name: &str) -> u64 {
    std::fs::metadata(ctx.feature_dir.join(name))
        .map(|m| m.len())
        .unwrap_or(0)
}
