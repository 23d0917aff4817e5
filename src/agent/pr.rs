//! PR agent: pushes the feature branch and opens the pull request.

use anyhow::Result;
use regex::Regex;
use std::sync::LazyLock;

use super::{AgentContext, AgentResult, WorkflowAgent};
use crate::errors::ExecError;
use crate::runner::ExecutionResponse;

const PROMPT_FILE: &str = "pr_agent.md";
const DEFAULT_PROMPT: &str = include_str!("templates/pr_agent.md");

static PR_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"https://github\.com/\S+/(?:pull/\d+|compare/\S+)").expect("valid regex")
});

static BRANCH_CLEANUP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("valid regex"));

pub struct PrAgent {
    branch_name: String,
}

impl WorkflowAgent for PrAgent {
    fn name(&self) -> &'static str {
        "pr-agent"
    }

    fn build_prompt(&self, ctx: &AgentContext) -> Result<String> {
        let template = ctx.load_prompt_template(PROMPT_FILE, DEFAULT_PROMPT);
        let qa_report = ctx
            .read_feature_file("QA_REPORT.md")
            .unwrap_or_else(|| "QA report not available".to_string());
        Ok(ctx.apply_placeholders(
            &template,
            &[
                ("branch_name", self.branch_name.as_str()),
                ("qa_report", qa_report.as_str()),
            ],
        ))
    }

    fn parse_output(&self, _ctx: &AgentContext, response: &ExecutionResponse) -> AgentResult {
        let Some(pr_url) = extract_pr_url(&response.output) else {
            return AgentResult::failure(response.output.clone(), "PR URL not found in output");
        };
        AgentResult {
            success: response.exit_signal,
            output: response.output.clone(),
            files_generated: vec![format!("PR: {pr_url}")],
            error: (!response.exit_signal).then(|| ExecError::MissingExitSignal.to_string()),
            breaker: None,
        }
    }
}

impl PrAgent {
    pub fn new(feature_name: &str) -> Self {
        Self {
            branch_name: branch_name_for(feature_name),
        }
    }

    pub fn branch_name(&self) -> &str {
        &self.branch_name
    }
}

fn branch_name_for(feature_name: &str) -> String {
    let slug = BRANCH_CLEANUP
        .replace_all(&feature_name.to_lowercase(), "-")
        .trim_matches('-')
        .to_string();
    format!("feature/{slug}")
}

fn extract_pr_url(output: &str) -> Option<String> {
    PR_URL.find(output).map(|m| m.as_str().to_string())
}
