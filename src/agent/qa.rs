//! QA agent: reviews the implementation and writes QA_REPORT.md.

use anyhow::Result;
use regex::Regex;
use std::sync::LazyLock;

use super::{AgentContext, AgentResult, WorkflowAgent};
use crate::errors::ExecError;
use crate::runner::ExecutionResponse;

const PROMPT_FILE: &str = "qa_agent.md";
const DEFAULT_PROMPT: &str = include_str!("templates/qa_agent.md");

static SCORE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)score[:*\s]+(\d+)").expect("valid regex"));

/// Summary re-parsed from QA_REPORT.md so a resumed run does not depend on
/// the agent instance that produced the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QaSummary {
    pub score: Option<u32>,
    pub critical_issues: u32,
    pub passed: bool,
}

pub struct QaAgent;

impl WorkflowAgent for QaAgent {
    fn name(&self) -> &'static str {
        "qa-agent"
    }

    fn build_prompt(&self, ctx: &AgentContext) -> Result<String> {
        let template = ctx.load_prompt_template(PROMPT_FILE, DEFAULT_PROMPT);
        Ok(ctx.apply_placeholders(&template, &[]))
    }

    fn parse_output(&self, ctx: &AgentContext, response: &ExecutionResponse) -> AgentResult {
        if !ctx.feature_dir.join("QA_REPORT.md").exists() {
            return AgentResult::failure(response.output.clone(), "QA_REPORT.md not generated");
        }
        AgentResult {
            success: response.exit_signal,
            output: response.output.clone(),
            files_generated: vec!["QA_REPORT.md".to_string()],
            error: (!response.exit_signal).then(|| ExecError::MissingExitSignal.to_string()),
            breaker: None,
        }
    }
}

impl QaAgent {
    /// Extract score and critical-issue count from QA_REPORT.md.
    pub fn report_summary(ctx: &AgentContext) -> QaSummary {
        let Some(content) = ctx.read_feature_file("QA_REPORT.md") else {
            return QaSummary {
                score: None,
                critical_issues: 0,
                passed: false,
            };
        };
        let score = SCORE
            .captures(&content)
            .and_then(|caps| caps[1].parse().ok());
        let critical_issues = content.to_lowercase().matches("critical").count() as u32;
        QaSummary {
            score,
            critical_issues,
            passed: critical_issues == 0,
        }
    }
}
