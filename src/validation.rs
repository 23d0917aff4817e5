//! Human validation gates between workflow phases.
//!
//! Each gate shows the relevant artifact summary, then blocks on a yes/no
//! prompt. Auto-approve mode (`--yes`) answers every gate affirmatively for
//! non-interactive runs.

use anyhow::Result;
use console::style;
use dialoguer::{Confirm, theme::ColorfulTheme};
use std::path::Path;

use crate::agent::qa::QaSummary;

const SPEC_PREVIEW_LINES: usize = 20;

pub struct HumanValidator {
    auto_approve: bool,
}

impl HumanValidator {
    pub fn new(auto_approve: bool) -> Self {
        Self { auto_approve }
    }

    /// Generic gate: print the summary lines, then confirm.
    pub fn request_validation(&self, title: &str, summary: &[String]) -> Result<bool> {
        println!();
        println!("{}", style(title).bold().cyan());
        for line in summary {
            println!("  {line}");
        }

        if self.auto_approve {
            println!("  {} (--yes flag)", style("Auto-approved").dim());
            return Ok(true);
        }

        let approved = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Approve and continue?")
            .default(true)
            .interact()?;
        if !approved {
            println!("  {}", style("Rejected").red());
        }
        Ok(approved)
    }

    /// Specification gate: previews the head of SPEC.md and the task count.
    pub fn request_spec_validation(&self, feature_dir: &Path, tasks_total: u32) -> Result<bool> {
        let spec_path = feature_dir.join("SPEC.md");
        let mut summary = vec![
            format!("Specification: {}", spec_path.display()),
            format!("Planned tasks: {tasks_total}"),
        ];
        match std::fs::read_to_string(&spec_path) {
            Ok(content) => {
                summary.push(String::new());
                for line in content.lines().take(SPEC_PREVIEW_LINES) {
                    summary.push(format!("| {line}"));
                }
                if content.lines().count() > SPEC_PREVIEW_LINES {
                    summary.push("| ...".to_string());
                }
            }
            Err(err) => {
                tracing::warn!(%err, path = %spec_path.display(), "could not preview SPEC.md");
            }
        }
        self.request_validation("Specification review", &summary)
    }

    /// QA gate: shows the parsed report summary before asking.
    pub fn request_qa_validation(&self, feature_dir: &Path, summary: &QaSummary) -> Result<bool> {
        let report_path = feature_dir.join("QA_REPORT.md");
        let mut lines = vec![format!("QA report: {}", report_path.display())];
        match summary.score {
            Some(score) => lines.push(format!("Score: {score}/100")),
            None => lines.push("Score: not reported".to_string()),
        }
        lines.push(format!("Critical issues: {}", summary.critical_issues));
        self.request_validation("QA review", &lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn auto_approve_passes_without_a_terminal() {
        let validator = HumanValidator::new(true);
        assert!(
            validator
                .request_validation("gate", &["line".to_string()])
                .unwrap()
        );
    }

    #[test]
    fn auto_approve_spec_gate_survives_missing_spec_file() {
        let dir = tempdir().unwrap();
        let validator = HumanValidator::new(true);
        assert!(validator.request_spec_validation(dir.path(), 12).unwrap());
    }

    #[test]
    fn auto_approve_qa_gate_reports_summary() {
        let dir = tempdir().unwrap();
        let validator = HumanValidator::new(true);
        let summary = QaSummary {
            score: Some(85),
            critical_issues: 0,
            passed: true,
        };
        assert!(validator.request_qa_validation(dir.path(), &summary).unwrap());
    }
}
