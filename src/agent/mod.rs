//! Agent layer: prompt construction, invocation with retry, and output
//! parsing for each workflow phase.
//!
//! Retry policy: a circuit breaker trip, an overall timeout, and a non-zero
//! exit are retryable up to `retry.max_attempts`, with a fresh breaker per
//! attempt. A launch failure, an external abort, and a missing exit signal
//! are never retried.

pub mod dev;
pub mod pr;
pub mod qa;
pub mod spec;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::breaker::{BreakerContext, CircuitBreaker};
use crate::config::ProjectConfig;
use crate::errors::ExecError;
use crate::reader::OutputHook;
use crate::runner::{AbortRegistry, ExecutionRequest, ExecutionResponse, ExecutionRunner};
use crate::state::Phase;
use crate::stream::{TokenUsage, UsageHook};

/// Custom prompts shorter than this are rejected in favor of the default.
const MIN_PROMPT_CHARS: usize = 100;

pub type SharedUsageHook = Arc<dyn Fn(&TokenUsage, f64) + Send + Sync>;

/// Circuit breaker summary from the last attempt, mirrored into the
/// persisted workflow state.
#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub state: String,
    pub attempts: u32,
    pub last_trigger: Option<String>,
}

/// Outcome of one agent phase, after retries and output parsing.
#[derive(Debug)]
pub struct AgentResult {
    pub success: bool,
    pub output: String,
    pub files_generated: Vec<String>,
    pub error: Option<String>,
    pub breaker: Option<BreakerSnapshot>,
}

impl AgentResult {
    pub fn failure(output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            files_generated: Vec::new(),
            error: Some(error.into()),
            breaker: None,
        }
    }
}

/// Shared environment every agent reads from.
#[derive(Clone)]
pub struct AgentContext {
    pub project_dir: PathBuf,
    pub feature_dir: PathBuf,
    pub config: ProjectConfig,
    /// Agent CLI binary; overridable for tests.
    pub binary: String,
    pub on_output: Option<OutputHook>,
    pub on_usage: Option<SharedUsageHook>,
}

impl AgentContext {
    pub fn new(
        project_dir: impl Into<PathBuf>,
        feature_dir: impl Into<PathBuf>,
        config: ProjectConfig,
    ) -> Self {
        Self {
            project_dir: project_dir.into(),
            feature_dir: feature_dir.into(),
            config,
            binary: "claude".into(),
            on_output: None,
            on_usage: None,
        }
    }

    pub fn read_feature_file(&self, name: &str) -> Option<String> {
        std::fs::read_to_string(self.feature_dir.join(name)).ok()
    }

    /// Feature directory rendered relative to the project root when possible.
    fn feature_path(&self) -> String {
        self.feature_dir
            .strip_prefix(&self.project_dir)
            .unwrap_or(&self.feature_dir)
            .display()
            .to_string()
    }

    /// Load a prompt template: a valid project override from
    /// `.claude/agents/<file>` wins, otherwise the embedded default.
    /// YAML frontmatter is stripped either way.
    pub fn load_prompt_template(&self, file: &str, default: &str) -> String {
        let override_path = self.project_dir.join(".claude").join("agents").join(file);
        if let Ok(content) = std::fs::read_to_string(&override_path) {
            if validate_prompt(&content) {
                return strip_frontmatter(&content).to_string();
            }
            tracing::warn!(file, "custom prompt invalid, using default");
        }
        strip_frontmatter(default).to_string()
    }

    /// Replace the placeholders every template understands, then the
    /// agent-specific pairs.
    pub fn apply_placeholders(&self, template: &str, pairs: &[(&str, &str)]) -> String {
        let mut result = template
            .replace(
                "{{project_name}}",
                self.config.name.as_deref().unwrap_or(""),
            )
            .replace("{{language}}", &self.config.stack.language)
            .replace("{{test_command}}", &self.config.stack.test_command)
            .replace("{{feature_path}}", &self.feature_path());
        for (key, value) in pairs {
            result = result.replace(&format!("{{{{{key}}}}}"), value);
        }
        result
    }
}

fn validate_prompt(content: &str) -> bool {
    content.len() >= MIN_PROMPT_CHARS && content.contains("EXIT_SIGNAL")
}

/// Strip a leading `---` ... `---` YAML frontmatter block.
fn strip_frontmatter(content: &str) -> &str {
    let Some(rest) = content.strip_prefix("---") else {
        return content;
    };
    match rest.find("---") {
        Some(end) => rest[end + 3..].trim_start(),
        None => content,
    }
}

/// One workflow phase's agent. Prompt construction and result parsing are
/// synchronous; the async retry driver is [`run_agent`].
pub trait WorkflowAgent {
    fn name(&self) -> &'static str;

    /// Task stagnation only applies to the implementation agent.
    fn is_dev_agent(&self) -> bool {
        false
    }

    fn build_prompt(&self, ctx: &AgentContext) -> Result<String>;

    fn parse_output(&self, ctx: &AgentContext, response: &ExecutionResponse) -> AgentResult;
}

/// Per-invocation knobs the orchestrator supplies.
pub struct RunOptions {
    pub phase: Phase,
    pub timeout: Duration,
    pub model: Option<String>,
    pub registry: Option<AbortRegistry>,
}

/// Invoke an agent with retry. See the module docs for the retry taxonomy.
pub async fn run_agent(
    agent: &dyn WorkflowAgent,
    ctx: &AgentContext,
    opts: RunOptions,
) -> AgentResult {
    tracing::info!(agent = agent.name(), phase = %opts.phase, "agent started");

    let prompt = match agent.build_prompt(ctx) {
        Ok(prompt) if !prompt.is_empty() => prompt,
        Ok(_) => return AgentResult::failure("", "Failed to build prompt"),
        Err(err) => return AgentResult::failure("", format!("Failed to build prompt: {err}")),
    };

    let retry = ctx.config.retry.clone();
    let breaker_config = ctx.config.circuit_breaker.clone();
    let timeout_secs = opts.timeout.as_secs();

    let mut attempt = 0;
    let response = loop {
        attempt += 1;
        if attempt > 1 {
            tracing::warn!(
                agent = agent.name(),
                attempt,
                max = retry.max_attempts,
                "retrying agent"
            );
            tokio::time::sleep(Duration::from_secs(retry.delay_seconds)).await;
        }

        // Fresh breaker per attempt so earlier warnings don't carry over.
        let breaker = if breaker_config.enabled {
            let context = BreakerContext {
                phase: opts.phase,
                is_dev_agent: agent.is_dev_agent(),
                test_command: Some(ctx.config.stack.test_command.clone()),
            };
            let max_attempts = breaker_config.max_attempts;
            Some(Arc::new(CircuitBreaker::with_hooks(
                breaker_config.clone(),
                context,
                Some(Box::new(move |trigger, attempts| {
                    tracing::warn!(%trigger, attempts, max_attempts, "circuit breaker warning");
                })),
                Some(Box::new(|trigger| {
                    tracing::error!(%trigger, "circuit breaker open");
                })),
            )))
        } else {
            None
        };

        let runner = ExecutionRunner::with_binary(&ctx.binary, &ctx.project_dir);
        if let Some(registry) = &opts.registry {
            registry.register(runner.handle());
        }

        let mut request = ExecutionRequest::new(prompt.clone());
        request.model = opts.model.clone();
        request.timeout = opts.timeout;
        request.breaker = breaker.clone();
        request.on_output = ctx.on_output.clone();
        request.on_usage = ctx.on_usage.clone().map(|hook| -> UsageHook {
            Box::new(move |usage, cost| hook(usage, cost))
        });

        let response = runner.run(request).await;
        let snapshot = breaker.as_ref().map(|b| BreakerSnapshot {
            state: b.state().as_str().to_string(),
            attempts: b.attempts(),
            last_trigger: b.last_trigger().map(|t| t.to_string()),
        });

        if let Some(message) = &response.launch_error {
            tracing::error!(agent = agent.name(), message, "agent launch failed");
            let mut result = AgentResult::failure(response.output.clone(), message.clone());
            result.breaker = snapshot;
            return result;
        }

        if opts.registry.as_ref().is_some_and(AbortRegistry::is_aborted)
            && !response.circuit_breaker_triggered
        {
            tracing::warn!(agent = agent.name(), "aborted by user");
            let mut result = AgentResult::failure(response.output.clone(), "Aborted by user");
            result.breaker = snapshot;
            return result;
        }

        let failure = classify_failure(&response, breaker.as_deref(), timeout_secs);
        match failure {
            Some(err) if attempt < retry.max_attempts => {
                tracing::warn!(agent = agent.name(), %err, "attempt failed, will retry");
                continue;
            }
            Some(err) => {
                tracing::error!(agent = agent.name(), %err, "agent failed");
                let mut result = AgentResult::failure(response.output.clone(), err.to_string());
                result.breaker = snapshot;
                return result;
            }
            None => break (response, snapshot),
        }
    };
    let (response, snapshot) = response;

    // Output parsing (including the exit-signal check) is never retried.
    let mut result = agent.parse_output(ctx, &response);
    result.breaker = snapshot;
    if result.success {
        tracing::info!(agent = agent.name(), "agent completed");
    } else {
        tracing::error!(agent = agent.name(), error = ?result.error, "agent failed");
    }
    result
}

/// Map a finished response to a retryable error, or None on a clean exit.
fn classify_failure(
    response: &ExecutionResponse,
    breaker: Option<&CircuitBreaker>,
    timeout_secs: u64,
) -> Option<ExecError> {
    if response.circuit_breaker_triggered {
        let trigger = breaker
            .and_then(CircuitBreaker::last_trigger)
            .map(|t| t.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        return Some(ExecError::BreakerTripped { trigger });
    }
    if response.timed_out {
        return Some(ExecError::Timeout {
            seconds: timeout_secs,
        });
    }
    if response.return_code != 0 {
        return Some(ExecError::NonZeroExit {
            code: response.return_code,
        });
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn strip_frontmatter_removes_leading_block() {
        let content = "---\nname: spec\n---\nActual prompt body";
        assert_eq!(strip_frontmatter(content), "Actual prompt body");
    }

    #[test]
    fn strip_frontmatter_leaves_plain_content() {
        assert_eq!(strip_frontmatter("no frontmatter here"), "no frontmatter here");
        // Unterminated frontmatter is passed through untouched.
        let broken = "---\nname: spec\nno terminator";
        assert_eq!(strip_frontmatter(broken), broken);
    }

    #[test]
    fn validate_prompt_rejects_short_or_signal_less_content() {
        assert!(!validate_prompt("too short"));
        let long_but_signal_less = "x".repeat(200);
        assert!(!validate_prompt(&long_but_signal_less));
        let valid = format!("{} EXIT_SIGNAL instructions", "x".repeat(200));
        assert!(validate_prompt(&valid));
    }

    #[test]
    fn custom_prompt_override_wins_when_valid() {
        let dir = tempdir().unwrap();
        let agents_dir = dir.path().join(".claude").join("agents");
        std::fs::create_dir_all(&agents_dir).unwrap();
        let custom = format!(
            "---\nname: custom\n---\n{} print EXIT_SIGNAL when done",
            "custom prompt body ".repeat(10)
        );
        std::fs::write(agents_dir.join("spec_agent.md"), &custom).unwrap();

        let ctx = AgentContext::new(dir.path(), dir.path().join("feature"), ProjectConfig::default());
        let loaded = ctx.load_prompt_template("spec_agent.md", "default EXIT_SIGNAL body");
        assert!(loaded.starts_with("custom prompt body"));
    }

    #[test]
    fn invalid_custom_prompt_falls_back_to_default() {
        let dir = tempdir().unwrap();
        let agents_dir = dir.path().join(".claude").join("agents");
        std::fs::create_dir_all(&agents_dir).unwrap();
        std::fs::write(agents_dir.join("spec_agent.md"), "way too short").unwrap();

        let ctx = AgentContext::new(dir.path(), dir.path().join("feature"), ProjectConfig::default());
        let loaded = ctx.load_prompt_template("spec_agent.md", "the default body");
        assert_eq!(loaded, "the default body");
    }

    #[test]
    fn placeholders_are_replaced() {
        let dir = tempdir().unwrap();
        let mut config = ProjectConfig::default();
        config.name = Some("demo".into());
        config.stack.language = "rust".into();
        let feature = dir.path().join("docs/features/login");
        let ctx = AgentContext::new(dir.path(), &feature, config);

        let rendered = ctx.apply_placeholders(
            "{{project_name}}/{{language}} at {{feature_path}}: {{extra}}",
            &[("extra", "value")],
        );
        assert_eq!(rendered, "demo/rust at docs/features/login: value");
    }

    #[test]
    fn classify_failure_prefers_breaker_then_timeout_then_exit() {
        let mut response = ExecutionResponse {
            return_code: 2,
            timed_out: true,
            circuit_breaker_triggered: true,
            ..Default::default()
        };
        assert!(matches!(
            classify_failure(&response, None, 60),
            Some(ExecError::BreakerTripped { .. })
        ));

        response.circuit_breaker_triggered = false;
        assert!(matches!(
            classify_failure(&response, None, 60),
            Some(ExecError::Timeout { seconds: 60 })
        ));

        response.timed_out = false;
        assert!(matches!(
            classify_failure(&response, None, 60),
            Some(ExecError::NonZeroExit { code: 2 })
        ));

        response.return_code = 0;
        assert!(classify_failure(&response, None, 60).is_none());
    }
}
