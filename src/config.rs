//! Project configuration loaded from `.waypoint/config.yaml`.
//!
//! Every section has serde defaults so a missing or partial file yields a
//! fully usable configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Per-phase timeouts in seconds. The `agent` timeout is the fallback used
/// when no phase-specific value applies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub specification: u64,
    pub implementation: u64,
    pub qa: u64,
    pub pr: u64,
    pub agent: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            specification: 1800,
            implementation: 14400,
            qa: 1800,
            pr: 600,
            agent: 300,
        }
    }
}

/// Retry policy for agent invocations. Retries fire on timeout, non-zero
/// exit, or a circuit breaker trip; a missing exit signal is never retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts (1 = no retry).
    pub max_attempts: u32,
    pub delay_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay_seconds: 5,
        }
    }
}

/// Circuit breaker thresholds. See [`crate::breaker::CircuitBreaker`] for
/// the four trigger kinds these govern.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub enabled: bool,
    /// Default inactivity window in seconds; phase/test-command context can
    /// raise it.
    pub inactivity_timeout: u64,
    pub max_repeated_errors: u32,
    /// Implementation-agent only: seconds without a completed task.
    pub task_stagnation_timeout: u64,
    /// Cumulative output cap in bytes.
    pub max_output_size: u64,
    /// Warnings before the breaker opens.
    pub max_attempts: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            inactivity_timeout: 60,
            max_repeated_errors: 3,
            task_stagnation_timeout: 600,
            max_output_size: 524_288,
            max_attempts: 3,
        }
    }
}

/// Model selection per phase. Aliases ("sonnet", "opus", "haiku") or full
/// model names are passed through to the agent binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub specification: String,
    pub implementation: String,
    pub qa: String,
    pub pr: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            specification: "sonnet".into(),
            implementation: "sonnet".into(),
            qa: "sonnet".into(),
            pr: "sonnet".into(),
        }
    }
}

/// Target stack description, injected into agent prompts. The test command
/// also widens the breaker's inactivity window when seen in recent output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub language: String,
    pub test_command: String,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            language: "typescript".into(),
            test_command: "npm test".into(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub name: Option<String>,
    pub timeouts: TimeoutConfig,
    pub retry: RetryConfig,
    pub models: ModelConfig,
    pub stack: StackConfig,
    pub circuit_breaker: BreakerConfig,
}

impl ProjectConfig {
    /// Load configuration from `.waypoint/config.yaml`, falling back to
    /// defaults when the file does not exist.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = config_path(project_dir);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid YAML in {}", path.display()))?;
        Ok(config)
    }

    /// Write the configuration to `.waypoint/config.yaml`, creating the
    /// directory if needed.
    pub fn save(&self, project_dir: &Path) -> Result<()> {
        let dir = waypoint_dir(project_dir);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = config_path(project_dir);
        let yaml = serde_yaml::to_string(self).context("Failed to serialize config")?;
        std::fs::write(&path, yaml)
            .with_context(|| format!("Failed to write config at {}", path.display()))?;
        Ok(())
    }
}

/// Path to the project-level `.waypoint` directory.
pub fn waypoint_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(".waypoint")
}

fn config_path(project_dir: &Path) -> PathBuf {
    waypoint_dir(project_dir).join("config.yaml")
}

/// Feature working directory: `docs/features/<name>`.
pub fn feature_dir(project_dir: &Path, feature_name: &str) -> PathBuf {
    project_dir
        .join("docs")
        .join("features")
        .join(feature_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_documented_values() {
        let config = ProjectConfig::default();
        assert_eq!(config.timeouts.specification, 1800);
        assert_eq!(config.timeouts.implementation, 14400);
        assert_eq!(config.timeouts.qa, 1800);
        assert_eq!(config.timeouts.pr, 600);
        assert_eq!(config.timeouts.agent, 300);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.circuit_breaker.inactivity_timeout, 60);
        assert_eq!(config.circuit_breaker.max_output_size, 524_288);
        assert_eq!(config.circuit_breaker.max_attempts, 3);
        assert!(config.circuit_breaker.enabled);
        assert_eq!(config.models.implementation, "sonnet");
    }

    #[test]
    fn load_missing_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let config = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(config.timeouts.agent, 300);
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let mut config = ProjectConfig::default();
        config.name = Some("demo".into());
        config.timeouts.qa = 900;
        config.circuit_breaker.max_attempts = 5;
        config.save(dir.path()).unwrap();

        let loaded = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(loaded.name.as_deref(), Some("demo"));
        assert_eq!(loaded.timeouts.qa, 900);
        assert_eq!(loaded.circuit_breaker.max_attempts, 5);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let dir = tempdir().unwrap();
        let wp = waypoint_dir(dir.path());
        std::fs::create_dir_all(&wp).unwrap();
        std::fs::write(
            wp.join("config.yaml"),
            "timeouts:\n  qa: 42\nstack:\n  language: rust\n",
        )
        .unwrap();

        let config = ProjectConfig::load(dir.path()).unwrap();
        assert_eq!(config.timeouts.qa, 42);
        assert_eq!(config.timeouts.pr, 600);
        assert_eq!(config.stack.language, "rust");
        assert_eq!(config.stack.test_command, "npm test");
    }

    #[test]
    fn invalid_yaml_is_an_error() {
        let dir = tempdir().unwrap();
        let wp = waypoint_dir(dir.path());
        std::fs::create_dir_all(&wp).unwrap();
        std::fs::write(wp.join("config.yaml"), "timeouts: [not, a, map]").unwrap();
        assert!(ProjectConfig::load(dir.path()).is_err());
    }
}
