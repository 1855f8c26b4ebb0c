//! Orchestrator configuration stored as TOML.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::feedback::FeedbackLimits;

/// Orchestrator configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to sensible values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Dispatcher tick period in seconds.
    pub poll_interval_secs: u64,

    /// Maximum execution engines in flight.
    pub max_concurrency: usize,

    /// Retry budget per task.
    pub max_retries: u32,

    /// Parent directory for per-task working directories.
    pub work_dir: PathBuf,

    /// Store backing location.
    pub db_path: PathBuf,

    /// Hard timeout for a repository clone in seconds.
    pub clone_timeout_secs: u64,

    /// Hard timeout for a branch push in seconds.
    pub push_timeout_secs: u64,

    /// Hard timeout per generator invocation in seconds.
    pub generator_timeout_secs: u64,

    /// Maximum wait for a CI conclusion in seconds.
    pub ci_deadline_secs: u64,

    /// Period between CI status queries in seconds.
    pub ci_poll_interval_secs: u64,

    /// Failure-log slice fed into the next prompt, in bytes.
    pub prompt_truncate_bytes: usize,

    /// Ceiling on a composed feedback prompt, in bytes.
    pub prompt_max_bytes: usize,

    /// Stuck-`running` age for the recovery sweep, in seconds.
    /// 0 derives the threshold from the iteration timeouts.
    pub liveness_threshold_secs: u64,

    pub generator: GeneratorConfig,
    pub ci: CiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Command line for the code-generation tool.
    pub command: Vec<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: vec!["amp".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CiConfig {
    /// REST API base for the CI provider.
    pub api_base: String,
    /// Access token; empty disables pull-request creation.
    pub token: String,
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.github.com".to_string(),
            token: String::new(),
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            max_concurrency: 3,
            max_retries: 3,
            work_dir: PathBuf::from("./work"),
            db_path: PathBuf::from("./orchestrator.db"),
            clone_timeout_secs: 10 * 60,
            push_timeout_secs: 5 * 60,
            generator_timeout_secs: 30 * 60,
            ci_deadline_secs: 60 * 60,
            ci_poll_interval_secs: 15,
            prompt_truncate_bytes: 4096,
            prompt_max_bytes: 8 * 1024,
            liveness_threshold_secs: 0,
            generator: GeneratorConfig::default(),
            ci: CiConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(anyhow!("poll_interval_secs must be > 0"));
        }
        if self.max_concurrency == 0 {
            return Err(anyhow!("max_concurrency must be > 0"));
        }
        if self.generator_timeout_secs == 0 {
            return Err(anyhow!("generator_timeout_secs must be > 0"));
        }
        if self.ci_deadline_secs == 0 {
            return Err(anyhow!("ci_deadline_secs must be > 0"));
        }
        if self.ci_poll_interval_secs == 0 {
            return Err(anyhow!("ci_poll_interval_secs must be > 0"));
        }
        if self.prompt_truncate_bytes == 0 || self.prompt_max_bytes == 0 {
            return Err(anyhow!("prompt byte bounds must be > 0"));
        }
        if self.generator.command.is_empty() || self.generator.command[0].trim().is_empty() {
            return Err(anyhow!("generator.command must be a non-empty array"));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_secs)
    }

    pub fn push_timeout(&self) -> Duration {
        Duration::from_secs(self.push_timeout_secs)
    }

    pub fn generator_timeout(&self) -> Duration {
        Duration::from_secs(self.generator_timeout_secs)
    }

    pub fn ci_deadline(&self) -> Duration {
        Duration::from_secs(self.ci_deadline_secs)
    }

    pub fn ci_poll_interval(&self) -> Duration {
        Duration::from_secs(self.ci_poll_interval_secs)
    }

    /// Stuck-`running` age that triggers the recovery sweep. When not set
    /// explicitly, twice the worst-case iteration time.
    pub fn liveness_threshold(&self) -> Duration {
        if self.liveness_threshold_secs > 0 {
            return Duration::from_secs(self.liveness_threshold_secs);
        }
        let iteration = self.clone_timeout_secs
            + self.generator_timeout_secs
            + self.push_timeout_secs
            + self.ci_deadline_secs;
        Duration::from_secs(iteration * 2)
    }

    pub fn feedback_limits(&self) -> FeedbackLimits {
        FeedbackLimits {
            truncate_bytes: self.prompt_truncate_bytes,
            max_bytes: self.prompt_max_bytes,
        }
    }
}

/// Load config from a TOML file, falling back to the defaults when the file
/// does not exist yet.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    let cfg = match fs::read_to_string(path) {
        Ok(raw) => toml::from_str(&raw)
            .with_context(|| format!("config {} is not valid TOML", path.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => OrchestratorConfig::default(),
        Err(err) => {
            return Err(anyhow::Error::new(err)
                .context(format!("could not read config {}", path.display())));
        }
    };
    cfg.validate()?;
    Ok(cfg)
}

/// Persist config as pretty TOML.
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut rendered = toml::to_string_pretty(cfg).context("render config toml")?;
    if !rendered.ends_with('\n') {
        rendered.push('\n');
    }
    write_atomic(path, &rendered)
}

/// Stage-then-rename so a crash mid-write cannot leave a truncated config
/// behind.
fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .ok_or_else(|| anyhow!("{} has no parent directory", path.display()))?;
    fs::create_dir_all(dir)
        .with_context(|| format!("prepare config directory {}", dir.display()))?;
    let staging = path.with_extension("toml.staging");
    fs::write(&staging, contents)
        .with_context(|| format!("stage config at {}", staging.display()))?;
    fs::rename(&staging, path)
        .with_context(|| format!("move staged config into place at {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("absent.toml")).expect("load");
        assert_eq!(cfg, OrchestratorConfig::default());
    }

    #[test]
    fn persists_and_reloads_custom_values() {
        let temp = tempfile::tempdir().expect("tempdir");
        // Nested path: the writer must create intermediate directories.
        let path = temp.path().join("conf").join("orchestrator.toml");
        let cfg = OrchestratorConfig {
            max_concurrency: 5,
            poll_interval_secs: 3,
            ..OrchestratorConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
        // The staging file is gone once the rename lands.
        assert!(!path.with_extension("toml.staging").exists());
    }

    #[test]
    fn rejects_malformed_toml() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("orchestrator.toml");
        fs::write(&path, "max_concurrency = \"three\"").expect("write");
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn rejects_zero_concurrency() {
        let cfg = OrchestratorConfig {
            max_concurrency: 0,
            ..OrchestratorConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn liveness_threshold_derives_from_iteration_budget() {
        let cfg = OrchestratorConfig::default();
        let iteration = cfg.clone_timeout_secs
            + cfg.generator_timeout_secs
            + cfg.push_timeout_secs
            + cfg.ci_deadline_secs;
        assert_eq!(cfg.liveness_threshold(), Duration::from_secs(iteration * 2));

        let explicit = OrchestratorConfig {
            liveness_threshold_secs: 120,
            ..OrchestratorConfig::default()
        };
        assert_eq!(explicit.liveness_threshold(), Duration::from_secs(120));
    }
}
