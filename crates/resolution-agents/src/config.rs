use anyhow::{bail, Context, Result};
use resolution::{CycleConfig, OrchestratorConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::rules::Rule;

/// One agent role and the constraints declared for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    #[serde(default)]
    pub constraints: Vec<String>,
}

impl AgentSpec {
    pub fn new(id: &str, constraints: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            constraints: constraints.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// Top-level runtime configuration.
///
/// Layering: defaults, then the TOML file (if any), then `RESOLUTION_*`
/// environment variables, then command-line flags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// JSONL ledger file.
    pub ledger_path: PathBuf,
    /// Remote arbiter endpoint. `None` uses the local policy arbiter.
    pub arbiter_url: Option<String>,
    pub cycle: CycleConfig,
    pub orchestrator: OrchestratorConfig,
    pub agents: Vec<AgentSpec>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            ledger_path: PathBuf::from("ledger/contradictions.jsonl"),
            arbiter_url: None,
            cycle: CycleConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            agents: vec![
                AgentSpec::new("twin_a", &[]),
                AgentSpec::new("twin_b", &["max_sentences:6"]),
                AgentSpec::new("twin_c", &["forbid:definitely"]),
                AgentSpec::new("suit", &["forbid:guaranteed", "forbid:certainly"]),
            ],
        }
    }
}

impl RuntimeConfig {
    /// Load from an optional TOML file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .context(format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).context("Failed to parse runtime config TOML")
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `RESOLUTION_*` overrides from any key lookup.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = lookup("RESOLUTION_LEDGER_PATH") {
            self.ledger_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup("RESOLUTION_MAX_ITERATIONS") {
            self.cycle.max_iterations = raw
                .trim()
                .parse()
                .context(format!("RESOLUTION_MAX_ITERATIONS is not a number: {raw}"))?;
        }
        if let Some(url) = lookup("RESOLUTION_ARBITER_URL") {
            self.arbiter_url = (!url.trim().is_empty()).then(|| url.trim().to_string());
        }
        if let Some(raw) = lookup("RESOLUTION_ARBITER_TIMEOUT_MS") {
            self.orchestrator.arbiter_timeout_ms = raw
                .trim()
                .parse()
                .context(format!("RESOLUTION_ARBITER_TIMEOUT_MS is not a number: {raw}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.cycle.max_iterations == 0 {
            bail!("cycle.max_iterations must be at least 1");
        }
        if self.cycle.iteration_ceiling < self.cycle.max_iterations {
            bail!(
                "cycle.iteration_ceiling ({}) is below cycle.max_iterations ({})",
                self.cycle.iteration_ceiling,
                self.cycle.max_iterations
            );
        }
        if self.agents.is_empty() {
            bail!("no agents configured");
        }

        let mut seen = HashSet::new();
        for agent in &self.agents {
            if agent.id.trim().is_empty() {
                bail!("agent id must not be empty");
            }
            if !seen.insert(agent.id.as_str()) {
                bail!("duplicate agent id: {}", agent.id);
            }
            for constraint in &agent.constraints {
                if constraint.starts_with("max_sentences:") && Rule::parse(constraint).is_none() {
                    bail!("agent {}: invalid constraint {}", agent.id, constraint);
                }
            }
        }
        Ok(())
    }

    pub fn agent(&self, id: &str) -> Option<&AgentSpec> {
        self.agents.iter().find(|a| a.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config_is_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.agents.len(), 4);
        assert_eq!(config.cycle.max_iterations, 10);
        assert!(config.arbiter_url.is_none());
        assert_eq!(
            config.agent("twin_b").unwrap().constraints,
            vec!["max_sentences:6".to_string()]
        );
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let toml = r#"
ledger_path = "/tmp/ledger.jsonl"

[cycle]
max_iterations = 3

[[agents]]
id = "solo"
constraints = ["forbid:never"]
"#;
        let config: RuntimeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.ledger_path, PathBuf::from("/tmp/ledger.jsonl"));
        assert_eq!(config.cycle.max_iterations, 3);
        assert_eq!(config.cycle.iteration_ceiling, 50);
        assert_eq!(config.orchestrator.arbiter_timeout_ms, 30_000);
        assert_eq!(config.agents, vec![AgentSpec::new("solo", &["forbid:never"])]);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolution.toml");
        std::fs::write(&path, "arbiter_url = \"http://arbiter:9000/rule\"\n").unwrap();

        let config = RuntimeConfig::from_file(&path).unwrap();
        assert_eq!(config.arbiter_url.as_deref(), Some("http://arbiter:9000/rule"));

        let missing = RuntimeConfig::from_file(&dir.path().join("missing.toml"));
        assert!(missing.unwrap_err().to_string().contains("Failed to read"));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("RESOLUTION_LEDGER_PATH", "/var/lib/ledger.jsonl"),
            ("RESOLUTION_MAX_ITERATIONS", "4"),
            ("RESOLUTION_ARBITER_URL", "http://localhost:8080"),
            ("RESOLUTION_ARBITER_TIMEOUT_MS", "2500"),
        ]);
        let mut config = RuntimeConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.ledger_path, PathBuf::from("/var/lib/ledger.jsonl"));
        assert_eq!(config.cycle.max_iterations, 4);
        assert_eq!(config.arbiter_url.as_deref(), Some("http://localhost:8080"));
        assert_eq!(config.orchestrator.arbiter_timeout_ms, 2_500);
    }

    #[test]
    fn test_bad_env_value_is_an_error() {
        let mut config = RuntimeConfig::default();
        let err = config
            .apply_overrides(|k| (k == "RESOLUTION_MAX_ITERATIONS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("RESOLUTION_MAX_ITERATIONS"));
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        let mut config = RuntimeConfig::default();
        config.agents.push(AgentSpec::new("twin_a", &[]));
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.cycle.max_iterations = 0;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.agents = vec![AgentSpec::new("solo", &["max_sentences:few"])];
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.agents.clear();
        assert!(config.validate().is_err());
    }
}
