// Runtime image registry and sandbox policy for the grading worker
use crate::engine::{RuntimeProfile, SandboxPolicy, SeccompPolicy};
use anyhow::{bail, Context, Result};
use gradebox_common::{Config, Language};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// One runtime image with optional per-image resource overrides
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RuntimeConfig {
    pub name: String,
    pub image: String,
    pub language: Language,
    #[serde(default)]
    pub memory_limit_mb: Option<u32>,
    #[serde(default)]
    pub cpu_limit: Option<f32>,
    #[serde(default)]
    pub pids_limit: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RuntimesJson {
    runtimes: Vec<RuntimeConfig>,
}

/// Known runtime images
#[derive(Debug, Clone)]
pub struct RuntimeRegistry {
    runtimes: Vec<RuntimeConfig>,
    default_image: String,
    policy: SandboxPolicy,
}

impl RuntimeRegistry {
    pub fn new(runtimes: Vec<RuntimeConfig>, default_image: impl Into<String>, policy: SandboxPolicy) -> Self {
        Self {
            runtimes,
            default_image: default_image.into(),
            policy,
        }
    }

    /// Load runtime definitions from runtimes.json
    pub fn load(config_path: &Path, default_image: &str, policy: SandboxPolicy) -> Result<Self> {
        if !config_path.exists() {
            bail!("Runtime config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        let runtimes_json: RuntimesJson = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        for runtime in &runtimes_json.runtimes {
            if runtime.image.trim().is_empty() {
                bail!("Runtime '{}' has an empty image", runtime.name);
            }
        }

        Ok(Self::new(runtimes_json.runtimes, default_image, policy))
    }

    /// Like [`load`](Self::load), but a missing file yields an empty registry
    pub fn load_or_default(config_path: &Path, default_image: &str, policy: SandboxPolicy) -> Result<Self> {
        if !config_path.exists() {
            warn!(
                path = %config_path.display(),
                "Runtime config not found; every image runs with the Python harness"
            );
            return Ok(Self::new(Vec::new(), default_image, policy));
        }
        Self::load(config_path, default_image, policy)
    }

    /// Registry and policy described by the environment
    pub fn from_config(config: &Config) -> Result<Self> {
        let policy = sandbox_policy(config)?;
        Self::load_or_default(&config.runtimes_config, &config.default_runtime_image, policy)
    }

    /// Profile for a requested image (or runtime name); `None` means the default image
    pub fn resolve(&self, requested: Option<&str>) -> RuntimeProfile {
        let requested = requested
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(&self.default_image);

        let known = self
            .runtimes
            .iter()
            .find(|r| r.image == requested || r.name == requested);

        match known {
            Some(runtime) => {
                let mut policy = self.policy.clone();
                if let Some(memory) = runtime.memory_limit_mb {
                    policy.memory_limit_mb = memory;
                }
                if let Some(cpu) = runtime.cpu_limit {
                    policy.cpu_limit = cpu;
                }
                if let Some(pids) = runtime.pids_limit {
                    policy.pids_limit = pids;
                }
                RuntimeProfile {
                    image: runtime.image.clone(),
                    language: runtime.language,
                    policy,
                }
            }
            None => RuntimeProfile {
                image: requested.to_string(),
                language: Language::Python,
                policy: self.policy.clone(),
            },
        }
    }

    pub fn default_image(&self) -> &str {
        &self.default_image
    }

    /// List configured runtime names
    pub fn list_runtimes(&self) -> Vec<String> {
        self.runtimes.iter().map(|r| r.name.clone()).collect()
    }
}

/// Build the sandbox policy from environment configuration
///
/// `seccomp` is `default`, `unconfined`, or a path to a JSON profile.
pub fn sandbox_policy(config: &Config) -> Result<SandboxPolicy> {
    if config.timeout_ms == 0 {
        bail!("SANDBOX_TIMEOUT_MS must be positive");
    }
    if config.memory_limit_mb == 0 || config.pids_limit <= 0 || config.cpu_limit <= 0.0 {
        bail!("Sandbox resource limits must be positive");
    }

    let seccomp = match config.seccomp.trim() {
        "" | "default" => SeccompPolicy::EngineDefault,
        "unconfined" => {
            warn!("SANDBOX_SECCOMP=unconfined: submissions run without a syscall filter");
            SeccompPolicy::Unconfined
        }
        path => {
            let profile = fs::read_to_string(path)
                .with_context(|| format!("Failed to read seccomp profile {}", path))?;
            let parsed: serde_json::Value = serde_json::from_str(&profile)
                .with_context(|| format!("Seccomp profile {} is not valid JSON", path))?;
            info!(path, "Loaded custom seccomp profile");
            // The engine wants the document inline, without newlines
            SeccompPolicy::Profile(parsed.to_string())
        }
    };

    Ok(SandboxPolicy {
        memory_limit_mb: config.memory_limit_mb,
        pids_limit: config.pids_limit,
        cpu_limit: config.cpu_limit,
        timeout: Duration::from_millis(config.timeout_ms),
        tmpfs_size_mb: config.tmpfs_size_mb,
        seccomp,
        workspace_root: config.workspace_root.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn registry() -> RuntimeRegistry {
        RuntimeRegistry::new(
            vec![
                RuntimeConfig {
                    name: "python".to_string(),
                    image: "python:3.12-slim".to_string(),
                    language: Language::Python,
                    memory_limit_mb: None,
                    cpu_limit: None,
                    pids_limit: None,
                },
                RuntimeConfig {
                    name: "node".to_string(),
                    image: "node:20-alpine".to_string(),
                    language: Language::JavaScript,
                    memory_limit_mb: Some(512),
                    cpu_limit: None,
                    pids_limit: Some(64),
                },
            ],
            "python:3.12-slim",
            SandboxPolicy::default(),
        )
    }

    #[test]
    fn test_resolve_default_image() {
        let profile = registry().resolve(None);
        assert_eq!(profile.image, "python:3.12-slim");
        assert_eq!(profile.language, Language::Python);
        assert_eq!(profile.policy, SandboxPolicy::default());
    }

    #[test]
    fn test_resolve_applies_overrides() {
        let registry = registry();
        let by_image = registry.resolve(Some("node:20-alpine"));
        let by_name = registry.resolve(Some("node"));

        assert_eq!(by_image, by_name);
        assert_eq!(by_image.language, Language::JavaScript);
        assert_eq!(by_image.policy.memory_limit_mb, 512);
        assert_eq!(by_image.policy.pids_limit, 64);
        assert_eq!(by_image.policy.cpu_limit, 1.0);
    }

    #[test]
    fn test_resolve_unknown_image() {
        let profile = registry().resolve(Some("myorg/python-numpy:1"));
        assert_eq!(profile.image, "myorg/python-numpy:1");
        assert_eq!(profile.language, Language::Python);
    }

    #[test]
    fn test_load_runtimes_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"runtimes": [{{"name": "node", "image": "node:20-alpine", "language": "javascript", "cpu_limit": 0.5}}]}}"#
        )
        .unwrap();

        let registry = RuntimeRegistry::load(file.path(), "python:3.12-slim", SandboxPolicy::default()).unwrap();
        assert_eq!(registry.list_runtimes(), vec!["node"]);
        assert_eq!(registry.resolve(Some("node")).policy.cpu_limit, 0.5);
    }

    #[test]
    fn test_load_missing_file() {
        let missing = Path::new("/nonexistent/runtimes.json");
        assert!(RuntimeRegistry::load(missing, "python:3.12-slim", SandboxPolicy::default()).is_err());

        let registry = RuntimeRegistry::load_or_default(missing, "python:3.12-slim", SandboxPolicy::default()).unwrap();
        assert!(registry.list_runtimes().is_empty());
        assert_eq!(registry.default_image(), "python:3.12-slim");
    }

    #[test]
    fn test_sandbox_policy_from_config() {
        let mut config = Config::default();
        config.seccomp = "default".to_string();
        config.timeout_ms = 2_500;
        let policy = sandbox_policy(&config).unwrap();
        assert_eq!(policy.timeout, Duration::from_millis(2_500));
        assert_eq!(policy.seccomp, SeccompPolicy::EngineDefault);

        config.seccomp = "unconfined".to_string();
        assert_eq!(sandbox_policy(&config).unwrap().seccomp, SeccompPolicy::Unconfined);

        let mut profile = tempfile::NamedTempFile::new().unwrap();
        write!(profile, "{{\n  \"defaultAction\": \"SCMP_ACT_ERRNO\"\n}}").unwrap();
        config.seccomp = profile.path().display().to_string();
        assert_eq!(
            sandbox_policy(&config).unwrap().seccomp,
            SeccompPolicy::Profile("{\"defaultAction\":\"SCMP_ACT_ERRNO\"}".to_string())
        );

        config.seccomp = "/nonexistent/seccomp.json".to_string();
        assert!(sandbox_policy(&config).is_err());

        config.seccomp = "default".to_string();
        config.timeout_ms = 0;
        assert!(sandbox_policy(&config).is_err());
    }
}
