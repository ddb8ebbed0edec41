use crate::error::{GradingError, Result};
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Application configuration
/// Provides defaults with environment variable overrides
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub deployment_config: PathBuf,
    pub runtimes_config: PathBuf,
    pub default_runtime_image: String,
    pub timeout_ms: u64,
    pub memory_limit_mb: u32,
    pub pids_limit: i64,
    pub cpu_limit: f32,
    pub tmpfs_size_mb: u32,
    /// `default`, `unconfined`, or a path to a seccomp profile
    pub seccomp: String,
    pub workspace_root: Option<PathBuf>,
    pub analysis_api_base: String,
    pub analysis_api_key: Option<String>,
    pub reuse_context: bool,
}

impl Config {
    /// Defaults overridden by environment variables.
    ///
    /// A variable that is set but does not parse is a configuration error.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            deployment_config: env::var("DEPLOYMENT_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.deployment_config),
            runtimes_config: env::var("RUNTIMES_CONFIG")
                .map(PathBuf::from)
                .unwrap_or(defaults.runtimes_config),
            default_runtime_image: env::var("DEFAULT_RUNTIME_IMAGE")
                .unwrap_or(defaults.default_runtime_image),
            timeout_ms: parse_var("SANDBOX_TIMEOUT_MS")?.unwrap_or(defaults.timeout_ms),
            memory_limit_mb: parse_var("SANDBOX_MEMORY_MB")?.unwrap_or(defaults.memory_limit_mb),
            pids_limit: parse_var("SANDBOX_PIDS_LIMIT")?.unwrap_or(defaults.pids_limit),
            cpu_limit: parse_var("SANDBOX_CPU_LIMIT")?.unwrap_or(defaults.cpu_limit),
            tmpfs_size_mb: parse_var("SANDBOX_TMPFS_MB")?.unwrap_or(defaults.tmpfs_size_mb),
            seccomp: env::var("SANDBOX_SECCOMP").unwrap_or(defaults.seccomp),
            workspace_root: env::var("WORKSPACE_ROOT").ok().map(PathBuf::from),
            analysis_api_base: env::var("ANALYSIS_API_BASE").unwrap_or(defaults.analysis_api_base),
            analysis_api_key: env::var("ANALYSIS_API_KEY")
                .or_else(|_| env::var("OPENAI_API_KEY"))
                .ok()
                .filter(|k| !k.is_empty()),
            reuse_context: parse_flag("REUSE_CONTEXT")?.unwrap_or(defaults.reuse_context),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            deployment_config: PathBuf::from("config/deployment.json"),
            runtimes_config: PathBuf::from("config/runtimes.json"),
            default_runtime_image: "python:3.12-slim".to_string(),
            timeout_ms: 15_000,
            memory_limit_mb: 256,
            pids_limit: 128,
            cpu_limit: 1.0,
            tmpfs_size_mb: 64,
            seccomp: "default".to_string(),
            workspace_root: None,
            analysis_api_base: "https://api.openai.com/v1".to_string(),
            analysis_api_key: None,
            reuse_context: false,
        }
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| GradingError::config(format!("{}={:?} is invalid: {}", name, raw, e))),
        Err(_) => Ok(None),
    }
}

fn parse_flag(name: &str) -> Result<Option<bool>> {
    match env::var(name) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Ok(Some(true)),
            "false" | "0" => Ok(Some(false)),
            _ => Err(GradingError::config(format!(
                "{}={:?} is invalid: expected true/false/1/0",
                name, raw
            ))),
        },
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.timeout_ms, 15_000);
        assert_eq!(config.memory_limit_mb, 256);
        assert_eq!(config.pids_limit, 128);
        assert_eq!(config.cpu_limit, 1.0);
        assert_eq!(config.seccomp, "default");
        assert!(!config.reuse_context);
    }

    #[test]
    fn test_parse_var_rejects_garbage() {
        env::set_var("GRADEBOX_TEST_PARSE_VAR", "512MB");
        let err = parse_var::<u32>("GRADEBOX_TEST_PARSE_VAR").unwrap_err();
        assert!(err.to_string().contains("GRADEBOX_TEST_PARSE_VAR"));

        env::set_var("GRADEBOX_TEST_PARSE_VAR", " 42 ");
        assert_eq!(parse_var::<u64>("GRADEBOX_TEST_PARSE_VAR").unwrap(), Some(42));

        env::remove_var("GRADEBOX_TEST_PARSE_VAR");
        assert_eq!(parse_var::<u64>("GRADEBOX_TEST_PARSE_VAR").unwrap(), None);
    }

    #[test]
    fn test_from_env_names_the_bad_variable() {
        env::set_var("SANDBOX_TMPFS_MB", "64m");
        let err = Config::from_env().unwrap_err();
        env::remove_var("SANDBOX_TMPFS_MB");

        assert!(matches!(err, GradingError::Config(_)));
        assert!(err.to_string().contains("SANDBOX_TMPFS_MB"));
    }

    #[test]
    fn test_parse_flag() {
        env::set_var("GRADEBOX_TEST_FLAG", "TRUE");
        assert_eq!(parse_flag("GRADEBOX_TEST_FLAG").unwrap(), Some(true));
        env::set_var("GRADEBOX_TEST_FLAG", "0");
        assert_eq!(parse_flag("GRADEBOX_TEST_FLAG").unwrap(), Some(false));
        env::set_var("GRADEBOX_TEST_FLAG", "yes");
        assert!(parse_flag("GRADEBOX_TEST_FLAG").is_err());
        env::remove_var("GRADEBOX_TEST_FLAG");
    }
}
