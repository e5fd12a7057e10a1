use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const DEFAULT_SHELL: &str = "sh";
pub const DEFAULT_LOG_FILTER: &str = "cadence_daemon=info,cadence_scheduler=info";

/// Top-level config (cadence.toml + CADENCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub shell: ShellConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub store: StoreConfig,
}

/// Where the job set is persisted between runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub mode: StoreMode,
    /// File path (`file`, `sqlite`) or directory path (`directory`).
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mode: StoreMode::default(),
            path: default_store_path(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StoreMode {
    /// One document holding every job.
    #[default]
    File,
    /// One document per job inside a directory.
    Directory,
    /// A SQLite database with one row per job.
    Sqlite,
}

/// Shell used by the host to run `sh` script lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellConfig {
    #[serde(default = "default_shell")]
    pub program: String,
    /// Arguments placed before the command line, e.g. `["-c"]`.
    #[serde(default = "default_shell_args")]
    pub args: Vec<String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            program: default_shell(),
            args: default_shell_args(),
        }
    }
}

fn default_shell() -> String {
    DEFAULT_SHELL.to_string()
}
fn default_shell_args() -> Vec<String> {
    vec!["-c".to_string()]
}
fn default_store_path() -> String {
    format!("{}/jobs.json", cadence_home())
}

fn cadence_home() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.cadence", home)
}

impl CadenceConfig {
    /// Load config from a TOML file with CADENCE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.cadence/cadence.toml
    ///
    /// A missing file is not an error; defaults fill every absent key.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);
        debug!(path = %path, "loading config");

        Self::figment(&path)
            .extract()
            .map_err(|e| crate::error::CadenceError::Config(e.to_string()))
    }

    fn figment(path: &str) -> Figment {
        Figment::from(Serialized::defaults(CadenceConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("CADENCE_").split("_"))
    }
}

fn default_config_path() -> String {
    format!("{}/cadence.toml", cadence_home())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = CadenceConfig::load(path.to_str()).unwrap();

        assert_eq!(config.scheduler.store.mode, StoreMode::File);
        assert!(config.scheduler.store.path.ends_with("jobs.json"));
        assert_eq!(config.shell.program, "sh");
        assert_eq!(config.shell.args, vec!["-c".to_string()]);
    }

    #[test]
    fn toml_overrides_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadence.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[scheduler.store]\nmode = \"directory\"\npath = \"/var/lib/cadence/jobs\"\n\n[shell]\nprogram = \"bash\""
        )
        .unwrap();

        let config = CadenceConfig::load(path.to_str()).unwrap();
        assert_eq!(config.scheduler.store.mode, StoreMode::Directory);
        assert_eq!(config.scheduler.store.path, "/var/lib/cadence/jobs");
        assert_eq!(config.shell.program, "bash");
        // unset keys keep their defaults
        assert_eq!(config.shell.args, vec!["-c".to_string()]);
    }

    #[test]
    fn invalid_mode_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cadence.toml");
        std::fs::write(&path, "[scheduler.store]\nmode = \"tape\"\n").unwrap();

        let err = CadenceConfig::load(path.to_str()).unwrap_err();
        assert!(matches!(err, crate::error::CadenceError::Config(ref msg) if msg.contains("tape")));
    }
}
