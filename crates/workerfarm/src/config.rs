use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use workerfarm_core::{FarmError, Result};

/// How to start one child worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSpec {
    /// Executable hosting the task modules, e.g. `farm-worker`
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Task module the child loads, passed as `--module <name>`
    pub module: String,
    pub env: HashMap<String, String>,
}

impl Default for WorkerSpec {
    fn default() -> Self {
        WorkerSpec {
            program: PathBuf::from("farm-worker"),
            args: Vec::new(),
            module: "echo".to_string(),
            env: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FarmConfig {
    /// Serve calls in-process until remote workers are ready
    pub use_local_worker: bool,
    /// Ping every spawned worker right away to bring it to idle
    pub warm_workers: bool,
    pub min_workers: usize,
    /// Upper bound on remote workers; `None` means host parallelism,
    /// `Some(0)` means local-only
    pub max_workers: Option<usize>,
    pub max_concurrent_calls_per_worker: usize,
    /// Replacement processes spawned before the pool gives up
    pub max_respawns: usize,
    pub shutdown_grace_ms: u64,
    /// Ready remote workers needed before routing leaves the local worker
    pub remote_switch_threshold: Option<usize>,
    pub worker: WorkerSpec,
}

impl Default for FarmConfig {
    fn default() -> Self {
        FarmConfig {
            use_local_worker: true,
            warm_workers: true,
            min_workers: 1,
            max_workers: None,
            max_concurrent_calls_per_worker: 30,
            max_respawns: 3,
            shutdown_grace_ms: 5000,
            remote_switch_threshold: None,
            worker: WorkerSpec::default(),
        }
    }
}

impl FarmConfig {
    /// Default configuration running `module` inside `program`
    pub fn for_module(program: impl Into<PathBuf>, module: impl Into<String>) -> Self {
        FarmConfig {
            worker: WorkerSpec {
                program: program.into(),
                module: module.into(),
                ..WorkerSpec::default()
            },
            ..FarmConfig::default()
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: FarmConfig = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker.module.is_empty() {
            return Err(FarmError::Config("worker.module must not be empty".into()));
        }
        if self.max_concurrent_calls_per_worker == 0 {
            return Err(FarmError::Config(
                "max_concurrent_calls_per_worker must be at least 1".into(),
            ));
        }

        match self.max_workers {
            Some(0) if !self.use_local_worker => Err(FarmError::Config(
                "max_workers = 0 leaves no worker to run calls; enable use_local_worker".into(),
            )),
            Some(max) if max > 0 && self.min_workers > max => Err(FarmError::Config(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, max
            ))),
            _ => Ok(()),
        }
    }

    /// Number of remote workers the farm provisions
    pub fn target_pool_size(&self) -> usize {
        let host = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        match self.max_workers {
            Some(0) => 0,
            Some(max) => host.clamp(self.min_workers.min(max), max),
            None => host.max(self.min_workers),
        }
    }

    /// Ready workers required before routing switches to the pool
    pub fn switch_threshold(&self, pool_size: usize) -> usize {
        let default = if self.warm_workers { pool_size } else { 1 };
        self.remote_switch_threshold
            .unwrap_or(default)
            .clamp(1, pool_size.max(1))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_pool_size_bounds() {
        let host = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

        let config = FarmConfig {
            max_workers: Some(2),
            min_workers: 1,
            ..FarmConfig::default()
        };
        assert_eq!(config.target_pool_size(), host.clamp(1, 2));

        let config = FarmConfig {
            max_workers: None,
            min_workers: host + 3,
            ..FarmConfig::default()
        };
        assert_eq!(config.target_pool_size(), host + 3);

        let config = FarmConfig {
            max_workers: Some(0),
            ..FarmConfig::default()
        };
        assert_eq!(config.target_pool_size(), 0);
    }

    #[test]
    fn test_switch_threshold_policy() {
        let mut config = FarmConfig::default();
        assert_eq!(config.switch_threshold(4), 4);

        config.warm_workers = false;
        assert_eq!(config.switch_threshold(4), 1);

        config.remote_switch_threshold = Some(9);
        assert_eq!(config.switch_threshold(4), 4);

        config.remote_switch_threshold = Some(0);
        assert_eq!(config.switch_threshold(4), 1);
    }

    #[test]
    fn test_validate_rejects_empty_farm() {
        let config = FarmConfig {
            max_workers: Some(0),
            use_local_worker: false,
            ..FarmConfig::default()
        };
        assert!(matches!(config.validate(), Err(FarmError::Config(_))));

        let config = FarmConfig {
            max_workers: Some(2),
            min_workers: 3,
            ..FarmConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(FarmConfig::default().validate().is_ok());
    }

    #[test]
    fn test_from_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "warm_workers: false\nmax_workers: 2\nworker:\n  program: /usr/bin/farm-worker\n  module: ipc\n"
        )
        .unwrap();

        let config = FarmConfig::from_file(file.path()).unwrap();
        assert!(!config.warm_workers);
        assert!(config.use_local_worker);
        assert_eq!(config.max_workers, Some(2));
        assert_eq!(config.max_concurrent_calls_per_worker, 30);
        assert_eq!(config.worker.module, "ipc");
        assert_eq!(config.worker.program, PathBuf::from("/usr/bin/farm-worker"));
    }

    #[test]
    fn test_from_file_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "use_local_worker: false\nmax_workers: 0\n").unwrap();
        assert!(FarmConfig::from_file(file.path()).is_err());
    }
}
