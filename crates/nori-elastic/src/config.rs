use crate::elastic::PoolBounds;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Pool sizing and lifecycle configuration for [`crate::ElasticLsm`].
///
/// Fixed at open time. Every elastic pool starts at its minimum and is
/// allowed to grow up to `max_background_threads`.
///
/// Example YAML:
/// ```yaml
/// max_background_threads: 32
/// min_transactional_threads: 2
/// min_analytical_threads: 2
/// min_compaction_threads: 2
/// flush_threads: 1
/// shutdown_policy: drain
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticConfig {
    /// Upper bound for each elastic pool (default: 32)
    #[serde(default = "default_max_background_threads")]
    pub max_background_threads: usize,

    /// Floor for the pool serving put/delete/update/get (default: 2)
    #[serde(default = "default_min_threads")]
    pub min_transactional_threads: usize,

    /// Floor for the pool serving scans (default: 2)
    #[serde(default = "default_min_threads")]
    pub min_analytical_threads: usize,

    /// Floor for the low-priority pool running compactions (default: 2)
    #[serde(default = "default_min_threads")]
    pub min_compaction_threads: usize,

    /// Size of the high-priority flush pool (default: 1).
    /// Zero means flushes borrow the compaction pool.
    #[serde(default = "default_flush_threads")]
    pub flush_threads: usize,

    /// What happens to queued client tasks on shutdown (default: drain)
    #[serde(default)]
    pub shutdown_policy: ShutdownPolicy,

    /// Prefix for worker thread names (default: "nori-elastic")
    #[serde(default = "default_thread_name_prefix")]
    pub thread_name_prefix: String,
}

/// Fate of tasks still queued when shutdown begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    /// Execute every queued task before the workers exit.
    #[default]
    Drain,
    /// Fail queued tasks with `Error::ShuttingDown` without touching the engine.
    Abandon,
}

fn default_max_background_threads() -> usize {
    32
}

fn default_min_threads() -> usize {
    2
}

fn default_flush_threads() -> usize {
    1
}

fn default_thread_name_prefix() -> String {
    "nori-elastic".to_string()
}

impl Default for ElasticConfig {
    fn default() -> Self {
        Self {
            max_background_threads: default_max_background_threads(),
            min_transactional_threads: default_min_threads(),
            min_analytical_threads: default_min_threads(),
            min_compaction_threads: default_min_threads(),
            flush_threads: default_flush_threads(),
            shutdown_policy: ShutdownPolicy::default(),
            thread_name_prefix: default_thread_name_prefix(),
        }
    }
}

impl ElasticConfig {
    /// Loads and validates configuration from a YAML file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: ElasticConfig = serde_yaml::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.max_background_threads == 0 {
            return Err(Error::Config(
                "max_background_threads must be > 0".to_string(),
            ));
        }

        let minimums = [
            ("min_transactional_threads", self.min_transactional_threads),
            ("min_analytical_threads", self.min_analytical_threads),
            ("min_compaction_threads", self.min_compaction_threads),
        ];
        for (name, min) in minimums {
            if min == 0 {
                return Err(Error::Config(format!("{} must be > 0", name)));
            }
            if min > self.max_background_threads {
                return Err(Error::Config(format!(
                    "{} ({}) cannot exceed max_background_threads ({})",
                    name, min, self.max_background_threads
                )));
            }
        }

        if self.flush_threads > self.max_background_threads {
            return Err(Error::Config(format!(
                "flush_threads ({}) cannot exceed max_background_threads ({})",
                self.flush_threads, self.max_background_threads
            )));
        }

        if self.thread_name_prefix.is_empty() {
            return Err(Error::Config(
                "thread_name_prefix cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    pub fn transactional_bounds(&self) -> PoolBounds {
        PoolBounds::new(self.min_transactional_threads, self.max_background_threads)
    }

    pub fn analytical_bounds(&self) -> PoolBounds {
        PoolBounds::new(self.min_analytical_threads, self.max_background_threads)
    }

    pub fn compaction_bounds(&self) -> PoolBounds {
        PoolBounds::new(self.min_compaction_threads, self.max_background_threads)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_validates() {
        let config = ElasticConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_background_threads, 32);
        assert_eq!(config.min_transactional_threads, 2);
        assert_eq!(config.min_analytical_threads, 2);
        assert_eq!(config.min_compaction_threads, 2);
        assert_eq!(config.shutdown_policy, ShutdownPolicy::Drain);
    }

    #[test]
    fn test_min_exceeds_max() {
        let config = ElasticConfig {
            max_background_threads: 4,
            min_analytical_threads: 8,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_minimum_rejected() {
        let config = ElasticConfig {
            min_transactional_threads: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_flush_threads_allowed() {
        let config = ElasticConfig {
            flush_threads: 0,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bounds_follow_config() {
        let config = ElasticConfig {
            max_background_threads: 8,
            min_compaction_threads: 3,
            ..Default::default()
        };
        let bounds = config.compaction_bounds();
        assert_eq!(bounds.min, 3);
        assert_eq!(bounds.max, 8);
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "max_background_threads: 16\nmin_analytical_threads: 4\nshutdown_policy: abandon"
        )
        .unwrap();

        let config = ElasticConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.max_background_threads, 16);
        assert_eq!(config.min_analytical_threads, 4);
        // Unspecified fields keep their defaults
        assert_eq!(config.min_transactional_threads, 2);
        assert_eq!(config.flush_threads, 1);
        assert_eq!(config.shutdown_policy, ShutdownPolicy::Abandon);
    }

    #[test]
    fn test_load_rejects_invalid_yaml_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_background_threads: 1\nmin_compaction_threads: 2").unwrap();

        assert!(ElasticConfig::load_from_file(file.path()).is_err());
    }
}
