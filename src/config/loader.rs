//! YAML loading of the engine configuration and job definitions.

use std::path::{Path, PathBuf};

use super::error::ConfigError;
use super::types::EngineConfig;
use crate::core::job::JobDefinition;
use crate::core::types::QueueName;

/// YAML configuration loader.
pub struct YamlLoader;

impl YamlLoader {
    /// Load and validate the engine configuration from a file.
    pub fn load_engine_config(path: impl AsRef<Path>) -> Result<EngineConfig, ConfigError> {
        let path = path.as_ref();
        let content = read_file(path)?;
        let config: EngineConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate the engine configuration from a YAML string.
    pub fn parse_engine_config(yaml: &str) -> Result<EngineConfig, ConfigError> {
        // An empty document means all defaults.
        let config: EngineConfig = if yaml.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(yaml)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a job definition, filling in `default_queue` when the document
    /// names no queue.
    pub fn parse_job_definition(
        yaml: &str,
        default_queue: &str,
    ) -> Result<JobDefinition, ConfigError> {
        let mut value: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        if let serde_yaml::Value::Mapping(mapping) = &mut value {
            let key = serde_yaml::Value::from("queue");
            if !mapping.contains_key(&key) {
                mapping.insert(key, serde_yaml::Value::from(default_queue));
            }
        }
        Ok(serde_yaml::from_value(value)?)
    }

    /// Load one job definition from a file and validate it against the
    /// configured queues.
    pub fn load_job_definition(
        path: impl AsRef<Path>,
        config: &EngineConfig,
    ) -> Result<JobDefinition, ConfigError> {
        let path = path.as_ref();
        let content = read_file(path)?;
        let definition = Self::parse_job_definition(&content, &config.default_queue).map_err(
            |e| match e {
                ConfigError::YamlError(source) => ConfigError::YamlFileError {
                    path: path.to_path_buf(),
                    source,
                },
                other => other,
            },
        )?;

        let queues: Vec<QueueName> = config.queue_set().names().to_vec();
        definition
            .validate(&queues)
            .map_err(|source| ConfigError::InvalidJob {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(definition)
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::FileReadError {
        path: path.to_path_buf(),
        source,
    })
}

/// Load all job definitions (`*.yaml`, `*.yml`) from a directory, sorted by
/// file name.
pub fn load_jobs_from_directory(
    dir: impl AsRef<Path>,
    config: &EngineConfig,
) -> Result<Vec<JobDefinition>, ConfigError> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        return Err(ConfigError::InvalidConfig(format!(
            "'{}' is not a directory",
            dir.display()
        )));
    }

    let dir_error = |source| ConfigError::DirReadError {
        path: dir.to_path_buf(),
        source,
    };
    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(dir_error)? {
        let path = entry.map_err(dir_error)?.path();
        if let Some(ext) = path.extension()
            && (ext == "yaml" || ext == "yml")
        {
            paths.push(path);
        }
    }
    paths.sort();

    let mut jobs = Vec::with_capacity(paths.len());
    for path in paths {
        jobs.push(YamlLoader::load_job_definition(&path, config)?);
    }
    Ok(jobs)
}
