use std::path::Path;

use crate::config::schema::OrchestratorConfig;
use crate::coordinator::dag::{prerequisites, Prereq};
use crate::error::ConfigError;
use crate::stage::{QueueName, Stage};

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<OrchestratorConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<OrchestratorConfig, ConfigError> {
    let config: OrchestratorConfig = serde_json::from_str(content)?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &OrchestratorConfig) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.work_directory.trim().is_empty() {
        return Err(ConfigError::Validation {
            message: "work_directory must not be empty".to_string(),
        });
    }

    if config.finalize_max_attempts == 0 {
        return Err(ConfigError::Validation {
            message: "finalize_max_attempts must be at least 1".to_string(),
        });
    }

    if config.dispatcher_threads == 0 {
        return Err(ConfigError::Validation {
            message: "dispatcher_threads must be at least 1".to_string(),
        });
    }

    if config.event_capacity == 0 {
        return Err(ConfigError::Validation {
            message: "event_capacity must be at least 1".to_string(),
        });
    }

    for queue in QueueName::ALL {
        if config.workers_for(queue) == 0 {
            return Err(ConfigError::Validation {
                message: format!("Queue '{}' needs at least one worker", queue),
            });
        }
    }

    let mut total_weight = 0u32;
    for stage in Stage::ALL {
        let settings = config.stage(stage);
        total_weight += settings.weight as u32;

        if settings.max_attempts == 0 {
            return Err(ConfigError::InvalidStage {
                stage,
                reason: "max_attempts must be at least 1".to_string(),
            });
        }
        if settings.backoff_base_ms > settings.backoff_max_ms {
            return Err(ConfigError::InvalidStage {
                stage,
                reason: format!(
                    "backoff_base_ms ({}) exceeds backoff_max_ms ({})",
                    settings.backoff_base_ms, settings.backoff_max_ms
                ),
            });
        }
        if settings.timeout_secs == 0 {
            return Err(ConfigError::InvalidStage {
                stage,
                reason: "timeout_secs must be at least 1".to_string(),
            });
        }

        // An essential stage behind a required optional one could never run.
        if settings.essential {
            for prereq in prerequisites(stage) {
                if let Prereq::Completed(dep) = prereq {
                    if !config.stage(*dep).essential {
                        return Err(ConfigError::InvalidStage {
                            stage,
                            reason: format!(
                                "essential stage requires optional stage '{}' to complete",
                                dep
                            ),
                        });
                    }
                }
            }
        }
    }

    if total_weight != 100 {
        return Err(ConfigError::Validation {
            message: format!("Stage weights must sum to 100, got {}", total_weight),
        });
    }

    Ok(())
}
