//! Startup validation of [`AppConfig`].
//!
//! Every problem is collected so one run reports all of them.

use std::collections::HashSet;

use super::error::{ConfigResult, ConfigurationError};
use super::{AppConfig, DispatchBackend, StorageBackend};

#[derive(Debug)]
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire application configuration.
    pub fn validate(config: &AppConfig) -> ConfigResult<()> {
        let mut errors = Vec::new();
        Self::check_scheduler(config, &mut errors);
        Self::check_dispatch(config, &mut errors);
        Self::check_storage(config, &mut errors);
        Self::check_pipelines(config, &mut errors);
        ConfigurationError::from_list(errors)
    }

    fn check_scheduler(config: &AppConfig, errors: &mut Vec<ConfigurationError>) {
        if config.scheduler.interval_secs == 0 {
            errors.push(ConfigurationError::invalid(
                "scheduler.interval_secs must be positive",
                "Set PIPELINE__SCHEDULER__INTERVAL_SECS to at least 1",
            ));
        }
        if config.scheduler.tick_timeout_secs < config.dispatch.timeout_secs {
            errors.push(ConfigurationError::incompatible(
                format!("scheduler.tick_timeout_secs={}", config.scheduler.tick_timeout_secs),
                format!("dispatch.timeout_secs={}", config.dispatch.timeout_secs),
                "A tick must be able to wait out at least one dispatch call. \
                Raise the tick timeout or lower the dispatch timeout.",
            ));
        }
    }

    fn check_dispatch(config: &AppConfig, errors: &mut Vec<ConfigurationError>) {
        if config.dispatch.max_concurrent == 0 {
            errors.push(ConfigurationError::invalid(
                "dispatch.max_concurrent must be positive",
                "Set PIPELINE__DISPATCH__MAX_CONCURRENT to at least 1",
            ));
        }
        let has_url = config
            .dispatch
            .redis_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty());
        if config.dispatch.backend == DispatchBackend::Redis && !has_url {
            errors.push(ConfigurationError::missing_required(
                "dispatch.redis_url",
                "dispatch.backend = redis",
                "PIPELINE__DISPATCH__REDIS_URL",
            ));
        }
    }

    fn check_storage(config: &AppConfig, errors: &mut Vec<ConfigurationError>) {
        let has_path = config
            .storage
            .path
            .as_ref()
            .is_some_and(|path| !path.as_os_str().is_empty());
        if config.storage.backend == StorageBackend::Sqlite && !has_path {
            errors.push(ConfigurationError::missing_required(
                "storage.path",
                "storage.backend = sqlite",
                "PIPELINE__STORAGE__PATH",
            ));
        }
    }

    fn check_pipelines(config: &AppConfig, errors: &mut Vec<ConfigurationError>) {
        let mut seen = HashSet::new();
        for pipeline in &config.pipelines {
            if !seen.insert(pipeline.id.as_str()) {
                errors.push(ConfigurationError::invalid(
                    format!("pipeline '{}' is declared more than once", pipeline.id),
                    "Give every [[pipelines]] entry a unique id",
                ));
            }
        }

        for pipeline in &config.pipelines {
            for prerequisite in &pipeline.prerequisites {
                if !seen.contains(prerequisite.as_str()) {
                    errors.push(ConfigurationError::invalid(
                        format!(
                            "pipeline '{}' requires unknown pipeline '{prerequisite}'",
                            pipeline.id
                        ),
                        "Declare the prerequisite under [[pipelines]] or remove it",
                    ));
                }
            }
        }
    }
}
