//! Configuration validation.

use scion_loader::helpers::{is_valid_name, wildcard_prefix};
use scion_loader::module::is_reserved;

use super::error::{ConfigError, ConfigResult};
use super::schema::{LoaderConfig, LogLevel, LogOutput, LoggingConfig, PluginSettings, ScionConfig};

/// Validates the entire configuration.
pub fn validate_config(config: &ScionConfig) -> ConfigResult<()> {
    validate_logging_config(&config.logging)?;
    validate_loader_config(&config.loader)?;
    for (name, settings) in &config.plugins {
        validate_plugin_settings(name, settings)?;
    }
    Ok(())
}

fn validate_logging_config(logging: &LoggingConfig) -> ConfigResult<()> {
    for (target, level) in &logging.filters {
        if target.is_empty() {
            return Err(ConfigError::missing_field("logging.filters.<target>"));
        }
        if !LogLevel::NAMES.contains(&level.to_lowercase().as_str()) {
            return Err(ConfigError::validation(format!(
                "invalid log level '{level}' for '{target}'. Valid values are: {:?}",
                LogLevel::NAMES
            )));
        }
    }

    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::missing_field("logging.file_path"));
    }
    Ok(())
}

fn validate_loader_config(loader: &LoaderConfig) -> ConfigResult<()> {
    for selector in &loader.autoload {
        if selector.trim().is_empty() {
            return Err(ConfigError::validation("autoload entries cannot be empty"));
        }
        let name = wildcard_prefix(selector).unwrap_or(selector);
        if !is_valid_name(name) {
            return Err(ConfigError::InvalidPluginName(selector.clone()));
        }
    }

    for hook in [&loader.default_entry_point, &loader.default_exit_point]
        .into_iter()
        .flatten()
    {
        if hook.is_empty() {
            return Err(ConfigError::validation(
                "default hook names cannot be empty, use null to disable them",
            ));
        }
    }

    if let Some(name) = loader.default_variables.keys().find(|name| is_reserved(name)) {
        return Err(ConfigError::reserved_variable("loader", name.as_str()));
    }
    Ok(())
}

fn validate_plugin_settings(name: &str, settings: &PluginSettings) -> ConfigResult<()> {
    if !is_valid_name(name) {
        return Err(ConfigError::InvalidPluginName(name.to_string()));
    }
    if let Some(dependency) = settings.requires.iter().find(|d| !is_valid_name(d)) {
        return Err(ConfigError::InvalidPluginName(dependency.clone()));
    }
    if let Some(variable) = settings.variables.keys().find(|v| is_reserved(v)) {
        return Err(ConfigError::reserved_variable(name, variable.as_str()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&ScionConfig::default()).is_ok());
    }

    #[test]
    fn test_invalid_filter_level() {
        let mut config = ScionConfig::default();
        config
            .logging
            .filters
            .insert("scion_loader".into(), "loud".into());
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_file_output_needs_path() {
        let mut config = ScionConfig::default();
        config.logging.output = LogOutput::File;
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn test_plugin_names() {
        let mut config = ScionConfig::default();
        config.plugins.insert("pkg..leaf".into(), PluginSettings::default());
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::InvalidPluginName(name)) if name == "pkg..leaf"
        ));

        let mut config = ScionConfig::default();
        config.loader.autoload = vec!["pkg.*".into(), "".into()];
        assert!(validate_config(&config).is_err());

        config.loader.autoload = vec!["pkg.*".into()];
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_reserved_variables() {
        let mut config = ScionConfig::default();
        let mut settings = PluginSettings::default();
        settings
            .variables
            .insert("__file__".into(), serde_json::Value::Null);
        config.plugins.insert("greeter".into(), settings);
        assert!(matches!(
            validate_config(&config),
            Err(ConfigError::ReservedVariable { owner, .. }) if owner == "greeter"
        ));

        let mut config = ScionConfig::default();
        config
            .loader
            .default_variables
            .insert("__loader__".into(), serde_json::Value::Null);
        assert!(validate_config(&config).is_err());
    }
}
