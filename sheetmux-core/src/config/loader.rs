//! Configuration loading and validation.
//!
//! The file is optional. Without an explicit path, the default locations are
//! searched and a missing file simply means "run on defaults".

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use super::error::{ConfigError, ValidationResult, ValidationWarning};
use super::schema::Config;

/// Configuration file search paths (in priority order).
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Ok(path) = std::env::var("SHEETMUX_CONFIG") {
        paths.push(PathBuf::from(path));
    }

    paths.push(PathBuf::from("/etc/sheetmux/config.yaml"));
    paths.push(PathBuf::from("./sheetmux.yaml"));

    paths
}

/// Find the config file to load.
///
/// An explicit path that does not exist is an error. Otherwise the first
/// existing default path is returned, or `None` when there is none.
pub fn find_config_file(explicit_path: Option<&Path>) -> Result<Option<PathBuf>, ConfigError> {
    if let Some(path) = explicit_path {
        if path.exists() {
            return Ok(Some(path.to_path_buf()));
        }
        return Err(ConfigError::ConfigFileNotFound {
            searched: vec![path.to_path_buf()],
        });
    }

    Ok(default_config_paths().into_iter().find(|p| p.exists()))
}

/// Load configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path)?;

    if contents.trim().is_empty() {
        return Err(ConfigError::EmptyConfigFile);
    }

    let contents = substitute_env_vars(&contents)?;
    let config: Config = serde_saphyr::from_str(&contents)?;

    Ok(config)
}

/// Load and validate configuration.
pub fn load_and_validate(path: &Path) -> Result<(Config, ValidationResult), ConfigError> {
    let config = load_config(path)?;
    let result = validate(&config)?;
    Ok((config, result))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Environment Variable Substitution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

// SAFETY: .expect() on LazyLock with a compile-time literal regex pattern.
#[allow(clippy::expect_used)]
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
        .expect("env var pattern is a valid regex")
});

/// Substitute `${VAR}` and `${VAR:-default}` references.
///
/// A `${VAR}` with no default and no value set is an error.
pub fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let mut missing: Option<String> = None;

    let result = ENV_VAR_PATTERN.replace_all(content, |cap: &regex::Captures<'_>| {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => value,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                None => {
                    missing.get_or_insert_with(|| var_name.to_string());
                    String::new()
                }
            },
        }
    });

    if let Some(var) = missing {
        return Err(ConfigError::MissingEnvVar {
            var,
            field: "configuration".to_string(),
        });
    }

    Ok(result.into_owned())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Validate a configuration file in isolation.
///
/// Cross-field checks against defaults happen on the resolved
/// [`super::Settings`].
pub fn validate(config: &Config) -> Result<ValidationResult, ConfigError> {
    let mut warnings = Vec::new();

    if config.schema != 1 {
        return Err(ConfigError::UnsupportedSchemaVersion {
            version: config.schema,
        });
    }

    match config.sessions.max_in_flight {
        Some(0) => {
            return Err(ConfigError::InvalidValue {
                field: "sessions.max_in_flight".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Some(n) if n > 1 => {
            warnings.push(ValidationWarning::PipeliningEnabled { max_in_flight: n });
        }
        _ => {}
    }

    if config.sessions.call_timeout.is_some_and(|d| d.is_zero()) {
        warnings.push(ValidationWarning::CallTimeoutDisabled);
    }

    for (field, value) in [
        ("sessions.idle_timeout", config.sessions.idle_timeout),
        ("sessions.reaper_interval", config.sessions.reaper_interval),
    ] {
        if value.is_some_and(|d| d.is_zero()) {
            return Err(ConfigError::InvalidValue {
                field: field.to_string(),
                message: "must be greater than zero".to_string(),
            });
        }
    }

    if config
        .child
        .command
        .as_deref()
        .is_some_and(|c| c.trim().is_empty())
    {
        return Err(ConfigError::EmptyCommand);
    }

    Ok(ValidationResult::with_warnings(warnings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_env_var_pattern_compiles() {
        let _ = &*ENV_VAR_PATTERN;
    }

    #[test]
    fn test_parse_empty_sections() {
        let config: Config = serde_saphyr::from_str("schema: 1\n").unwrap();
        assert!(config.server.port.is_none());
        assert!(validate(&config).unwrap().is_clean());
    }

    #[test]
    fn test_parse_durations() {
        let yaml = "sessions:\n  idle_timeout: 90s\n  reaper_interval: 30\n";
        let config: Config = serde_saphyr::from_str(yaml).unwrap();
        assert_eq!(config.sessions.idle_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.sessions.reaper_interval, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = "sessions:\n  idle_timout: 90s\n";
        assert!(serde_saphyr::from_str::<Config>(yaml).is_err());
    }

    #[test]
    fn test_unsupported_schema_version() {
        let config: Config = serde_saphyr::from_str("schema: 2\n").unwrap();
        assert!(matches!(
            validate(&config),
            Err(ConfigError::UnsupportedSchemaVersion { version: 2 })
        ));
    }

    #[test]
    fn test_validate_zero_in_flight() {
        let config: Config = serde_saphyr::from_str("sessions:\n  max_in_flight: 0\n").unwrap();
        assert!(matches!(
            validate(&config),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_validate_warnings() {
        let yaml = "sessions:\n  max_in_flight: 4\n  call_timeout: 0\n";
        let config: Config = serde_saphyr::from_str(yaml).unwrap();
        let result = validate(&config).unwrap();
        assert_eq!(result.warnings.len(), 2);
    }

    #[test]
    #[serial]
    fn test_env_var_substitution_required() {
        unsafe {
            std::env::set_var("SHEETMUX_TEST_ROOT", "/srv/sheets");
        }
        let result = substitute_env_vars("files_root: ${SHEETMUX_TEST_ROOT}").unwrap();
        assert_eq!(result, "files_root: /srv/sheets");
        unsafe {
            std::env::remove_var("SHEETMUX_TEST_ROOT");
        }
    }

    #[test]
    #[serial]
    fn test_env_var_substitution_with_default() {
        unsafe {
            std::env::remove_var("SHEETMUX_TEST_MISSING");
        }
        let result = substitute_env_vars("port: ${SHEETMUX_TEST_MISSING:-8017}").unwrap();
        assert_eq!(result, "port: 8017");
    }

    #[test]
    #[serial]
    fn test_env_var_substitution_missing_required() {
        unsafe {
            std::env::remove_var("SHEETMUX_TEST_REQUIRED");
        }
        let result = substitute_env_vars("host: ${SHEETMUX_TEST_REQUIRED}");
        assert!(matches!(
            result,
            Err(ConfigError::MissingEnvVar { var, .. }) if var == "SHEETMUX_TEST_REQUIRED"
        ));
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "server:\n  port: 9100\nchild:\n  command: uvx").unwrap();
        let (config, result) = load_and_validate(file.path()).unwrap();
        assert_eq!(config.server.port, Some(9100));
        assert_eq!(config.child.command.as_deref(), Some("uvx"));
        assert!(result.is_clean());
    }

    #[test]
    fn test_load_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(matches!(
            load_config(file.path()),
            Err(ConfigError::EmptyConfigFile)
        ));
    }

    #[test]
    fn test_find_explicit_missing() {
        let result = find_config_file(Some(Path::new("/definitely/not/here.yaml")));
        assert!(matches!(result, Err(ConfigError::ConfigFileNotFound { .. })));
    }
}
