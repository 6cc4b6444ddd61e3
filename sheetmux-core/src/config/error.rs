//! Errors and warnings raised while loading `sheetmux.yaml`.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("child command must not be empty")]
    EmptyCommand,

    /// `${VAR}` in the file names a variable that is not set.
    #[error("environment variable '{var}' not set (referenced by '{field}')")]
    MissingEnvVar { var: String, field: String },

    #[error("unsupported schema version {version}, expected 1")]
    UnsupportedSchemaVersion { version: u32 },

    #[error("YAML parse error: {0}")]
    ParseError(#[from] serde_saphyr::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Only raised for a path given explicitly on the command line or env.
    #[error("configuration file not found (searched: {searched:?})")]
    ConfigFileNotFound { searched: Vec<PathBuf> },

    #[error("configuration file is empty")]
    EmptyConfigFile,
}

/// Accepted, but worth a log line at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationWarning {
    /// `call_timeout: 0`.
    CallTimeoutDisabled,
    PipeliningEnabled { max_in_flight: usize },
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CallTimeoutDisabled => {
                f.write_str("call_timeout is 0; calls to a hung child never fail")
            }
            Self::PipeliningEnabled { max_in_flight } => write!(
                f,
                "max_in_flight is {max_in_flight}; the child must answer concurrent requests"
            ),
        }
    }
}

#[derive(Debug, Default)]
pub struct ValidationResult {
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn with_warnings(warnings: Vec<ValidationWarning>) -> Self {
        Self { warnings }
    }

    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_value_names_the_field() {
        let err = ConfigError::InvalidValue {
            field: "sessions.max_in_flight".into(),
            message: "must be at least 1".into(),
        };
        assert_eq!(
            err.to_string(),
            "invalid value for 'sessions.max_in_flight': must be at least 1"
        );
    }

    #[test]
    fn warnings_make_result_unclean() {
        assert!(ValidationResult::ok().is_clean());

        let result = ValidationResult::with_warnings(vec![ValidationWarning::PipeliningEnabled {
            max_in_flight: 4,
        }]);
        assert!(!result.is_clean());
        assert!(result.warnings[0].to_string().starts_with("max_in_flight is 4"));
    }
}
