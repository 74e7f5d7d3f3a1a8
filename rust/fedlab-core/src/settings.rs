//! Settings shared by the researcher and the node services.
//!
//! Settings are read from a TOML file and can be overridden by environment variables: the
//! variable `FEDLAB_LOG__FILTER` overrides the `filter` key of the `[log]` section.

use std::{fmt, path::Path};

use config::{Config, ConfigError, Environment};
use serde::{
    de::{self, DeserializeOwned, Deserializer, Visitor},
    Deserialize,
};
use thiserror::Error;
use tracing_subscriber::filter::EnvFilter;
use validator::{Validate, ValidationErrors};

/// The prefix of the environment variables overriding settings.
pub const ENV_PREFIX: &str = "fedlab";

#[derive(Error, Debug)]
/// An error related to loading and validation of settings.
pub enum SettingsError {
    #[error("configuration loading failed: {0}")]
    Loading(#[from] ConfigError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationErrors),
}

/// Loads and validates settings from a configuration file and the environment.
///
/// # Errors
/// Fails when the loading of the configuration file or its validation failed.
pub fn load<S>(path: impl AsRef<Path>) -> Result<S, SettingsError>
where
    S: DeserializeOwned + Validate,
{
    let mut config = Config::new();
    config.merge(config::File::from(path.as_ref()))?;
    config.merge(Environment::with_prefix(ENV_PREFIX).separator("__"))?;
    let settings: S = config.try_into()?;
    settings.validate()?;
    Ok(settings)
}

#[derive(Debug, Deserialize)]
/// Logging settings.
pub struct LoggingSettings {
    /// A comma-separated list of logging directives.
    ///
    /// # Examples
    ///
    /// **TOML**
    /// ```text
    /// [log]
    /// filter = "info,fedlab_researcher=debug"
    /// ```
    ///
    /// **Environment variable**
    /// ```text
    /// FEDLAB_LOG__FILTER=info
    /// ```
    #[serde(deserialize_with = "deserialize_env_filter")]
    pub filter: EnvFilter,
}

fn deserialize_env_filter<'de, D>(deserializer: D) -> Result<EnvFilter, D::Error>
where
    D: Deserializer<'de>,
{
    struct EnvFilterVisitor;

    impl<'de> Visitor<'de> for EnvFilterVisitor {
        type Value = EnvFilter;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            write!(formatter, "a valid tracing filter directive")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            EnvFilter::try_new(value)
                .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(value), &self))
        }
    }

    deserializer.deserialize_str(EnvFilterVisitor)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[derive(Debug, Deserialize, Validate)]
    struct TestSettings {
        log: LoggingSettings,
        #[validate(range(min = 1))]
        rounds: u32,
    }

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_settings() {
        let file = write_config("rounds = 3\n[log]\nfilter = \"info\"\n");
        let settings: TestSettings = load(file.path()).unwrap();
        assert_eq!(settings.rounds, 3);
    }

    #[test]
    fn test_invalid_settings() {
        let file = write_config("rounds = 0\n[log]\nfilter = \"info\"\n");
        assert!(matches!(
            load::<TestSettings>(file.path()),
            Err(SettingsError::Validation(_))
        ));

        let file = write_config("rounds = 1\n");
        assert!(matches!(
            load::<TestSettings>(file.path()),
            Err(SettingsError::Loading(_))
        ));
    }
}
