//! Configuration loading.
//!
//! Sources (applied in order, later sources override earlier ones):
//!
//! 1. `/etc/queue-leveler/service.yaml`: system-wide defaults
//! 2. `./config/service.yaml`: deployment-local override
//! 3. Path given by the `QL_CONFIG_FILE` environment variable
//! 4. Environment variables prefixed `QL__` with `__` separators,
//!    e.g. `QL__PROCESSOR__MAX_CONCURRENT_MESSAGES=20`
//!
//! Every section has serde defaults, so missing files produce a valid
//! in-memory configuration. A malformed file or an uncoercible environment
//! value is a hard error.

use config::builder::{ConfigBuilder, DefaultState};
use config::{Environment, File, FileFormat};
use queue_leveler_core::{ConfigurationError, LevelerConfig};

/// Environment variable naming an explicit configuration file
pub const CONFIG_FILE_ENV: &str = "QL_CONFIG_FILE";

/// Prefix of configuration environment variables
pub const ENV_PREFIX: &str = "QL";

/// Load and validate configuration from the standard sources
pub fn load(explicit_path: Option<&str>) -> Result<LevelerConfig, ConfigurationError> {
    let mut builder = config::Config::builder()
        .add_source(
            File::with_name("/etc/queue-leveler/service")
                .required(false)
                .format(FileFormat::Yaml),
        )
        .add_source(
            File::with_name("config/service")
                .required(false)
                .format(FileFormat::Yaml),
        );

    if let Some(path) = explicit_path.filter(|p| !p.is_empty()) {
        builder = builder.add_source(File::with_name(path).required(true).format(FileFormat::Yaml));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true),
    );

    from_builder(builder)
}

/// Build, deserialize and validate
pub fn from_builder(
    builder: ConfigBuilder<DefaultState>,
) -> Result<LevelerConfig, ConfigurationError> {
    let config = builder.build().map_err(|e| ConfigurationError::Parsing {
        message: e.to_string(),
    })?;

    let leveler: LevelerConfig =
        config
            .try_deserialize()
            .map_err(|e| ConfigurationError::Parsing {
                message: e.to_string(),
            })?;

    leveler.validate()?;
    Ok(leveler)
}

#[cfg(test)]
#[path = "settings_tests.rs"]
mod tests;
