//! Configuration loader with file resolution and environment override support.

use super::error::{ConfigError, ConfigResult};
use super::schema::Config;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Environment variable prefix for overrides
const ENV_PREFIX: &str = "SMU_CTL";

/// Config file name looked up in the working directory
const LOCAL_CONFIG_FILE: &str = "smu-ctl.toml";

/// Config file name inside the platform config directory
const CONFIG_FILE_NAME: &str = "config.toml";

/// Environment variable for explicit config path
const CONFIG_PATH_ENV: &str = "SMU_CTL_CONFIG";

/// Configuration loader with resolution and override logic.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    /// Resolved config file path (if any)
    pub config_path: Option<PathBuf>,
    /// The loaded configuration
    pub config: Config,
}

impl ConfigLoader {
    /// Load configuration using standard resolution order.
    ///
    /// Resolution priority (highest to lowest):
    /// 1. `explicit` (the `--config` flag); must exist
    /// 2. `SMU_CTL_CONFIG` environment variable
    /// 3. `./smu-ctl.toml`
    /// 4. `<platform config dir>/smu-ctl/config.toml`
    /// 5. Built-in defaults (no file required)
    ///
    /// Environment variables override file values; the result is validated.
    pub fn load(explicit: Option<&Path>) -> ConfigResult<Self> {
        if let Some(path) = explicit {
            if !path.exists() {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            return Self::load_from(path);
        }

        let config_path = resolve_config_path();
        let mut config = match config_path {
            Some(ref path) => load_from_file(path)?,
            None => Config::default(),
        };
        apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(Self { config_path, config })
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut config = load_from_file(&path)?;
        apply_env_overrides(&mut config)?;
        config.validate()?;

        Ok(Self {
            config_path: Some(path),
            config,
        })
    }

    /// Create a loader with default configuration (no file).
    pub fn with_defaults() -> Self {
        let mut config = Config::default();
        // Still apply env overrides even with defaults
        if apply_env_overrides(&mut config).is_err() || config.validate().is_err() {
            config = Config::default();
        }

        Self {
            config_path: None,
            config,
        }
    }

    /// Get the loaded configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Consume the loader and return the configuration.
    pub fn into_config(self) -> Config {
        self.config
    }
}

/// Resolve the configuration file path using standard locations.
pub fn resolve_config_path() -> Option<PathBuf> {
    // 1. Explicit environment variable
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(path);
        if path.exists() {
            return Some(path);
        }
    }

    // 2. Current directory
    let cwd_config = PathBuf::from(LOCAL_CONFIG_FILE);
    if cwd_config.exists() {
        return Some(cwd_config);
    }

    // 3. Platform config directory
    if let Some(app_config) = get_default_config_path() {
        if app_config.exists() {
            return Some(app_config);
        }
    }

    None
}

/// Get the platform-specific config directory for this application.
pub fn get_default_config_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "", "smu-ctl").map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the default config file path.
pub fn get_default_config_path() -> Option<PathBuf> {
    get_default_config_dir().map(|d| d.join(CONFIG_FILE_NAME))
}

/// Load configuration from a file.
fn load_from_file(path: &Path) -> ConfigResult<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
        path: path.to_path_buf(),
        source: e,
    })?;

    toml::from_str(&content).map_err(ConfigError::ParseError)
}

/// Read `SMU_CTL_<suffix>` and parse it, if set.
fn env_value<T: FromStr>(suffix: &str, what: &str) -> ConfigResult<Option<T>> {
    let var = format!("{ENV_PREFIX}_{suffix}");
    match std::env::var(&var) {
        Ok(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::env_parse(var, format!("Invalid {what}"))),
        Err(_) => Ok(None),
    }
}

/// Apply environment variable overrides to the configuration.
///
/// Environment variables follow the pattern: `SMU_CTL_<SECTION>_<KEY>`
/// For example:
/// - `SMU_CTL_SERIAL_BAUD_RATE=9600`
/// - `SMU_CTL_POLLER_INTERVAL_MS=250`
/// - `SMU_CTL_LOGGING_LEVEL=debug`
fn apply_env_overrides(config: &mut Config) -> ConfigResult<()> {
    // Serial overrides
    if let Some(val) = env_value::<String>("SERIAL_PORT", "port")? {
        config.serial.port = Some(val);
    }
    if let Some(val) = env_value("SERIAL_BAUD_RATE", "baud rate")? {
        config.serial.baud_rate = val;
    }
    if let Some(val) = env_value("SERIAL_TIMEOUT_MS", "timeout")? {
        config.serial.timeout_ms = val;
    }

    // Poller / reconnect overrides
    if let Some(val) = env_value("POLLER_INTERVAL_MS", "interval")? {
        config.poller.interval_ms = val;
    }
    if let Some(val) = env_value("RECONNECT_MAX_ATTEMPTS", "attempt count")? {
        config.reconnect.max_attempts = val;
    }

    // Logging overrides
    if let Some(val) = env_value::<String>("LOGGING_LEVEL", "log level")? {
        config.logging.level = val;
    }
    if let Some(val) = env_value::<PathBuf>("LOGGING_FILE", "path")? {
        config.logging.file = Some(val);
    }
    if let Some(val) = env_value::<PathBuf>("LOGGING_DATA_DIR", "path")? {
        config.logging.data_dir = val;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;
    use tempfile::tempdir;

    #[test]
    #[serial]
    fn test_default_loader() {
        let loader = ConfigLoader::with_defaults();
        assert_eq!(loader.config().serial.baud_rate, 115200);
        assert!(loader.config_path.is_none());
    }

    #[test]
    #[serial]
    fn test_env_override() {
        env::set_var("SMU_CTL_SERIAL_BAUD_RATE", "57600");
        env::set_var("SMU_CTL_LOGGING_LEVEL", "debug");

        let loader = ConfigLoader::with_defaults();
        assert_eq!(loader.config().serial.baud_rate, 57600);
        assert_eq!(loader.config().logging.level, "debug");

        env::remove_var("SMU_CTL_SERIAL_BAUD_RATE");
        env::remove_var("SMU_CTL_LOGGING_LEVEL");
    }

    #[test]
    #[serial]
    fn test_bad_env_value_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("smu.toml");
        std::fs::write(&path, "").unwrap();

        env::set_var("SMU_CTL_POLLER_INTERVAL_MS", "fast");
        let result = ConfigLoader::load_from(&path);
        env::remove_var("SMU_CTL_POLLER_INTERVAL_MS");

        assert!(matches!(result, Err(ConfigError::EnvParseError { .. })));
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("smu.toml");
        std::fs::write(
            &path,
            "[serial]\nport = \"/dev/ttyACM3\"\n\n[limits]\nmax_voltage = 12.0\n",
        )
        .unwrap();

        let loader = ConfigLoader::load(Some(&path)).unwrap();
        assert_eq!(loader.config_path.as_deref(), Some(path.as_path()));
        assert_eq!(loader.config().serial.port.as_deref(), Some("/dev/ttyACM3"));
        assert_eq!(loader.config().limits.max_voltage, 12.0);
    }

    #[test]
    #[serial]
    fn test_explicit_missing_file() {
        let result = ConfigLoader::load(Some(Path::new("/nonexistent/smu-ctl.toml")));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    #[serial]
    fn test_invalid_file_fails_validation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("smu.toml");
        std::fs::write(&path, "[reconnect]\nmultiplier = 0.25\n").unwrap();

        let result = ConfigLoader::load_from(&path);
        assert!(matches!(result, Err(ConfigError::ValidationError { .. })));
    }

    #[test]
    #[serial]
    fn test_config_env_var_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(&path, "[poller]\ninterval_ms = 250\n").unwrap();

        env::set_var("SMU_CTL_CONFIG", &path);
        let loader = ConfigLoader::load(None);
        env::remove_var("SMU_CTL_CONFIG");

        let loader = loader.unwrap();
        assert_eq!(loader.config().poller.interval_ms, 250);
    }
}
