//! Configuration for smu-ctl.
//!
//! This module provides TOML-based configuration with environment variable overrides.
//!
//! # Configuration Resolution
//!
//! Configuration is loaded from the following locations (in order of priority):
//!
//! 1. `--config <FILE>` on the command line
//! 2. `SMU_CTL_CONFIG` environment variable (explicit path)
//! 3. `./smu-ctl.toml` (current directory)
//! 4. The platform config directory, e.g. `~/.config/smu-ctl/config.toml`
//! 5. Built-in defaults (no file required)
//!
//! # Environment Overrides
//!
//! Common values can be overridden via environment variables.
//! The pattern is: `SMU_CTL_<SECTION>_<KEY>`
//!
//! Examples:
//! - `SMU_CTL_SERIAL_PORT=/dev/ttyACM0`
//! - `SMU_CTL_RECONNECT_MAX_ATTEMPTS=10`
//! - `SMU_CTL_LOGGING_DATA_DIR=/var/lib/smu`
//!
//! # Example
//!
//! ```rust,no_run
//! use smu_ctl::config::ConfigLoader;
//!
//! let loader = ConfigLoader::load(None)?;
//! let config = loader.config();
//! println!("Baud rate: {}", config.serial.baud_rate);
//! # Ok::<(), smu_ctl::config::ConfigError>(())
//! ```

mod error;
mod loader;
mod schema;

pub use error::{ConfigError, ConfigResult};
pub use loader::{
    get_default_config_dir, get_default_config_path, resolve_config_path, ConfigLoader,
};
pub use schema::{
    Config, DiscoveryConfig, LimitsConfig, LogFormat, LoggingConfig, PollerSection,
    ReconnectConfig, SerialConfig,
};
