//! Bridge configuration using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, optional)
//! 2. environment variables prefixed with `BART_BRIDGE_`, nested keys separated by `__`
//!
//! Every field has a default, so an empty or missing file yields a usable configuration.
//!
//! # Example
//! ```no_run
//! use bart_bridge::config::BridgeConfig;
//!
//! // BART_BRIDGE_STAGE__SCRIPT_NAME=pics.sh overrides the file
//! let config = BridgeConfig::load_from("bart_bridge.toml")?;
//! config.validate()?;
//! println!("script: {}", config.stage.script_file().display());
//! # Ok::<(), bart_bridge::error::BridgeError>(())
//! ```

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::engine::MIN_OUTPUT_CAPACITY;
use crate::error::{BridgeError, BridgeResult};
use crate::logging::OutputFormat;
use crate::remap::AxisMap;
use crate::script::{ReconParameters, DEFAULT_COMMAND_PREFIX};

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "BART_BRIDGE_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Reconstruction stage settings
    pub stage: StageConfig,
    /// tmpfs backing of the workspace
    pub tmpfs: TmpfsConfig,
    /// Logging settings
    pub logging: LoggingSettings,
    /// Reconstruction parameters used when the caller provides none
    pub parameters: ReconParameters,
}

/// Stage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageConfig {
    /// Directory under which per-invocation workspaces are created
    pub working_directory: PathBuf,
    /// Directory holding command scripts
    pub script_path: PathBuf,
    /// Script file name inside `script_path`
    pub script_name: String,
    /// Keep the workspace after the invocation
    pub retain_workspace: bool,
    /// Image series index attached to the output
    pub image_series: i32,
    /// Log incoming data dimensions at info level
    pub verbose: bool,
    /// Command prefix recognised in scripts
    pub command_prefix: String,
    /// Captured engine output capacity in bytes
    pub output_capacity: usize,
    /// Target engine axis for each pipeline axis
    pub axis_map: AxisMap,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            working_directory: PathBuf::from("/tmp/gadgetron/"),
            script_path: PathBuf::from("/usr/local/share/gadgetron/bart"),
            script_name: String::new(),
            retain_workspace: false,
            image_series: 0,
            verbose: false,
            command_prefix: DEFAULT_COMMAND_PREFIX.to_string(),
            output_capacity: MIN_OUTPUT_CAPACITY,
            axis_map: AxisMap::default(),
        }
    }
}

impl StageConfig {
    /// Full path of the command script.
    pub fn script_file(&self) -> PathBuf {
        self.script_path.join(&self.script_name)
    }
}

/// tmpfs settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TmpfsConfig {
    /// Mount a tmpfs on each workspace
    pub enabled: bool,
    /// Size of the mount in megabytes
    pub size_mb: u32,
}

impl Default for TmpfsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            size_mb: 50,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Logging level (trace, debug, info, warn, error)
    pub level: String,
    /// Output format
    pub format: OutputFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: OutputFormat::Pretty,
        }
    }
}

impl BridgeConfig {
    /// Load from `path` (if it exists) and the environment.
    pub fn load_from<P: AsRef<Path>>(path: P) -> BridgeResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    /// Load from the environment only.
    pub fn from_env() -> BridgeResult<Self> {
        Ok(Figment::from(Serialized::defaults(Self::default()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> BridgeResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(BridgeError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        if self.stage.script_name.trim().is_empty() {
            return Err(BridgeError::Config("stage.script_name is empty".into()));
        }

        let prefix = &self.stage.command_prefix;
        if prefix.is_empty() || prefix.chars().any(char::is_whitespace) {
            return Err(BridgeError::Config(format!(
                "Invalid command prefix '{prefix}': must be a single word"
            )));
        }

        if self.stage.output_capacity < MIN_OUTPUT_CAPACITY {
            return Err(BridgeError::Config(format!(
                "output_capacity {} is below the engine minimum of {MIN_OUTPUT_CAPACITY}",
                self.stage.output_capacity
            )));
        }

        if self.tmpfs.enabled && self.tmpfs.size_mb == 0 {
            return Err(BridgeError::Config("tmpfs.size_mb must be positive".into()));
        }

        self.stage
            .axis_map
            .validate()
            .map_err(|e| BridgeError::Config(format!("stage.axis_map: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_without_file() {
        Jail::expect_with(|_jail| {
            let config = BridgeConfig::load_from("missing.toml").unwrap();
            assert_eq!(config.stage.working_directory, PathBuf::from("/tmp/gadgetron/"));
            assert_eq!(config.tmpfs.size_mb, 50);
            assert_eq!(config.stage.command_prefix, "bart");
            assert_eq!(config.stage.axis_map, AxisMap::default());
            Ok(())
        });
    }

    #[test]
    fn file_and_env_merge() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "bridge.toml",
                r#"
                [stage]
                script_name = "pics.sh"
                retain_workspace = true
                axis_map = [0, 1, 2, 3, 5, 6, 7]

                [parameters]
                acc_factor_PE1 = 2
                reference_lines_PE1 = 24
                "#,
            )?;
            jail.set_env("BART_BRIDGE_TMPFS__SIZE_MB", "128");
            jail.set_env("BART_BRIDGE_LOGGING__LEVEL", "debug");

            let config = BridgeConfig::load_from("bridge.toml").unwrap();
            assert_eq!(config.stage.script_name, "pics.sh");
            assert!(config.stage.retain_workspace);
            assert_eq!(config.stage.axis_map, AxisMap::new([0, 1, 2, 3, 5, 6, 7]).unwrap());
            assert_eq!(config.parameters.acc_factor_PE1, 2);
            assert_eq!(config.tmpfs.size_mb, 128);
            assert_eq!(config.logging.level, "debug");
            config.validate().unwrap();
            Ok(())
        });
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = BridgeConfig::default();
        config.stage.script_name = "recon.sh".into();
        config.validate().unwrap();

        let mut bad = config.clone();
        bad.logging.level = "loud".into();
        assert!(matches!(bad.validate(), Err(BridgeError::Config(_))));

        let mut bad = config.clone();
        bad.stage.command_prefix = "bart tool".into();
        assert!(bad.validate().is_err());

        let mut bad = config.clone();
        bad.stage.output_capacity = 64;
        assert!(bad.validate().is_err());

        let mut bad = config;
        bad.stage.script_name.clear();
        assert!(bad.validate().is_err());
    }

    #[test]
    fn invalid_axis_map_is_a_config_error() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "bridge.toml",
                "[stage]\nscript_name = \"a.sh\"\naxis_map = [0, 1, 2, 3, 9, 8, 10]\n",
            )?;
            let config = BridgeConfig::load_from("bridge.toml").unwrap();
            assert!(matches!(config.validate(), Err(BridgeError::Config(_))));
            Ok(())
        });
    }

    #[test]
    fn script_file_joins_path_and_name() {
        let mut stage = StageConfig::default();
        stage.script_path = PathBuf::from("/opt/scripts");
        stage.script_name = "cs.sh".into();
        assert_eq!(stage.script_file(), PathBuf::from("/opt/scripts/cs.sh"));
    }
}
