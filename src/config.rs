//! Configuration system using Figment
//!
//! Strongly-typed settings are layered from:
//! 1. Built-in defaults (the values the instruments were characterised with)
//! 2. A TOML file (`config/default.toml` unless another path is given)
//! 3. Environment variables prefixed with `KEYSIGHT_DAQ_`
//!
//! # Environment Variable Overrides
//!
//! Nested keys are separated by a double underscore:
//!
//! ```text
//! KEYSIGHT_DAQ_APPLICATION__LOG_LEVEL=debug
//! KEYSIGHT_DAQ_LCR__RESOURCE=GPIB0::18::INSTR
//! KEYSIGHT_DAQ_ANALYZER__GATE_SWEEP__STEP=0.05
//! ```
//!
//! # Example
//!
//! ```no_run
//! use keysight_daq::config::Settings;
//!
//! let settings = Settings::load_from("config/default.toml")?;
//! println!("LCR meter at {}", settings.lcr.resource);
//! # Ok::<(), keysight_daq::error::DaqError>(())
//! ```

use crate::adapters::AdapterConfig;
use crate::error::{AppResult, DaqError};
use crate::instrument::{AnalyzerConfig, Compliance, LcrConfig, TerminalRoles};
use crate::sweep::{BiasSweep, GateSweep};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "KEYSIGHT_DAQ_";

/// Top-level settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Bus settings shared by both sessions
    pub adapter: AdapterConfig,
    /// LCR meter
    pub lcr: LcrSettings,
    /// Parameter analyzer
    pub analyzer: AnalyzerSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "keysight_daq".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// LCR meter section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LcrSettings {
    /// VISA resource string
    pub resource: String,
    /// Measurement settings
    pub measurement: LcrConfig,
    /// DC bias range for C-V sweeps
    pub bias_sweep: BiasSweep,
}

impl Default for LcrSettings {
    fn default() -> Self {
        Self {
            resource: "GPIB0::18::INSTR".to_string(),
            measurement: LcrConfig::default(),
            bias_sweep: BiasSweep::default(),
        }
    }
}

/// Parameter analyzer section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerSettings {
    /// VISA resource string
    pub resource: String,
    /// Integration, averaging and static bias
    pub measurement: AnalyzerConfig,
    /// SMU channel of each terminal
    pub roles: TerminalRoles,
    /// Compliance currents
    pub compliance: Compliance,
    /// Gate voltage range
    pub gate_sweep: GateSweep,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            resource: "GPIB0::17::INSTR".to_string(),
            measurement: AnalyzerConfig::default(),
            roles: TerminalRoles::default(),
            compliance: Compliance::default(),
            gate_sweep: GateSweep::default(),
        }
    }
}

impl Settings {
    /// Loads settings from [`DEFAULT_CONFIG_PATH`].
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Loads settings from a specific file path.
    ///
    /// A missing file is not an error; defaults and environment overrides
    /// still apply.
    ///
    /// # Errors
    ///
    /// `Config` if the file or an override cannot be parsed, `Configuration`
    /// if a value fails validation.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Timeout is non-zero
    /// - Resources are not empty and not shared between instruments
    /// - Instrument settings are within range
    /// - Sweep steps are positive
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.adapter.timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "adapter.timeout_ms must be > 0".to_string(),
            ));
        }

        for (section, resource) in [("lcr", &self.lcr.resource), ("analyzer", &self.analyzer.resource)] {
            if resource.trim().is_empty() {
                return Err(DaqError::Configuration(format!(
                    "{}.resource cannot be empty",
                    section
                )));
            }
        }

        if self
            .lcr
            .resource
            .trim()
            .eq_ignore_ascii_case(self.analyzer.resource.trim())
        {
            return Err(DaqError::Configuration(format!(
                "lcr.resource and analyzer.resource are both '{}'; each instrument needs its own address",
                self.lcr.resource.trim()
            )));
        }

        let section = |name: &'static str| {
            move |err: DaqError| DaqError::Configuration(format!("{}: {}", name, err))
        };
        self.lcr.measurement.validate().map_err(section("lcr.measurement"))?;
        self.lcr.bias_sweep.linear().map_err(section("lcr.bias_sweep"))?;
        self.analyzer
            .measurement
            .validate()
            .map_err(section("analyzer.measurement"))?;
        self.analyzer.roles.validate().map_err(section("analyzer.roles"))?;
        self.analyzer
            .compliance
            .validate()
            .map_err(section("analyzer.compliance"))?;
        self.analyzer
            .gate_sweep
            .gate_source(self.analyzer.measurement.vs)
            .map_err(section("analyzer.gate_sweep"))?;

        Ok(())
    }
}
