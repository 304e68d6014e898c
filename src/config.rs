//! Typed configuration surface the core needs to construct itself: module
//! counts, the gateway endpoint, and the slave hardware-id mapping.
//!
//! Loading and validation follow the teacher's figment + validator pattern;
//! the YAML credential/mapping shapes the original implementation used
//! outside spec.md's scope are not loaded here.

use std::collections::HashMap;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Top-level configuration for the master controller.
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct MasterConfig {
    #[validate(range(min = 1, max = 16))]
    pub number_of_battery_modules: u32,

    #[validate(range(min = 1, max = 24))]
    pub number_of_serial_cells: u32,

    #[validate(nested)]
    pub gateway: GatewayConfig,

    pub slave_mapping: HashMap<u32, SlaveMappingEntry>,

    #[validate(nested)]
    pub telemetry: TelemetryConfig,
}

/// Connection details for the slave transport (spec.md §6 deliberately
/// leaves the wire protocol unspecified past topic strings; `endpoint`
/// captures whatever address the chosen gateway implementation needs).
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct GatewayConfig {
    #[validate(length(min = 1))]
    pub endpoint: String,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,
}

/// Physical slave hardware id mapped to logical module index, plus which
/// slave (if any) owns the pack-total voltage/current measurement.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct SlaveMappingEntry {
    pub module_index: u32,
    #[serde(default)]
    pub total_voltage_measurer: bool,
    #[serde(default)]
    pub total_current_measurer: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl MasterConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_env(None)
    }

    pub fn load_with_env(environment: Option<&str>) -> Result<Self> {
        let mut figment = Figment::new().merge(Toml::file("config/default.toml"));

        if let Some(env) = environment {
            figment = figment.merge(Toml::file(format!("config/{env}.toml")));
        }

        figment = figment.merge(Env::prefixed("BMS__").split("__"));

        let config: MasterConfig = figment.extract().context("failed to parse configuration")?;
        config
            .validate()
            .context("configuration validation failed")?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn loads_minimal_config_from_toml() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config/default.toml",
                r#"
                number_of_battery_modules = 2
                number_of_serial_cells = 12

                [gateway]
                endpoint = "mqtt://localhost:1883"

                [slave_mapping.1]
                module_index = 0
                total_voltage_measurer = true

                [slave_mapping.2]
                module_index = 1

                [telemetry]
                log_level = "info"
                "#,
            )?;
            let cfg = MasterConfig::load().unwrap();
            assert_eq!(cfg.number_of_battery_modules, 2);
            assert_eq!(cfg.slave_mapping.get(&1).unwrap().module_index, 0);
            assert!(cfg.slave_mapping.get(&1).unwrap().total_voltage_measurer);
            Ok(())
        });
    }

    #[test]
    fn rejects_too_many_modules() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config/default.toml",
                r#"
                number_of_battery_modules = 99
                number_of_serial_cells = 12

                [gateway]
                endpoint = "mqtt://localhost:1883"

                [telemetry]
                log_level = "info"
                "#,
            )?;
            assert!(MasterConfig::load().is_err());
            Ok(())
        });
    }

    #[test]
    fn env_override_wins_over_toml() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "config/default.toml",
                r#"
                number_of_battery_modules = 2
                number_of_serial_cells = 12

                [gateway]
                endpoint = "mqtt://localhost:1883"

                [telemetry]
                log_level = "info"
                "#,
            )?;
            jail.set_env("BMS__GATEWAY__ENDPOINT", "mqtt://override:1883");
            let cfg = MasterConfig::load().unwrap();
            assert_eq!(cfg.gateway.endpoint, "mqtt://override:1883");
            Ok(())
        });
    }
}
