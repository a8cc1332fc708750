use crate::error::BridgeError;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::{env, fs, path::Path, time::Duration};
use tracing::info;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Appliance-local timezone, used to decide which day a reading belongs to.
    pub timezone: Tz,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub device_index: usize,
    #[serde(default = "default_burner_count")]
    pub burner_count: usize,
    pub viessmann: ViessmannCreds,
    #[serde(default)]
    pub actions: Vec<ActionConfig>,
}

fn default_poll_interval_secs() -> u64 {
    300
}

fn default_burner_count() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViessmannCreds {
    pub client_id: String,
    pub refresh_token: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_iam_url")]
    pub iam_url: String,
}

fn default_api_url() -> String {
    "https://api.viessmann.com".into()
}

fn default_iam_url() -> String {
    "https://iam.viessmann.com".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action_type", rename_all = "snake_case")]
pub enum ActionConfig {
    Domoticz(DomoticzConfig),
    HomeAssistant(HomeAssistantConfig),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomoticzConfig {
    pub domoticz_url: String,
    pub boiler_temp_idx: Option<u32>,
    #[serde(default)]
    pub burner_modulation_idxs: Vec<u32>,
    pub gas_consumption_m3_idx: Option<u32>,
    pub gas_consumption_kwh_idx: Option<u32>,
    /// Incremental counter fed with the per-cycle delta.
    pub gas_consumption_increment_idx: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HomeAssistantConfig {
    pub home_assistant_url: String,
    /// Falls back to the `HA_TOKEN` environment variable.
    #[serde(default)]
    pub token: Option<String>,
    pub gas_usage_entity_id: Option<String>,
    pub gas_usage_today_entity_id: Option<String>,
    #[serde(default)]
    pub burner_modulation_entities_ids: Vec<String>,
    pub boiler_temperature_entity_id: Option<String>,
}

impl Config {
    /// Reads the YAML file at `path` and checks the values the loop depends on.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!("Cannot read {}: {e}", path.display()))
        })?;
        let config = Self::parse(&raw)?;
        info!(
            path = %path.display(),
            actions = config.actions.len(),
            "Config loaded"
        );
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self, BridgeError> {
        let config: Self =
            serde_yaml::from_str(raw).map_err(|e| BridgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Config file path from `VIESSMANN_BRIDGE_CONFIG`, or `config.yaml`.
    pub fn path_from_env() -> String {
        env::var("VIESSMANN_BRIDGE_CONFIG").unwrap_or_else(|_| "config.yaml".into())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    fn validate(&self) -> Result<(), BridgeError> {
        if self.poll_interval_secs == 0 {
            return Err(BridgeError::Config(
                "poll_interval_secs must be greater than 0".into(),
            ));
        }
        if self.burner_count == 0 {
            return Err(BridgeError::Config(
                "burner_count must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
