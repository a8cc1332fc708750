use crate::config::HomeAssistantConfig;
use crate::consumption::Kwh;
use crate::sink::Sink;
use async_trait::async_trait;
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use tracing::debug;

pub struct HomeAssistantAPI {
    endpoint_url: String,
    auth_token: String,
    client: reqwest::Client,
}

impl HomeAssistantAPI {
    pub fn new(endpoint_url: &str, auth_token: &str) -> Self {
        Self {
            endpoint_url: endpoint_url.trim_end_matches('/').to_string(),
            auth_token: auth_token.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Probes `/api/`, which answers once the token is accepted.
    pub async fn check_api(&self) -> Result<(), anyhow::Error> {
        if self.endpoint_url.is_empty() {
            anyhow::bail!("No HA connection");
        }
        let status: HAStatus = self
            .client
            .get(format!("{}/api/", self.endpoint_url))
            .bearer_auth(&self.auth_token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!(message = %status.message, "Home Assistant API reachable");
        Ok(())
    }

    /// Creates or overwrites the state of `entity_id`.
    pub async fn update_state(
        &self,
        entity_id: &str,
        state: String,
        attributes: Value,
    ) -> Result<HASensor, anyhow::Error> {
        if self.endpoint_url.is_empty() {
            anyhow::bail!("No HA connection");
        }
        debug!(entity_id, state = %state, "Updating Home Assistant state");
        let result = self
            .client
            .post(format!("{}/api/states/{}", self.endpoint_url, entity_id))
            .bearer_auth(&self.auth_token)
            .json(&json!({ "state": state, "attributes": attributes }))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(result)
    }
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HASensor {
    pub entity_id: String,
    pub state: String,
    #[serde(default)]
    pub last_changed: String,
    #[serde(default)]
    pub last_reported: String,
    #[serde(default)]
    pub last_updated: String,
}

#[derive(Debug, Deserialize)]
struct HAStatus {
    message: String,
}

/// Publishes consumption and boiler readings as Home Assistant entity states.
/// History cannot be rewritten through the states API, so daily and
/// point-in-time corrections are left to the default no-ops.
pub struct HomeAssistant {
    name: String,
    config: HomeAssistantConfig,
    api: HomeAssistantAPI,
}

impl HomeAssistant {
    pub fn new(config: HomeAssistantConfig) -> Self {
        let token = config
            .token
            .clone()
            .unwrap_or_else(|| env::var("HA_TOKEN").unwrap_or_default());
        let api = HomeAssistantAPI::new(&config.home_assistant_url, &token);
        Self {
            name: format!("home_assistant({})", config.home_assistant_url),
            config,
            api,
        }
    }
}

#[async_trait]
impl Sink for HomeAssistant {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&self) -> anyhow::Result<()> {
        self.api.check_api().await
    }

    async fn apply_total_update(&self, total: Kwh, today_partial: Kwh) -> anyhow::Result<()> {
        if let Some(entity) = &self.config.gas_usage_entity_id {
            self.api
                .update_state(
                    entity,
                    total.to_string(),
                    json!({
                        "unit_of_measurement": "kWh",
                        "device_class": "gas",
                        "state_class": "total_increasing",
                    }),
                )
                .await?;
        }
        if let Some(entity) = &self.config.gas_usage_today_entity_id {
            self.api
                .update_state(
                    entity,
                    today_partial.to_string(),
                    json!({
                        "unit_of_measurement": "kWh",
                        "device_class": "gas",
                        "state_class": "total_increasing",
                    }),
                )
                .await?;
        }
        Ok(())
    }

    async fn apply_burner_modulation(&self, values: &[i64]) -> anyhow::Result<()> {
        for (entity, modulation) in self
            .config
            .burner_modulation_entities_ids
            .iter()
            .zip(values)
        {
            self.api
                .update_state(
                    entity,
                    modulation.to_string(),
                    json!({ "unit_of_measurement": "%" }),
                )
                .await?;
        }
        Ok(())
    }

    async fn apply_boiler_temperature(&self, celsius: f64) -> anyhow::Result<()> {
        if let Some(entity) = &self.config.boiler_temperature_entity_id {
            self.api
                .update_state(
                    entity,
                    celsius.to_string(),
                    json!({
                        "unit_of_measurement": "°C",
                        "device_class": "temperature",
                    }),
                )
                .await?;
        }
        Ok(())
    }
}
