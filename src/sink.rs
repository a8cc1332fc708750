use crate::config::ActionConfig;
use crate::consumption::Kwh;
use crate::domoticz::Domoticz;
use crate::home_assistant::HomeAssistant;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate};
use std::collections::BTreeMap;
use std::sync::Arc;

/// A downstream integration that renders effects and telemetry into its own
/// protocol. Every capability defaults to a no-op, so a sink overrides only
/// what it supports. Retries, if any, belong to the implementation.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn initialize(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn apply_daily_correction(
        &self,
        _values: &BTreeMap<NaiveDate, Kwh>,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn apply_total_update(&self, _total: Kwh, _today_partial: Kwh) -> anyhow::Result<()> {
        Ok(())
    }

    async fn apply_total_increase(&self, _delta: Kwh) -> anyhow::Result<()> {
        Ok(())
    }

    async fn apply_point_in_time_correction(
        &self,
        _at: DateTime<FixedOffset>,
        _value: Kwh,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn apply_burner_modulation(&self, _values: &[i64]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn apply_boiler_temperature(&self, _celsius: f64) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Builds the configured sinks in the order they appear in the config.
pub fn build_sinks(actions: &[ActionConfig]) -> Vec<Arc<dyn Sink>> {
    actions
        .iter()
        .map(|action| -> Arc<dyn Sink> {
            match action {
                ActionConfig::Domoticz(config) => Arc::new(Domoticz::new(config.clone())),
                ActionConfig::HomeAssistant(config) => {
                    Arc::new(HomeAssistant::new(config.clone()))
                }
            }
        })
        .collect()
}
