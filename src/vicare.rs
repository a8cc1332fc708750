//! Snapshot source backed by the Viessmann ViCare cloud API.

use crate::config::ViessmannCreds;
use crate::consumption::{ConsumptionSnapshot, Kwh, Telemetry};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use chrono_tz::Tz;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_derive::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info};

const GAS_CONSUMPTION_FEATURE: &str = "heating.gas.consumption.heating";
const BOILER_TEMPERATURE_FEATURE: &str = "heating.boiler.sensors.temperature.main";

/// Produces consumption snapshots and boiler telemetry on demand.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self) -> anyhow::Result<ConsumptionSnapshot>;

    async fn fetch_telemetry(&self) -> anyhow::Result<Telemetry> {
        Ok(Telemetry::default())
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct Installation {
    id: i64,
    #[serde(default)]
    gateways: Vec<Gateway>,
}

#[derive(Debug, Deserialize)]
struct Gateway {
    serial: String,
    #[serde(default)]
    devices: Vec<Device>,
}

#[derive(Debug, Deserialize)]
struct Device {
    id: String,
    #[serde(rename = "modelId", default)]
    model_id: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Feature {
    pub feature: String,
    #[serde(default)]
    pub properties: Value,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
struct DevicePath {
    installation_id: i64,
    gateway_serial: String,
    device_id: String,
}

pub struct ViCareClient {
    creds: ViessmannCreds,
    timezone: Tz,
    device_index: usize,
    burner_count: usize,
    client: reqwest::Client,
    access_token: Mutex<Option<String>>,
    device: Mutex<Option<DevicePath>>,
    // Features from the last snapshot fetch, reused for telemetry to save a request
    last_features: Mutex<Option<Vec<Feature>>>,
}

impl ViCareClient {
    pub fn new(
        creds: ViessmannCreds,
        timezone: Tz,
        device_index: usize,
        burner_count: usize,
    ) -> Self {
        Self {
            creds,
            timezone,
            device_index,
            burner_count,
            client: reqwest::Client::new(),
            access_token: Mutex::new(None),
            device: Mutex::new(None),
            last_features: Mutex::new(None),
        }
    }

    async fn refresh_access_token(&self) -> anyhow::Result<String> {
        debug!("Refreshing ViCare access token");
        let response: TokenResponse = self
            .client
            .post(format!("{}/idp/v3/token", self.creds.iam_url.trim_end_matches('/')))
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", self.creds.client_id.as_str()),
                ("refresh_token", self.creds.refresh_token.as_str()),
            ])
            .send()
            .await?
            .error_for_status()
            .context("ViCare token refresh failed")?
            .json()
            .await?;
        *self.access_token.lock().await = Some(response.access_token.clone());
        Ok(response.access_token)
    }

    async fn token(&self) -> anyhow::Result<String> {
        let cached = self.access_token.lock().await.clone();
        match cached {
            Some(token) => Ok(token),
            None => self.refresh_access_token().await,
        }
    }

    /// GET against the API; an expired token is refreshed once and the call retried.
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let url = format!("{}{}", self.creds.api_url.trim_end_matches('/'), path);
        let mut token = self.token().await?;
        for attempt in 1..=2 {
            let response = self.client.get(&url).bearer_auth(&token).send().await?;
            if response.status() == StatusCode::UNAUTHORIZED && attempt == 1 {
                debug!(url = %url, "ViCare access token rejected");
                token = self.refresh_access_token().await?;
                continue;
            }
            return Ok(response.error_for_status()?.json().await?);
        }
        Err(anyhow!("ViCare rejected the refreshed access token for {url}"))
    }

    async fn device_path(&self) -> anyhow::Result<DevicePath> {
        let mut device = self.device.lock().await;
        if let Some(path) = device.as_ref() {
            return Ok(path.clone());
        }

        let installations: Envelope<Vec<Installation>> = self
            .get_json("/iot/v1/equipment/installations?includeGateways=true")
            .await?;
        let found = installations
            .data
            .iter()
            .flat_map(|installation| {
                installation.gateways.iter().flat_map(move |gateway| {
                    gateway.devices.iter().map(move |d| (installation, gateway, d))
                })
            })
            .nth(self.device_index);
        let Some((installation, gateway, dev)) = found else {
            anyhow::bail!("No ViCare device at index {}", self.device_index);
        };

        info!(
            installation = installation.id,
            gateway = %gateway.serial,
            device = %dev.id,
            model = %dev.model_id,
            "Connected to ViCare device"
        );
        let path = DevicePath {
            installation_id: installation.id,
            gateway_serial: gateway.serial.clone(),
            device_id: dev.id.clone(),
        };
        *device = Some(path.clone());
        Ok(path)
    }

    async fn fetch_features(&self) -> anyhow::Result<Vec<Feature>> {
        let device = self.device_path().await?;
        let features: Envelope<Vec<Feature>> = self
            .get_json(&format!(
                "/iot/v1/features/installations/{}/gateways/{}/devices/{}/features",
                device.installation_id, device.gateway_serial, device.device_id
            ))
            .await?;
        Ok(features.data)
    }
}

#[async_trait]
impl SnapshotSource for ViCareClient {
    async fn fetch_snapshot(&self) -> anyhow::Result<ConsumptionSnapshot> {
        let features = self.fetch_features().await?;
        let snapshot = parse_consumption(&features, self.timezone)?;
        *self.last_features.lock().await = Some(features);
        Ok(snapshot)
    }

    async fn fetch_telemetry(&self) -> anyhow::Result<Telemetry> {
        let cached = self.last_features.lock().await.take();
        let features = match cached {
            Some(features) => features,
            None => self.fetch_features().await?,
        };
        Ok(parse_telemetry(&features, self.burner_count))
    }
}

fn find<'a>(features: &'a [Feature], name: &str) -> Option<&'a Feature> {
    features.iter().find(|f| f.feature == name)
}

fn parse_local_time(raw: &str, timezone: Tz) -> anyhow::Result<DateTime<FixedOffset>> {
    let parsed = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp `{raw}`"))?;
    Ok(parsed.with_timezone(&timezone).fixed_offset())
}

fn property_time(
    properties: &Value,
    key: &str,
    timezone: Tz,
) -> anyhow::Result<DateTime<FixedOffset>> {
    let raw = properties[key]["value"]
        .as_str()
        .ok_or_else(|| anyhow!("Missing `{key}` in gas consumption feature"))?;
    parse_local_time(raw, timezone)
}

fn property_values(properties: &Value, key: &str) -> anyhow::Result<Vec<Kwh>> {
    properties[key]["value"]
        .as_array()
        .ok_or_else(|| anyhow!("Missing `{key}` in gas consumption feature"))?
        .iter()
        .map(|v| {
            v.as_i64()
                .or_else(|| v.as_f64().map(|f| f.round() as i64))
                .ok_or_else(|| anyhow!("Non-numeric `{key}` value {v}"))
        })
        .collect()
}

/// Builds a snapshot from the gas consumption feature, with every instant
/// moved into the appliance timezone. Window lengths are not checked here.
pub fn parse_consumption(
    features: &[Feature],
    timezone: Tz,
) -> anyhow::Result<ConsumptionSnapshot> {
    let feature = find(features, GAS_CONSUMPTION_FEATURE)
        .ok_or_else(|| anyhow!("Device does not report `{GAS_CONSUMPTION_FEATURE}`"))?;
    let props = &feature.properties;

    let day_readat = property_time(props, "dayValueReadAt", timezone)?;
    let timestamp = match feature.timestamp.as_deref() {
        Some(raw) => parse_local_time(raw, timezone)?,
        None => day_readat,
    };

    Ok(ConsumptionSnapshot {
        timestamp,
        day: property_values(props, "day")?,
        week: property_values(props, "week")?,
        month: property_values(props, "month")?,
        year: property_values(props, "year")?,
        day_readat,
        week_readat: property_time(props, "weekValueReadAt", timezone)?,
        month_readat: property_time(props, "monthValueReadAt", timezone)?,
        year_readat: property_time(props, "yearValueReadAt", timezone)?,
    })
}

/// Burner modulations stop at the first burner the device does not report.
pub fn parse_telemetry(features: &[Feature], burner_count: usize) -> Telemetry {
    let burner_modulations = (0..burner_count)
        .map_while(|i| {
            let feature = find(features, &format!("heating.burners.{i}.modulation"))?;
            let value = &feature.properties["value"]["value"];
            value.as_i64().or_else(|| value.as_f64().map(|f| f.round() as i64))
        })
        .collect();
    let boiler_temperature = find(features, BOILER_TEMPERATURE_FEATURE)
        .and_then(|f| f.properties["value"]["value"].as_f64());

    Telemetry {
        burner_modulations,
        boiler_temperature,
    }
}
