use crate::config::DomoticzConfig;
use crate::consumption::Kwh;
use crate::sink::Sink;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate};
use serde_derive::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

// Calorific value used to turn metered kWh back into m3 of gas
const KWH_PER_M3: f64 = 11.2;

pub fn gas_consumption_kwh_to_m3(kwh: f64) -> f64 {
    kwh / KWH_PER_M3
}

#[derive(Debug, Deserialize)]
struct DomoticzResponse {
    status: String,
    #[serde(default)]
    title: String,
}

/// Pushes readings into Domoticz virtual devices through `udevice` commands.
/// Devices whose idx is not configured are skipped.
pub struct Domoticz {
    name: String,
    config: DomoticzConfig,
    client: reqwest::Client,
}

impl Domoticz {
    pub fn new(config: DomoticzConfig) -> Self {
        Self {
            name: format!("domoticz({})", config.domoticz_url),
            config,
            client: reqwest::Client::new(),
        }
    }

    async fn update_device(&self, idx: u32, svalue: String) -> anyhow::Result<()> {
        debug!(idx, svalue = %svalue, "Updating Domoticz device");
        let response: DomoticzResponse = self
            .client
            .get(format!(
                "{}/json.htm",
                self.config.domoticz_url.trim_end_matches('/')
            ))
            .query(&[
                ("type", "command".to_string()),
                ("param", "udevice".to_string()),
                ("idx", idx.to_string()),
                ("nvalue", "0".to_string()),
                ("svalue", svalue),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if response.status != "OK" {
            anyhow::bail!(
                "Domoticz rejected update of idx {idx}: {} {}",
                response.status,
                response.title
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Sink for Domoticz {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply_daily_correction(
        &self,
        values: &BTreeMap<NaiveDate, Kwh>,
    ) -> anyhow::Result<()> {
        let Some(idx) = self.config.gas_consumption_kwh_idx else {
            return Ok(());
        };
        // Counter -1 leaves the running counter alone and only rewrites the day
        for (date, value) in values {
            self.update_device(idx, format!("-1;{value};{}", date.format("%Y-%m-%d")))
                .await?;
        }
        Ok(())
    }

    async fn apply_total_update(&self, total: Kwh, _today_partial: Kwh) -> anyhow::Result<()> {
        if let Some(idx) = self.config.gas_consumption_kwh_idx {
            self.update_device(idx, total.to_string()).await?;
        }
        if let Some(idx) = self.config.gas_consumption_m3_idx {
            // Gas devices count in litres
            let litres = (gas_consumption_kwh_to_m3(total as f64) * 1000.0).round() as i64;
            self.update_device(idx, litres.to_string()).await?;
        }
        Ok(())
    }

    async fn apply_total_increase(&self, delta: Kwh) -> anyhow::Result<()> {
        if let Some(idx) = self.config.gas_consumption_increment_idx {
            self.update_device(idx, delta.to_string()).await?;
        }
        Ok(())
    }

    async fn apply_point_in_time_correction(
        &self,
        at: DateTime<FixedOffset>,
        value: Kwh,
    ) -> anyhow::Result<()> {
        if let Some(idx) = self.config.gas_consumption_kwh_idx {
            self.update_device(idx, format!("-1;{value};{}", at.format("%Y-%m-%d %H:%M:%S")))
                .await?;
        }
        Ok(())
    }

    async fn apply_burner_modulation(&self, values: &[i64]) -> anyhow::Result<()> {
        for (idx, modulation) in self.config.burner_modulation_idxs.iter().zip(values) {
            self.update_device(*idx, modulation.to_string()).await?;
        }
        Ok(())
    }

    async fn apply_boiler_temperature(&self, celsius: f64) -> anyhow::Result<()> {
        if let Some(idx) = self.config.boiler_temp_idx {
            self.update_device(idx, celsius.to_string()).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    const OK: &str = r#"{"status": "OK", "title": "Update Device"}"#;

    fn udevice(idx: &str, svalue: &str) -> Matcher {
        Matcher::AllOf(vec![
            Matcher::UrlEncoded("type".into(), "command".into()),
            Matcher::UrlEncoded("param".into(), "udevice".into()),
            Matcher::UrlEncoded("idx".into(), idx.into()),
            Matcher::UrlEncoded("nvalue".into(), "0".into()),
            Matcher::UrlEncoded("svalue".into(), svalue.into()),
        ])
    }

    fn config(url: &str) -> DomoticzConfig {
        DomoticzConfig {
            domoticz_url: url.to_string(),
            boiler_temp_idx: Some(5),
            burner_modulation_idxs: vec![6],
            gas_consumption_m3_idx: Some(7),
            gas_consumption_kwh_idx: Some(8),
            gas_consumption_increment_idx: None,
        }
    }

    #[test]
    fn test_kwh_to_m3() {
        assert_eq!(gas_consumption_kwh_to_m3(0.0), 0.0);
        assert!((gas_consumption_kwh_to_m3(112.0) - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_total_update_writes_kwh_and_m3_devices() {
        let mut server = mockito::Server::new_async().await;
        let kwh = server
            .mock("GET", "/json.htm")
            .match_query(udevice("8", "1120"))
            .with_body(OK)
            .create_async()
            .await;
        let m3 = server
            .mock("GET", "/json.htm")
            .match_query(udevice("7", "100000"))
            .with_body(OK)
            .create_async()
            .await;

        let sink = Domoticz::new(config(&server.url()));
        sink.apply_total_update(1120, 3).await.unwrap();

        kwh.assert_async().await;
        m3.assert_async().await;
    }

    #[tokio::test]
    async fn test_daily_correction_rewrites_each_day() {
        let mut server = mockito::Server::new_async().await;
        let day_1 = server
            .mock("GET", "/json.htm")
            .match_query(udevice("8", "-1;9;2024-03-01"))
            .with_body(OK)
            .create_async()
            .await;
        let day_2 = server
            .mock("GET", "/json.htm")
            .match_query(udevice("8", "-1;2;2024-03-02"))
            .with_body(OK)
            .create_async()
            .await;

        let values: BTreeMap<NaiveDate, Kwh> = [
            (NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(), 9),
            (NaiveDate::from_ymd_opt(2024, 3, 2).unwrap(), 2),
        ]
        .into_iter()
        .collect();

        let sink = Domoticz::new(config(&server.url()));
        sink.apply_daily_correction(&values).await.unwrap();

        day_1.assert_async().await;
        day_2.assert_async().await;
    }

    #[tokio::test]
    async fn test_point_in_time_correction() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/json.htm")
            .match_query(udevice("8", "-1;9;2024-03-01 23:59:00"))
            .with_body(OK)
            .create_async()
            .await;

        let at = DateTime::parse_from_rfc3339("2024-03-01T23:59:00+01:00").unwrap();
        let sink = Domoticz::new(config(&server.url()));
        sink.apply_point_in_time_correction(at, 9).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/json.htm")
            .match_query(Matcher::Any)
            .with_body(r#"{"status": "ERR", "title": "Update Device"}"#)
            .create_async()
            .await;

        let sink = Domoticz::new(config(&server.url()));
        let err = sink.apply_boiler_temperature(48.0).await.unwrap_err();
        assert!(err.to_string().contains("idx 5"));
    }

    #[tokio::test]
    async fn test_unconfigured_devices_are_skipped() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/json.htm")
            .match_query(Matcher::Any)
            .with_body(OK)
            .expect(0)
            .create_async()
            .await;

        let sink = Domoticz::new(DomoticzConfig {
            domoticz_url: server.url(),
            ..Default::default()
        });
        sink.apply_total_update(10, 1).await.unwrap();
        sink.apply_total_increase(1).await.unwrap();
        sink.apply_boiler_temperature(50.0).await.unwrap();
        sink.apply_burner_modulation(&[12]).await.unwrap();

        mock.assert_async().await;
    }
}
