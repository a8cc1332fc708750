//! Fans effects and telemetry out to every registered sink.
//!
//! Each sink receives its deliveries one after another, in the order given,
//! while different sinks run concurrently. A call only returns once every
//! sink has settled, so the next reconciliation never overlaps an update in
//! flight. Failures are collected per sink and never stop the others.

use crate::consumption::{Effect, Telemetry};
use crate::error::BridgeError;
use crate::sink::Sink;
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug, Default)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failures: Vec<BridgeError>,
}

impl DispatchReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Names of the sinks with at least one failed delivery.
    pub fn failed_sinks(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .failures
            .iter()
            .filter_map(|failure| match failure {
                BridgeError::SinkDelivery { sink, .. } => Some(sink.as_str()),
                _ => None,
            })
            .collect();
        names.dedup();
        names
    }

    fn merge(&mut self, other: DispatchReport) {
        self.delivered += other.delivered;
        self.failures.extend(other.failures);
    }
}

enum Delivery<'a> {
    Initialize,
    Effect(&'a Effect),
    BurnerModulation(&'a [i64]),
    BoilerTemperature(f64),
}

impl Delivery<'_> {
    fn kind(&self) -> &'static str {
        match self {
            Delivery::Initialize => "initialize",
            Delivery::Effect(effect) => effect.kind(),
            Delivery::BurnerModulation(_) => "burner modulation",
            Delivery::BoilerTemperature(_) => "boiler temperature",
        }
    }

    async fn apply(&self, sink: &dyn Sink) -> anyhow::Result<()> {
        match self {
            Delivery::Initialize => sink.initialize().await,
            Delivery::Effect(Effect::DailyCorrection { values }) => {
                sink.apply_daily_correction(values).await
            }
            Delivery::Effect(Effect::TotalUpdate {
                total,
                today_partial,
            }) => sink.apply_total_update(*total, *today_partial).await,
            Delivery::Effect(Effect::TotalIncrease { delta }) => {
                sink.apply_total_increase(*delta).await
            }
            Delivery::Effect(Effect::PointInTimeCorrection { at, value }) => {
                sink.apply_point_in_time_correction(*at, *value).await
            }
            Delivery::BurnerModulation(values) => sink.apply_burner_modulation(values).await,
            Delivery::BoilerTemperature(celsius) => sink.apply_boiler_temperature(*celsius).await,
        }
    }
}

/// Delivers every effect to every sink.
pub async fn dispatch(effects: &[Effect], sinks: &[Arc<dyn Sink>]) -> DispatchReport {
    let deliveries: Vec<Delivery> = effects.iter().map(Delivery::Effect).collect();
    fan_out(&deliveries, sinks).await
}

/// Forwards boiler telemetry verbatim. Missing readings are skipped.
pub async fn dispatch_telemetry(
    telemetry: &Telemetry,
    sinks: &[Arc<dyn Sink>],
) -> DispatchReport {
    if telemetry.is_empty() {
        return DispatchReport::default();
    }
    let mut deliveries = Vec::new();
    if !telemetry.burner_modulations.is_empty() {
        deliveries.push(Delivery::BurnerModulation(&telemetry.burner_modulations));
    }
    if let Some(celsius) = telemetry.boiler_temperature {
        deliveries.push(Delivery::BoilerTemperature(celsius));
    }
    fan_out(&deliveries, sinks).await
}

/// Runs every sink's one-time setup.
pub async fn initialize(sinks: &[Arc<dyn Sink>]) -> DispatchReport {
    fan_out(&[Delivery::Initialize], sinks).await
}

async fn fan_out(deliveries: &[Delivery<'_>], sinks: &[Arc<dyn Sink>]) -> DispatchReport {
    let mut report = DispatchReport::default();
    if deliveries.is_empty() {
        return report;
    }
    let per_sink = sinks
        .iter()
        .map(|sink| deliver_in_order(sink.as_ref(), deliveries));
    for sink_report in join_all(per_sink).await {
        report.merge(sink_report);
    }
    report
}

async fn deliver_in_order(sink: &dyn Sink, deliveries: &[Delivery<'_>]) -> DispatchReport {
    let mut report = DispatchReport::default();
    for delivery in deliveries {
        match delivery.apply(sink).await {
            Ok(()) => {
                debug!(sink = sink.name(), kind = delivery.kind(), "Delivered");
                report.delivered += 1;
            }
            Err(e) => {
                error!(
                    sink = sink.name(),
                    kind = delivery.kind(),
                    error = %e,
                    "Sink delivery failed"
                );
                report.failures.push(BridgeError::SinkDelivery {
                    sink: sink.name().to_string(),
                    effect: delivery.kind(),
                    source: e,
                });
            }
        }
    }
    report
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::consumption::Kwh;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Barrier;

    /// Records every call it receives; optionally fails total updates.
    pub(crate) struct RecordingSink {
        name: String,
        fail_total_update: bool,
        pub(crate) calls: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        pub(crate) fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                fail_total_update: false,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn failing(name: &str) -> Self {
            Self {
                fail_total_update: true,
                ..Self::new(name)
            }
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn name(&self) -> &str {
            &self.name
        }

        async fn initialize(&self) -> anyhow::Result<()> {
            self.record("init".to_string());
            Ok(())
        }

        async fn apply_daily_correction(
            &self,
            values: &BTreeMap<NaiveDate, Kwh>,
        ) -> anyhow::Result<()> {
            self.record(format!("daily:{}", values.len()));
            Ok(())
        }

        async fn apply_total_update(&self, total: Kwh, today_partial: Kwh) -> anyhow::Result<()> {
            if self.fail_total_update {
                anyhow::bail!("connection refused");
            }
            self.record(format!("total:{total}/{today_partial}"));
            Ok(())
        }

        async fn apply_total_increase(&self, delta: Kwh) -> anyhow::Result<()> {
            self.record(format!("increase:{delta}"));
            Ok(())
        }

        async fn apply_burner_modulation(&self, values: &[i64]) -> anyhow::Result<()> {
            self.record(format!("modulation:{values:?}"));
            Ok(())
        }

        async fn apply_boiler_temperature(&self, celsius: f64) -> anyhow::Result<()> {
            self.record(format!("boiler:{celsius}"));
            Ok(())
        }
    }

    fn effects() -> Vec<Effect> {
        vec![
            Effect::DailyCorrection {
                values: [(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(), 4)]
                    .into_iter()
                    .collect(),
            },
            Effect::TotalUpdate {
                total: 104,
                today_partial: 4,
            },
            Effect::TotalIncrease { delta: 4 },
        ]
    }

    #[tokio::test]
    async fn test_dispatch_preserves_effect_order() {
        let sink = Arc::new(RecordingSink::new("recorder"));
        let sinks: Vec<Arc<dyn Sink>> = vec![sink.clone()];

        let report = dispatch(&effects(), &sinks).await;

        assert!(report.is_clean());
        assert_eq!(report.delivered, 3);
        assert_eq!(
            sink.calls(),
            vec!["daily:1", "total:104/4", "increase:4"]
        );
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_block_others() {
        let healthy = Arc::new(RecordingSink::new("healthy"));
        let broken = Arc::new(RecordingSink::failing("broken"));
        let sinks: Vec<Arc<dyn Sink>> = vec![broken.clone(), healthy.clone()];

        let report = dispatch(&effects(), &sinks).await;

        assert_eq!(
            healthy.calls(),
            vec!["daily:1", "total:104/4", "increase:4"]
        );
        // The broken sink still receives the deliveries after its failure
        assert_eq!(broken.calls(), vec!["daily:1", "increase:4"]);
        assert_eq!(report.delivered, 5);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failed_sinks(), vec!["broken"]);
        match &report.failures[0] {
            BridgeError::SinkDelivery { sink, effect, .. } => {
                assert_eq!(sink, "broken");
                assert_eq!(*effect, "total update");
            }
            other => panic!("Expected SinkDelivery, got {other:?}"),
        }
    }

    struct RendezvousSink {
        name: &'static str,
        barrier: Arc<Barrier>,
    }

    #[async_trait]
    impl Sink for RendezvousSink {
        fn name(&self) -> &str {
            self.name
        }

        async fn apply_total_increase(&self, _delta: Kwh) -> anyhow::Result<()> {
            self.barrier.wait().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sinks_are_driven_concurrently() {
        // Each sink blocks until the other one is in flight as well
        let barrier = Arc::new(Barrier::new(2));
        let sinks: Vec<Arc<dyn Sink>> = vec![
            Arc::new(RendezvousSink {
                name: "a",
                barrier: barrier.clone(),
            }),
            Arc::new(RendezvousSink {
                name: "b",
                barrier,
            }),
        ];

        let report = tokio::time::timeout(
            Duration::from_secs(1),
            dispatch(&[Effect::TotalIncrease { delta: 1 }], &sinks),
        )
        .await
        .expect("Sinks should not be called one after another");

        assert!(report.is_clean());
        assert_eq!(report.delivered, 2);
    }

    #[tokio::test]
    async fn test_dispatch_telemetry_skips_missing_readings() {
        let sink = Arc::new(RecordingSink::new("recorder"));
        let sinks: Vec<Arc<dyn Sink>> = vec![sink.clone()];

        let report = dispatch_telemetry(&Telemetry::default(), &sinks).await;
        assert_eq!(report.delivered, 0);
        assert!(sink.calls().is_empty());

        let telemetry = Telemetry {
            burner_modulations: vec![32, 0],
            boiler_temperature: Some(61.5),
        };
        let report = dispatch_telemetry(&telemetry, &sinks).await;
        assert_eq!(report.delivered, 2);
        assert_eq!(sink.calls(), vec!["modulation:[32, 0]", "boiler:61.5"]);
    }

    #[tokio::test]
    async fn test_default_capabilities_are_no_ops() {
        struct Silent;

        #[async_trait]
        impl Sink for Silent {
            fn name(&self) -> &str {
                "silent"
            }
        }

        let sinks: Vec<Arc<dyn Sink>> = vec![Arc::new(Silent)];
        let mut all = effects();
        all.push(Effect::PointInTimeCorrection {
            at: crate::consumption::tests::at(2024, 3, 1, 23),
            value: 9,
        });

        assert!(initialize(&sinks).await.is_clean());
        let report = dispatch(&all, &sinks).await;
        assert!(report.is_clean());
        assert_eq!(report.delivered, 4);
    }

    #[tokio::test]
    async fn test_dispatch_without_sinks() {
        let report = dispatch(&effects(), &[]).await;
        assert!(report.is_clean());
        assert_eq!(report.delivered, 0);
    }
}
