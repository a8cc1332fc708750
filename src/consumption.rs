use crate::error::BridgeError;
use chrono::{DateTime, Days, FixedOffset, NaiveDate};
use std::collections::BTreeMap;

/// Gas consumption in kWh, as reported by the appliance.
pub type Kwh = i64;

/// One poll of the appliance's rolling consumption windows.
///
/// Index 0 of every window is the most recent period; `day[0]` is the day
/// still in progress. Instants are already in the appliance-local timezone.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumptionSnapshot {
    pub timestamp: DateTime<FixedOffset>,

    pub day: Vec<Kwh>,
    pub week: Vec<Kwh>,
    pub month: Vec<Kwh>,
    pub year: Vec<Kwh>,

    pub day_readat: DateTime<FixedOffset>,
    pub week_readat: DateTime<FixedOffset>,
    pub month_readat: DateTime<FixedOffset>,
    pub year_readat: DateTime<FixedOffset>,
}

impl ConsumptionSnapshot {
    /// The appliance-local day that `day[0]` belongs to.
    pub fn anchor_date(&self) -> NaiveDate {
        self.day_readat.date_naive()
    }

    /// Checks the shape guaranteed by the appliance contract. Rollover
    /// detection needs both the open day and the one before it.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.day.len() < 2 {
            return Err(BridgeError::MalformedSnapshot {
                window: "day",
                len: self.day.len(),
            });
        }
        for (window, values) in [
            ("week", &self.week),
            ("month", &self.month),
            ("year", &self.year),
        ] {
            if values.is_empty() {
                return Err(BridgeError::MalformedSnapshot { window, len: 0 });
            }
        }
        Ok(())
    }

    /// Keys every `day[i]` by `anchor - i days`.
    pub fn daily_history(&self, anchor: NaiveDate) -> BTreeMap<NaiveDate, Kwh> {
        self.day
            .iter()
            .enumerate()
            .filter_map(|(i, value)| {
                anchor
                    .checked_sub_days(Days::new(i as u64))
                    .map(|date| (date, *value))
            })
            .collect()
    }
}

/// Sink-agnostic update intent produced by one reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    DailyCorrection {
        values: BTreeMap<NaiveDate, Kwh>,
    },
    TotalUpdate {
        total: Kwh,
        today_partial: Kwh,
    },
    TotalIncrease {
        delta: Kwh,
    },
    PointInTimeCorrection {
        at: DateTime<FixedOffset>,
        value: Kwh,
    },
}

impl Effect {
    pub fn kind(&self) -> &'static str {
        match self {
            Effect::DailyCorrection { .. } => "daily correction",
            Effect::TotalUpdate { .. } => "total update",
            Effect::TotalIncrease { .. } => "total increase",
            Effect::PointInTimeCorrection { .. } => "point-in-time correction",
        }
    }
}

/// Boiler readings forwarded verbatim each poll, independent of reconciliation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Telemetry {
    /// Percent, one entry per burner.
    pub burner_modulations: Vec<i64>,
    /// Degrees Celsius.
    pub boiler_temperature: Option<f64>,
}

impl Telemetry {
    pub fn is_empty(&self) -> bool {
        self.burner_modulations.is_empty() && self.boiler_temperature.is_none()
    }
}
