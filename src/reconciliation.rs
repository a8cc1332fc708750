//! Consumption reconciliation engine.
//!
//! Turns the appliance's rolling day window into a monotonic lifetime total.
//! Everything here is synchronous and free of I/O: one call takes the state
//! and a fresh snapshot, and hands back the effects to dispatch.

use crate::consumption::{ConsumptionSnapshot, Effect, Kwh};
use crate::error::BridgeError;
use chrono::{DateTime, FixedOffset, NaiveDate};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// First accepted snapshot since start.
    Initialized,
    /// Same day window, in-progress value moved (or not).
    Updated,
    /// The day window shifted and a new day was opened.
    RolledOver,
    /// Snapshot looked corrupt and was dropped; state untouched.
    Rejected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub outcome: Outcome,
    pub effects: Vec<Effect>,
}

impl Reconciliation {
    fn rejected() -> Self {
        Self {
            outcome: Outcome::Rejected,
            effects: Vec::new(),
        }
    }
}

/// The accepted snapshot together with the values derived from it. Kept in
/// one struct so they can only ever be replaced together.
#[derive(Debug, Clone)]
struct Baseline {
    snapshot: ConsumptionSnapshot,
    total_consumption: Kwh,
    anchor_date: NaiveDate,
}

/// Engine state carried between polls. Starts empty on every process start.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationState {
    baseline: Option<Baseline>,
    previous_total_consumption: Kwh,
}

impl ReconciliationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_snapshot(&self) -> Option<&ConsumptionSnapshot> {
        self.baseline.as_ref().map(|b| &b.snapshot)
    }

    pub fn total_consumption(&self) -> Option<Kwh> {
        self.baseline.as_ref().map(|b| b.total_consumption)
    }

    pub fn previous_total_consumption(&self) -> Kwh {
        self.previous_total_consumption
    }

    pub fn anchor_date(&self) -> Option<NaiveDate> {
        self.baseline.as_ref().map(|b| b.anchor_date)
    }

    /// Folds one snapshot into the running total.
    ///
    /// Only a snapshot that breaks the shape contract is an error. A snapshot
    /// that fails the sanity checks yields `Outcome::Rejected` with no effects
    /// and leaves the state exactly as it was.
    pub fn reconcile(
        &mut self,
        snapshot: ConsumptionSnapshot,
    ) -> Result<Reconciliation, BridgeError> {
        snapshot.validate()?;

        let Some(baseline) = self.baseline.as_ref() else {
            return Ok(self.bootstrap(snapshot));
        };

        let days_elapsed = (snapshot.anchor_date() - baseline.anchor_date).num_days();
        if days_elapsed < 0 {
            warn!(
                previous = %baseline.anchor_date,
                current = %snapshot.anchor_date(),
                "Day window anchor moved backwards, rejecting snapshot"
            );
            return Ok(Reconciliation::rejected());
        }
        let shift = usize::try_from(days_elapsed).unwrap_or(usize::MAX).max(1);

        if !windows_agree(&baseline.snapshot.day, &snapshot.day, shift) {
            warn!(
                previous = ?baseline.snapshot.day,
                current = ?snapshot.day,
                "Closed days disagree with the previous snapshot, rejecting it as anomalous"
            );
            return Ok(Reconciliation::rejected());
        }

        let same_window = days_elapsed == 0
            && baseline.snapshot.day.last() == snapshot.day.last();
        if same_window {
            Ok(self.steady_tick(snapshot))
        } else {
            Ok(self.roll_over(snapshot, shift))
        }
    }

    fn bootstrap(&mut self, snapshot: ConsumptionSnapshot) -> Reconciliation {
        let total_consumption: Kwh = snapshot.year.iter().sum();
        let anchor_date = snapshot.anchor_date();
        let today_partial = snapshot.day[0];

        info!(
            total = total_consumption,
            anchor = %anchor_date,
            "Initialized total consumption from yearly window"
        );

        let effects = vec![
            Effect::DailyCorrection {
                values: snapshot.daily_history(anchor_date),
            },
            Effect::TotalUpdate {
                total: total_consumption,
                today_partial,
            },
            Effect::TotalIncrease { delta: 0 },
        ];

        self.previous_total_consumption = total_consumption;
        self.baseline = Some(Baseline {
            snapshot,
            total_consumption,
            anchor_date,
        });

        Reconciliation {
            outcome: Outcome::Initialized,
            effects,
        }
    }

    fn steady_tick(&mut self, snapshot: ConsumptionSnapshot) -> Reconciliation {
        let Some(baseline) = self.baseline.as_mut() else {
            return Reconciliation::rejected();
        };

        // Both sums cover the same calendar days, so the difference is
        // exactly what was consumed since the last poll.
        let previous_sum: Kwh = baseline.snapshot.day.iter().sum();
        let current_sum: Kwh = snapshot.day.iter().sum();
        let offset = current_sum - previous_sum;

        if offset < 0 {
            warn!(
                previous = ?baseline.snapshot.day,
                current = ?snapshot.day,
                offset,
                "Day window shrank without a rollover, rejecting snapshot"
            );
            return Reconciliation::rejected();
        }

        let previous_total = baseline.total_consumption;
        let total = previous_total + offset;
        let today_partial = snapshot.day[0];

        debug!(
            previous = ?baseline.snapshot.day,
            current = ?snapshot.day,
            offset,
            total,
            "Same day window, advancing total"
        );

        baseline.total_consumption = total;
        baseline.snapshot = snapshot;
        self.previous_total_consumption = previous_total;

        Reconciliation {
            outcome: Outcome::Updated,
            effects: vec![
                Effect::TotalUpdate {
                    total,
                    today_partial,
                },
                Effect::TotalIncrease {
                    delta: total - previous_total,
                },
            ],
        }
    }

    /// `shift` is how many slots the day window moved, at least one.
    fn roll_over(&mut self, snapshot: ConsumptionSnapshot, shift: usize) -> Reconciliation {
        let Some(baseline) = self.baseline.as_mut() else {
            return Reconciliation::rejected();
        };

        let previous_total = baseline.total_consumption;
        let closed_date = baseline.anchor_date;
        let mut total = previous_total;
        let mut closing = None;

        if let Some(&closed_value) = snapshot.day.get(shift) {
            // The day that was open at the last poll is now closed at `closed_value`.
            let estimate = baseline.snapshot.day[0];
            let mut offset = closed_value - estimate;
            if offset < 0 {
                warn!(
                    closed_date = %closed_date,
                    estimate,
                    closed_value,
                    offset,
                    "Closed day read back lower than its open estimate, clamping offset to 0"
                );
                offset = 0;
            }
            // Days that opened and closed entirely between two polls.
            let skipped: Kwh = snapshot.day[1..shift].iter().sum();

            info!(
                closed_date = %closed_date,
                estimate,
                closed_value,
                offset,
                skipped_days = shift - 1,
                "New day started"
            );

            total += offset + skipped;
            closing = end_of_day(closed_date, &snapshot.day_readat)
                .map(|at| (at, closed_value));
        } else {
            warn!(
                closed_date = %closed_date,
                days = shift,
                window = snapshot.day.len(),
                "Gap exceeds the day window, counting only the visible days"
            );
            total += snapshot.day[1..].iter().sum::<Kwh>();
        }

        // The new day did not exist before, so all of it is new consumption.
        let today_partial = snapshot.day[0];
        total += today_partial;

        let anchor_date = snapshot.anchor_date();
        info!(
            anchor = %anchor_date,
            today_partial,
            total,
            "Rolled over day window"
        );

        let mut effects = vec![
            Effect::DailyCorrection {
                values: snapshot.daily_history(anchor_date),
            },
            Effect::TotalUpdate {
                total,
                today_partial,
            },
            Effect::TotalIncrease {
                delta: total - previous_total,
            },
        ];
        if let Some((at, value)) = closing {
            effects.push(Effect::PointInTimeCorrection { at, value });
        }

        baseline.total_consumption = total;
        baseline.anchor_date = anchor_date;
        baseline.snapshot = snapshot;
        self.previous_total_consumption = previous_total;

        Reconciliation {
            outcome: Outcome::RolledOver,
            effects,
        }
    }
}

/// Closed days of the previous window must reappear in the new one, either in
/// place, moved by one slot, or moved by `shift` slots after a longer gap.
/// A window that changed length never agrees.
fn windows_agree(previous: &[Kwh], current: &[Kwh], shift: usize) -> bool {
    if previous.len() != current.len() {
        return false;
    }
    let closed = &previous[1..];
    let mut candidates = vec![0, 1];
    if shift > 1 {
        candidates.push(shift);
    }
    candidates.into_iter().any(|k| {
        let moved = current.get(k.saturating_add(1)..).unwrap_or(&[]);
        closed.iter().zip(moved).all(|(a, b)| a == b)
    })
}

fn end_of_day(
    date: NaiveDate,
    reference: &DateTime<FixedOffset>,
) -> Option<DateTime<FixedOffset>> {
    date.and_hms_opt(23, 59, 59)?
        .and_local_timezone(*reference.offset())
        .single()
}
