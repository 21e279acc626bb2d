//! Simulated meters built from the device configuration.
//!
//! Every configured device becomes a [`MockMeter`] whose profiles hold a
//! history of records shaped like the configured capture objects: one
//! clock column plus rising register values. Interval profiles get a record
//! every capture period, daily profiles one at each midnight and monthly
//! profiles one on the first of each month.

use std::sync::Arc;
use std::time::Duration;

use time::{OffsetDateTime, Time};
use tracing::debug;

use meterlink_core::ProfileRegistry;
use meterlink_core::mock::{MockMeter, MockNetwork};
use meterlink_types::timestamp::add_months;
use meterlink_types::{ObisCode, ProfileId, Value};

use crate::config::{Config, ConfigError, ValidationError};

/// Capture period of simulated interval profiles.
pub const DEFAULT_CAPTURE_PERIOD_SECS: u64 = 900;

/// What to generate.
#[derive(Debug, Clone, Copy)]
pub struct SimulationOptions {
    /// How far back records reach.
    pub history: Duration,
    /// Capture period of interval profiles.
    pub capture_period_secs: u64,
}

impl Default for SimulationOptions {
    fn default() -> Self {
        Self {
            history: Duration::from_secs(48 * 3600),
            capture_period_secs: DEFAULT_CAPTURE_PERIOD_SECS,
        }
    }
}

/// One simulated profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedProfile {
    /// Device serial.
    pub device_id: String,
    /// Profile identifier.
    pub profile_id: ProfileId,
    /// Strategy the profile resolved to.
    pub strategy: &'static str,
    /// Records placed in the buffer.
    pub rows: usize,
}

/// A simulated network and what it holds.
pub struct Simulation {
    /// The network; also the codec factory for its meters.
    pub network: Arc<MockNetwork>,
    /// Generated profiles in configuration order.
    pub profiles: Vec<SimulatedProfile>,
}

impl Simulation {
    /// Build meters for every configured device with records up to `now`.
    pub fn from_config(
        config: &Config,
        registry: &ProfileRegistry,
        options: SimulationOptions,
        now: OffsetDateTime,
    ) -> Result<Self, ConfigError> {
        let network = MockNetwork::new();
        let mut profiles = Vec::new();
        let mut errors = Vec::new();

        for (i, device) in config.devices.iter().enumerate() {
            let meter = network.add_meter(&device.serial);
            for (j, profile) in device.profiles.iter().enumerate() {
                let metadata = match profile.metadata() {
                    Ok(metadata) => metadata,
                    Err(e) => {
                        errors.push(ValidationError {
                            field: format!("devices[{}].profiles[{}]", i, j),
                            message: e.to_string(),
                        });
                        continue;
                    }
                };
                let profile_id = ProfileId::from(profile.id.as_str());
                let strategy = registry
                    .resolve(device.model.as_deref(), &profile_id, None)
                    .name();
                let columns = metadata.column_count().saturating_sub(1);
                let rows = fill(&meter, metadata.logical_name, strategy, columns, options, now);
                debug!(
                    "Simulated {} rows of {} ({}) on {}",
                    rows, profile_id, strategy, device.serial
                );
                profiles.push(SimulatedProfile {
                    device_id: device.serial.clone(),
                    profile_id,
                    strategy,
                    rows,
                });
            }
        }

        if errors.is_empty() {
            Ok(Self { network, profiles })
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Meter of a configured device.
    pub fn meter(&self, device_id: &str) -> Option<Arc<MockMeter>> {
        self.network.meter(device_id)
    }
}

fn fill(
    meter: &MockMeter,
    logical_name: ObisCode,
    strategy: &str,
    columns: usize,
    options: SimulationOptions,
    now: OffsetDateTime,
) -> usize {
    let since = now - options.history;
    let stamps = match strategy {
        "daily" => daily_stamps(since, now),
        "monthly" => monthly_stamps(since, now),
        _ => interval_stamps(since, now, options.capture_period_secs.max(1)),
    };

    let period_secs = if strategy == "interval" {
        options.capture_period_secs.max(1)
    } else {
        0
    };
    meter.add_profile(logical_name, period_secs);
    for (i, t) in stamps.iter().enumerate() {
        meter.push_row(logical_name, *t, register_values(columns, i as u64));
    }
    stamps.len()
}

/// Closed capture periods in `[since, now)`, aligned to the period.
fn interval_stamps(
    since: OffsetDateTime,
    now: OffsetDateTime,
    period_secs: u64,
) -> Vec<OffsetDateTime> {
    let period = Duration::from_secs(period_secs);
    let mut t = align_down(since, period_secs);
    if t < since {
        t += period;
    }
    let mut stamps = Vec::new();
    while t + period <= now {
        stamps.push(t);
        t += period;
    }
    stamps
}

/// Midnights in `[since, now)`.
fn daily_stamps(since: OffsetDateTime, now: OffsetDateTime) -> Vec<OffsetDateTime> {
    let mut t = since.replace_time(Time::MIDNIGHT);
    if t < since {
        t += time::Duration::days(1);
    }
    let mut stamps = Vec::new();
    while t < now {
        stamps.push(t);
        t += time::Duration::days(1);
    }
    stamps
}

/// First days of months from the month containing `since` up to `now`.
fn monthly_stamps(since: OffsetDateTime, now: OffsetDateTime) -> Vec<OffsetDateTime> {
    let mut t =
        since.replace_time(Time::MIDNIGHT) - time::Duration::days(i64::from(since.day()) - 1);
    let mut stamps = Vec::new();
    while t < now {
        stamps.push(t);
        t = add_months(t, 1);
    }
    stamps
}

fn align_down(t: OffsetDateTime, period_secs: u64) -> OffsetDateTime {
    let offset = t.unix_timestamp().rem_euclid(period_secs as i64);
    t - time::Duration::seconds(offset) - time::Duration::nanoseconds(i64::from(t.nanosecond()))
}

/// Cumulative register readings; column `k` rises by `k + 1` per record.
fn register_values(columns: usize, index: u64) -> Vec<Value> {
    (0..columns as u64)
        .map(|k| Value::Unsigned(1_000 * (k + 1) + (k + 1) * index))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use meterlink_types::obis;
    use time::macros::datetime;

    fn config() -> Config {
        toml::from_str(
            r#"
            [[devices]]
            serial = "MTR-1"

            [[devices.profiles]]
            id = "load_profile_1"
            logical_name = "1-0:99.1.0.255"
            capture_objects = ["8/0-0:1.0.0.255/2", "3/1-0:1.8.0.255/2", "3/1-0:2.8.0.255/2"]

            [[devices.profiles]]
            id = "daily_billing"
            logical_name = "0-0:98.2.0.255"
            capture_objects = ["8/0-0:1.0.0.255/2", "3/1-0:1.8.0.255/2"]

            [[devices.profiles]]
            id = "monthly_billing"
            logical_name = "0-0:98.1.0.255"
            capture_objects = ["8/0-0:1.0.0.255/2", "3/1-0:1.8.0.255/2"]
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_interval_stamps_cover_closed_periods() {
        let stamps = interval_stamps(
            datetime!(2024-01-01 00:05 UTC),
            datetime!(2024-01-01 01:10 UTC),
            900,
        );
        assert_eq!(stamps.first(), Some(&datetime!(2024-01-01 00:15 UTC)));
        assert_eq!(stamps.last(), Some(&datetime!(2024-01-01 00:45 UTC)));
        assert_eq!(stamps.len(), 3);
    }

    #[test]
    fn test_calendar_stamps() {
        let daily = daily_stamps(datetime!(2024-01-01 12:00 UTC), datetime!(2024-01-04 06:00 UTC));
        assert_eq!(
            daily,
            vec![
                datetime!(2024-01-02 00:00 UTC),
                datetime!(2024-01-03 00:00 UTC),
                datetime!(2024-01-04 00:00 UTC),
            ]
        );

        let monthly = monthly_stamps(
            datetime!(2024-01-31 12:00 UTC),
            datetime!(2024-03-15 00:00 UTC),
        );
        assert_eq!(
            monthly,
            vec![
                datetime!(2024-01-01 00:00 UTC),
                datetime!(2024-02-01 00:00 UTC),
                datetime!(2024-03-01 00:00 UTC),
            ]
        );
    }

    #[test]
    fn test_simulation_follows_resolved_strategies() {
        let config = config();
        let simulation = Simulation::from_config(
            &config,
            &config.registry(),
            SimulationOptions {
                history: Duration::from_secs(72 * 3600),
                capture_period_secs: 900,
            },
            datetime!(2024-03-10 00:00 UTC),
        )
        .unwrap();

        let strategies: Vec<&str> = simulation.profiles.iter().map(|p| p.strategy).collect();
        assert_eq!(strategies, vec!["interval", "daily", "monthly"]);
        assert_eq!(simulation.profiles[0].rows, 72 * 4);
        assert_eq!(simulation.profiles[1].rows, 3);
        assert_eq!(simulation.profiles[2].rows, 1);

        let meter = simulation.meter("MTR-1").unwrap();
        assert_eq!(meter.row_count(obis::LOAD_PROFILE_1), 72 * 4);
        assert_eq!(meter.row_count(obis::DAILY_BILLING_PROFILE), 3);
    }

    #[test]
    fn test_register_values_match_column_count() {
        let values = register_values(2, 3);
        assert_eq!(values, vec![Value::Unsigned(1_003), Value::Unsigned(2_006)]);
        assert!(register_values(0, 5).is_empty());
    }
}
