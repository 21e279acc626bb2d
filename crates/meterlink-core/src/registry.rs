//! Profile behaviour lookup.
//!
//! Interval profiles, daily billing profiles and monthly billing profiles are
//! read in different windows and advance their cursors differently. The
//! [`ProfileRegistry`] maps a (meter model, profile id) pair to the
//! [`ProfileStrategy`] that owns that arithmetic. It is built once at startup;
//! lookups never fail and fall back to interval behaviour.
//!
//! | Strategy | Window | Next start after rows | Next start after an empty window |
//! |----------|--------|-----------------------|----------------------------------|
//! | [`IntervalProfile`] | `batch_size` periods | newest row + 1 period | window end + 1 period |
//! | [`DailyProfile`] | 1 day | newest row + 1 day | window end + 1 day |
//! | [`MonthlyProfile`] | 1 month | newest row, at least one month on | window end |
//!
//! Profile ids that start with one of the configured daily or monthly prefixes
//! use the calendar strategies without an explicit registration.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use meterlink_types::timestamp::add_months;
use meterlink_types::{CapturePeriod, DEFAULT_CAPTURE_PERIOD_SECS, ProfileId};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// One read window of a synchronization cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Start of the window (the cursor).
    pub from: OffsetDateTime,
    /// End of the window.
    pub to: OffsetDateTime,
    /// Whether `to` was cut back to the current time.
    pub clamped: bool,
}

impl Window {
    /// Build the window `[from, end]`, cut back to `now`.
    pub fn clamp(from: OffsetDateTime, end: OffsetDateTime, now: OffsetDateTime) -> Self {
        Self {
            from,
            to: end.min(now),
            clamped: end > now,
        }
    }
}

/// Window arithmetic for one kind of profile.
pub trait ProfileStrategy: Send + Sync + fmt::Debug {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    /// Period used when neither the store nor the device provides one.
    fn default_period(&self) -> CapturePeriod;

    /// Interpret the capture period attribute reported by the device.
    fn period_from_device(&self, raw_secs: u64) -> CapturePeriod;

    /// Apply the device rules to a period that came from the cache or the
    /// store, so a raw 0 or 1 still means one calendar unit.
    fn normalize_period(&self, period: CapturePeriod) -> CapturePeriod {
        match period {
            CapturePeriod::Seconds(secs @ 0..=1) => self.period_from_device(secs.unsigned_abs()),
            other => other,
        }
    }

    /// End of the window starting at `from`, before clamping to now.
    fn window_end(
        &self,
        from: OffsetDateTime,
        period: CapturePeriod,
        batch_size: u32,
    ) -> OffsetDateTime;

    /// Next window start after rows up to `advance_to` were persisted.
    fn next_after_batch(
        &self,
        window: &Window,
        advance_to: OffsetDateTime,
        period: CapturePeriod,
    ) -> OffsetDateTime;

    /// Next window start after `window` was read without rows.
    fn next_after_empty(&self, window: &Window, period: CapturePeriod) -> OffsetDateTime;
}

fn seconds_or_default(raw_secs: u64) -> CapturePeriod {
    match i64::try_from(raw_secs) {
        Ok(0) | Err(_) => CapturePeriod::Seconds(DEFAULT_CAPTURE_PERIOD_SECS),
        Ok(secs) => CapturePeriod::Seconds(secs),
    }
}

/// Fixed-interval profiles such as load profiles.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntervalProfile;

impl ProfileStrategy for IntervalProfile {
    fn name(&self) -> &'static str {
        "interval"
    }

    fn default_period(&self) -> CapturePeriod {
        CapturePeriod::default()
    }

    fn period_from_device(&self, raw_secs: u64) -> CapturePeriod {
        seconds_or_default(raw_secs)
    }

    fn window_end(
        &self,
        from: OffsetDateTime,
        period: CapturePeriod,
        batch_size: u32,
    ) -> OffsetDateTime {
        period.add_to(from, i64::from(batch_size.max(1)))
    }

    fn next_after_batch(
        &self,
        _window: &Window,
        advance_to: OffsetDateTime,
        period: CapturePeriod,
    ) -> OffsetDateTime {
        period.add_to(advance_to, 1)
    }

    fn next_after_empty(&self, window: &Window, period: CapturePeriod) -> OffsetDateTime {
        period.add_to(window.to, 1)
    }
}

/// Daily billing profiles: one calendar day per window.
#[derive(Debug, Default, Clone, Copy)]
pub struct DailyProfile;

impl ProfileStrategy for DailyProfile {
    fn name(&self) -> &'static str {
        "daily"
    }

    fn default_period(&self) -> CapturePeriod {
        CapturePeriod::Daily
    }

    fn period_from_device(&self, raw_secs: u64) -> CapturePeriod {
        match raw_secs {
            0 | 1 => CapturePeriod::Daily,
            secs => seconds_or_default(secs),
        }
    }

    fn window_end(&self, from: OffsetDateTime, _: CapturePeriod, _: u32) -> OffsetDateTime {
        from + time::Duration::days(1)
    }

    fn next_after_batch(
        &self,
        _window: &Window,
        advance_to: OffsetDateTime,
        _: CapturePeriod,
    ) -> OffsetDateTime {
        advance_to + time::Duration::days(1)
    }

    fn next_after_empty(&self, window: &Window, _: CapturePeriod) -> OffsetDateTime {
        window.to + time::Duration::days(1)
    }
}

/// Monthly billing profiles: one calendar month per window.
///
/// The next window starts at the newest persisted row rather than one unit
/// after it, so a month-start record sitting on a window boundary is read by
/// both windows and deduplicated by the store.
#[derive(Debug, Default, Clone, Copy)]
pub struct MonthlyProfile;

impl ProfileStrategy for MonthlyProfile {
    fn name(&self) -> &'static str {
        "monthly"
    }

    fn default_period(&self) -> CapturePeriod {
        CapturePeriod::Monthly
    }

    fn period_from_device(&self, raw_secs: u64) -> CapturePeriod {
        match raw_secs {
            0 | 1 => CapturePeriod::Monthly,
            secs => seconds_or_default(secs),
        }
    }

    fn window_end(&self, from: OffsetDateTime, _: CapturePeriod, _: u32) -> OffsetDateTime {
        add_months(from, 1)
    }

    fn next_after_batch(
        &self,
        window: &Window,
        advance_to: OffsetDateTime,
        _: CapturePeriod,
    ) -> OffsetDateTime {
        advance_to.max(add_months(window.from, 1))
    }

    fn next_after_empty(&self, window: &Window, _: CapturePeriod) -> OffsetDateTime {
        window.to
    }
}

/// Profile id prefixes that select the calendar strategies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Prefixes of daily profiles (case-insensitive).
    pub daily_prefixes: Vec<String>,
    /// Prefixes of monthly profiles (case-insensitive).
    pub monthly_prefixes: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            daily_prefixes: vec!["daily".to_string(), "0-0:98.2.0".to_string()],
            monthly_prefixes: vec!["monthly".to_string(), "0-0:98.1.0".to_string()],
        }
    }
}

/// Maps (model, profile id) to a [`ProfileStrategy`].
#[derive(Debug, Clone)]
pub struct ProfileRegistry {
    config: RegistryConfig,
    by_model: HashMap<(String, ProfileId), Arc<dyn ProfileStrategy>>,
    by_profile: HashMap<ProfileId, Arc<dyn ProfileStrategy>>,
    interval: Arc<dyn ProfileStrategy>,
    daily: Arc<dyn ProfileStrategy>,
    monthly: Arc<dyn ProfileStrategy>,
}

impl Default for ProfileRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl ProfileRegistry {
    /// Create a registry with the built-in strategies.
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            by_model: HashMap::new(),
            by_profile: HashMap::new(),
            interval: Arc::new(IntervalProfile),
            daily: Arc::new(DailyProfile),
            monthly: Arc::new(MonthlyProfile),
        }
    }

    /// Prefix configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Use `strategy` for `profile_id` on every model.
    #[must_use]
    pub fn with_profile(
        mut self,
        profile_id: impl Into<ProfileId>,
        strategy: Arc<dyn ProfileStrategy>,
    ) -> Self {
        self.by_profile.insert(profile_id.into(), strategy);
        self
    }

    /// Use `strategy` for `profile_id` on meters of `model`.
    #[must_use]
    pub fn with_model_profile(
        mut self,
        model: &str,
        profile_id: impl Into<ProfileId>,
        strategy: Arc<dyn ProfileStrategy>,
    ) -> Self {
        self.by_model
            .insert((model.to_ascii_lowercase(), profile_id.into()), strategy);
        self
    }

    /// Whether the profile id carries one of the daily prefixes.
    pub fn is_daily(&self, profile_id: &ProfileId) -> bool {
        self.config
            .daily_prefixes
            .iter()
            .any(|p| profile_id.has_prefix(p))
    }

    /// Whether the profile id carries one of the monthly prefixes.
    pub fn is_monthly(&self, profile_id: &ProfileId) -> bool {
        self.config
            .monthly_prefixes
            .iter()
            .any(|p| profile_id.has_prefix(p))
    }

    /// Find the strategy for a profile.
    ///
    /// Lookup order: model registration, profile registration, id prefix,
    /// calendar `period`, interval.
    pub fn resolve(
        &self,
        model: Option<&str>,
        profile_id: &ProfileId,
        period: Option<CapturePeriod>,
    ) -> Arc<dyn ProfileStrategy> {
        if let Some(model) = model
            && let Some(strategy) = self
                .by_model
                .get(&(model.to_ascii_lowercase(), profile_id.clone()))
        {
            return Arc::clone(strategy);
        }
        if let Some(strategy) = self.by_profile.get(profile_id) {
            return Arc::clone(strategy);
        }
        if self.is_monthly(profile_id) {
            return Arc::clone(&self.monthly);
        }
        if self.is_daily(profile_id) {
            return Arc::clone(&self.daily);
        }
        match period {
            Some(CapturePeriod::Monthly) => Arc::clone(&self.monthly),
            Some(CapturePeriod::Daily) => Arc::clone(&self.daily),
            _ => Arc::clone(&self.interval),
        }
    }
}
