//! Fixed-window call counting per external service.
//!
//! Each service may have a minute, hour and day limit. Windows are aligned
//! to wall-clock boundaries in UTC and reset when the boundary passes.
//! Services without configured limits are unlimited.

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

/// Usage ratio at which a service enters [`QuotaLevel::Warning`].
pub const WARNING_THRESHOLD: f64 = 0.75;

/// Usage ratio at which a service enters [`QuotaLevel::Critical`].
pub const CRITICAL_THRESHOLD: f64 = 0.90;

/// Limits for one service. `None` means the window is unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLimits {
    /// Calls per minute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_minute: Option<u32>,
    /// Calls per hour.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_hour: Option<u32>,
    /// Calls per UTC day.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_day: Option<u32>,
}

impl ServiceLimits {
    /// Sets the per-minute limit.
    #[must_use]
    pub fn per_minute(mut self, limit: u32) -> Self {
        self.per_minute = Some(limit);
        self
    }

    /// Sets the per-hour limit.
    #[must_use]
    pub fn per_hour(mut self, limit: u32) -> Self {
        self.per_hour = Some(limit);
        self
    }

    /// Sets the per-day limit.
    #[must_use]
    pub fn per_day(mut self, limit: u32) -> Self {
        self.per_day = Some(limit);
        self
    }

    /// Returns true if no window is limited.
    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.per_minute.is_none() && self.per_hour.is_none() && self.per_day.is_none()
    }
}

/// How close a service is to its quota.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaLevel {
    /// Below 75% of every window.
    #[default]
    Normal,
    /// At least 75% of some window.
    Warning,
    /// At least 90% of some window.
    Critical,
    /// Some window is used up.
    Exhausted,
}

impl QuotaLevel {
    fn from_ratio(ratio: f64) -> Self {
        if ratio >= 1.0 {
            Self::Exhausted
        } else if ratio >= CRITICAL_THRESHOLD {
            Self::Critical
        } else if ratio >= WARNING_THRESHOLD {
            Self::Warning
        } else {
            Self::Normal
        }
    }
}

impl fmt::Display for QuotaLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
            Self::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// Result of a quota check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateDecision {
    /// Whether one more call fits in every window.
    pub allowed: bool,
    /// Calls left in the most constrained window; `None` if unlimited.
    pub remaining_quota: Option<u32>,
    /// Milliseconds until the most constrained window resets, when the
    /// level is critical or worse; otherwise zero.
    pub retry_after_ms: u64,
    /// Usage level over the most constrained window.
    pub level: QuotaLevel,
}

impl RateDecision {
    fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining_quota: None,
            retry_after_ms: 0,
            level: QuotaLevel::Normal,
        }
    }
}

/// Current counters for a service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ServiceUsage {
    /// Calls in the current minute.
    pub requests_this_minute: u32,
    /// Calls in the current hour.
    pub requests_this_hour: u32,
    /// Calls in the current UTC day.
    pub requests_today: u32,
    /// Configured limits.
    pub limits: ServiceLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WindowKind {
    Minute,
    Hour,
    Day,
}

impl WindowKind {
    fn start_of(self, now: DateTime<Utc>) -> DateTime<Utc> {
        let truncated = match self {
            Self::Minute => now.with_second(0),
            Self::Hour => now.with_second(0).and_then(|t| t.with_minute(0)),
            Self::Day => now
                .with_second(0)
                .and_then(|t| t.with_minute(0))
                .and_then(|t| t.with_hour(0)),
        };
        truncated
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(now)
    }

    fn length(self) -> ChronoDuration {
        match self {
            Self::Minute => ChronoDuration::minutes(1),
            Self::Hour => ChronoDuration::hours(1),
            Self::Day => ChronoDuration::days(1),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    kind: WindowKind,
    started: DateTime<Utc>,
    count: u32,
}

impl Window {
    fn new(kind: WindowKind, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            started: kind.start_of(now),
            count: 0,
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        let start = self.kind.start_of(now);
        if start != self.started {
            self.started = start;
            self.count = 0;
        }
    }

    fn resets_in_ms(&self, now: DateTime<Utc>) -> u64 {
        let reset = self.started + self.kind.length();
        u64::try_from((reset - now).num_milliseconds().max(0)).unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
struct ServiceState {
    minute: Window,
    hour: Window,
    day: Window,
}

impl ServiceState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            minute: Window::new(WindowKind::Minute, now),
            hour: Window::new(WindowKind::Hour, now),
            day: Window::new(WindowKind::Day, now),
        }
    }

    fn roll(&mut self, now: DateTime<Utc>) {
        self.minute.roll(now);
        self.hour.roll(now);
        self.day.roll(now);
    }

    fn windows(&self, limits: &ServiceLimits) -> [(Window, Option<u32>); 3] {
        [
            (self.minute, limits.per_minute),
            (self.hour, limits.per_hour),
            (self.day, limits.per_day),
        ]
    }

    fn decide(&self, limits: &ServiceLimits, now: DateTime<Utc>) -> RateDecision {
        let mut decision = RateDecision::unlimited();
        let mut worst_ratio = -1.0_f64;
        let mut worst: Option<Window> = None;

        for (window, limit) in self.windows(limits) {
            let Some(limit) = limit else { continue };
            let remaining = limit.saturating_sub(window.count);
            decision.remaining_quota = Some(decision.remaining_quota.map_or(remaining, |r| r.min(remaining)));
            if remaining == 0 {
                decision.allowed = false;
            }
            let ratio = if limit == 0 {
                1.0
            } else {
                f64::from(window.count) / f64::from(limit)
            };
            if ratio > worst_ratio {
                worst_ratio = ratio;
                worst = Some(window);
            }
        }

        if let Some(window) = worst {
            decision.level = QuotaLevel::from_ratio(worst_ratio);
            if decision.level >= QuotaLevel::Critical {
                decision.retry_after_ms = if decision.allowed {
                    window.resets_in_ms(now)
                } else {
                    // Wait for every exhausted window to reopen.
                    self.windows(limits)
                        .iter()
                        .filter(|(w, l)| l.is_some_and(|l| w.count >= l))
                        .map(|(w, _)| w.resets_in_ms(now))
                        .max()
                        .unwrap_or(0)
                };
            }
        }
        decision
    }

    fn record(&mut self) {
        self.minute.count = self.minute.count.saturating_add(1);
        self.hour.count = self.hour.count.saturating_add(1);
        self.day.count = self.day.count.saturating_add(1);
    }
}

/// Per-service fixed-window rate limiter.
///
/// Shared behind an `Arc`; every operation locks only the service's entry.
#[derive(Debug, Default)]
pub struct RateLimiter {
    limits: DashMap<String, ServiceLimits>,
    state: DashMap<String, ServiceState>,
}

impl RateLimiter {
    /// Creates a limiter with no limits.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a limiter from a service → limits map.
    #[must_use]
    pub fn with_limits(limits: &BTreeMap<String, ServiceLimits>) -> Self {
        let limiter = Self::new();
        for (service, l) in limits {
            limiter.set_limits(service, *l);
        }
        limiter
    }

    /// Sets or replaces the limits of a service.
    pub fn set_limits(&self, service: &str, limits: ServiceLimits) {
        self.limits.insert(service.to_string(), limits);
    }

    /// Returns the limits configured for a service.
    #[must_use]
    pub fn limits(&self, service: &str) -> Option<ServiceLimits> {
        self.limits.get(service).map(|l| *l)
    }

    /// Checks whether one more call is allowed, without recording it.
    #[must_use]
    pub fn check(&self, service: &str) -> RateDecision {
        self.check_at(service, Utc::now())
    }

    /// [`RateLimiter::check`] at an explicit instant.
    #[must_use]
    pub fn check_at(&self, service: &str, now: DateTime<Utc>) -> RateDecision {
        let Some(limits) = self.limits(service).filter(|l| !l.is_unlimited()) else {
            return RateDecision::unlimited();
        };
        let mut entry = self
            .state
            .entry(service.to_string())
            .or_insert_with(|| ServiceState::new(now));
        entry.roll(now);
        entry.decide(&limits, now)
    }

    /// Records one call.
    pub fn record_call(&self, service: &str) {
        self.record_call_at(service, Utc::now());
    }

    /// [`RateLimiter::record_call`] at an explicit instant.
    pub fn record_call_at(&self, service: &str, now: DateTime<Utc>) {
        let mut entry = self
            .state
            .entry(service.to_string())
            .or_insert_with(|| ServiceState::new(now));
        entry.roll(now);
        entry.record();
        debug!(service = %service, today = entry.day.count, "Recorded external call");
    }

    /// Checks and records in one step; records only when allowed.
    pub fn try_acquire(&self, service: &str) -> RateDecision {
        self.try_acquire_at(service, Utc::now())
    }

    /// [`RateLimiter::try_acquire`] at an explicit instant.
    pub fn try_acquire_at(&self, service: &str, now: DateTime<Utc>) -> RateDecision {
        let limits = self.limits(service).unwrap_or_default();
        let mut entry = self
            .state
            .entry(service.to_string())
            .or_insert_with(|| ServiceState::new(now));
        entry.roll(now);
        let decision = if limits.is_unlimited() {
            RateDecision::unlimited()
        } else {
            entry.decide(&limits, now)
        };
        if decision.allowed {
            entry.record();
        } else {
            warn!(
                service = %service,
                retry_after_ms = decision.retry_after_ms,
                "Quota exhausted"
            );
        }
        decision
    }

    /// Current counters for a service.
    #[must_use]
    pub fn usage(&self, service: &str) -> ServiceUsage {
        self.usage_at(service, Utc::now())
    }

    /// [`RateLimiter::usage`] at an explicit instant.
    #[must_use]
    pub fn usage_at(&self, service: &str, now: DateTime<Utc>) -> ServiceUsage {
        let limits = self.limits(service).unwrap_or_default();
        match self.state.get_mut(service) {
            Some(mut entry) => {
                entry.roll(now);
                ServiceUsage {
                    requests_this_minute: entry.minute.count,
                    requests_this_hour: entry.hour.count,
                    requests_today: entry.day.count,
                    limits,
                }
            }
            None => ServiceUsage {
                limits,
                ..ServiceUsage::default()
            },
        }
    }

    /// Clears the counters of a service.
    pub fn reset(&self, service: &str) {
        self.state.remove(service);
    }
}
