//! Quota and spend limits for external services.
//!
//! - [`RateLimiter`]: fixed-window call counts per service
//! - [`CostTracker`]: session, daily and monthly spend against [`Budgets`]

mod cost_tracker;
mod rate_limiter;

pub use cost_tracker::{Budgets, CostError, CostTracker, SessionSummary, Spending};
pub use rate_limiter::{
    QuotaLevel, RateDecision, RateLimiter, ServiceLimits, ServiceUsage, CRITICAL_THRESHOLD,
    WARNING_THRESHOLD,
};
