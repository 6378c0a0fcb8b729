//! Spend accounting against per-run, daily and monthly budgets.
//!
//! Amounts are dollars. Daily and monthly totals roll over on UTC
//! boundaries and can be persisted to a small JSON ledger so that
//! consecutive runs share them.

use crate::errors::{BudgetExceeded, BudgetPeriod};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Spend ceilings. `None` disables a check.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Budgets {
    /// Ceiling for the current session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_run: Option<f64>,
    /// Ceiling for the current UTC day.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily: Option<f64>,
    /// Ceiling for the current UTC month.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly: Option<f64>,
}

impl Budgets {
    /// Sets the per-run ceiling.
    #[must_use]
    pub fn with_per_run(mut self, limit: f64) -> Self {
        self.per_run = Some(limit);
        self
    }

    /// Sets the daily ceiling.
    #[must_use]
    pub fn with_daily(mut self, limit: f64) -> Self {
        self.daily = Some(limit);
        self
    }

    /// Sets the monthly ceiling.
    #[must_use]
    pub fn with_monthly(mut self, limit: f64) -> Self {
        self.monthly = Some(limit);
        self
    }
}

/// Spend totals at a point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Spending {
    /// Current session.
    pub session: f64,
    /// Current UTC day.
    pub daily: f64,
    /// Current UTC month.
    pub monthly: f64,
}

/// Summary returned when a session ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    /// Session id, usually the run id.
    pub session_id: String,
    /// When the session started.
    pub started_at: DateTime<Utc>,
    /// When the session ended.
    pub ended_at: DateTime<Utc>,
    /// Total spend.
    pub total: f64,
    /// Spend per category.
    pub by_category: BTreeMap<String, f64>,
    /// Caller-supplied metadata.
    pub metadata: Map<String, Value>,
}

/// Cost tracker failures.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CostError {
    /// Negative, NaN or infinite amount.
    #[error("Invalid spend amount: {0}")]
    InvalidAmount(f64),

    /// The ledger could not be read.
    #[error("Cost ledger error: {0}")]
    Ledger(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LedgerFile {
    day: NaiveDate,
    daily: f64,
    month: String,
    monthly: f64,
}

#[derive(Debug, Clone)]
struct Session {
    id: String,
    started_at: DateTime<Utc>,
    total: f64,
    by_category: BTreeMap<String, f64>,
    metadata: Map<String, Value>,
}

#[derive(Debug)]
struct TrackerState {
    session: Option<Session>,
    day: NaiveDate,
    daily: f64,
    month: String,
    monthly: f64,
}

fn month_key(now: DateTime<Utc>) -> String {
    format!("{:04}-{:02}", now.year(), now.month())
}

impl TrackerState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            session: None,
            day: now.date_naive(),
            daily: 0.0,
            month: month_key(now),
            monthly: 0.0,
        }
    }

    fn maybe_reset(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.day {
            debug!(previous = %self.day, today = %today, "Resetting daily spend");
            self.day = today;
            self.daily = 0.0;
        }
        let month = month_key(now);
        if month != self.month {
            debug!(previous = %self.month, month = %month, "Resetting monthly spend");
            self.month = month;
            self.monthly = 0.0;
        }
    }

    fn spending(&self) -> Spending {
        Spending {
            session: self.session.as_ref().map_or(0.0, |s| s.total),
            daily: self.daily,
            monthly: self.monthly,
        }
    }

    fn ledger(&self) -> LedgerFile {
        LedgerFile {
            day: self.day,
            daily: self.daily,
            month: self.month.clone(),
            monthly: self.monthly,
        }
    }
}

/// Tracks spend for one session at a time plus rolling daily/monthly totals.
#[derive(Debug)]
pub struct CostTracker {
    state: Mutex<TrackerState>,
    ledger_path: Option<PathBuf>,
}

impl Default for CostTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CostTracker {
    /// Creates an in-memory tracker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TrackerState::new(Utc::now())),
            ledger_path: None,
        }
    }

    /// Creates a tracker persisted to a JSON ledger file.
    ///
    /// A missing ledger starts from zero; totals from a past day or month
    /// are discarded.
    ///
    /// # Errors
    ///
    /// Returns [`CostError::Ledger`] if the file exists but cannot be read
    /// or parsed.
    pub fn with_ledger(path: impl Into<PathBuf>) -> Result<Self, CostError> {
        let path = path.into();
        let now = Utc::now();
        let mut state = TrackerState::new(now);

        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let ledger: LedgerFile = serde_json::from_str(&raw)
                    .map_err(|e| CostError::Ledger(format!("{}: {e}", path.display())))?;
                state.day = ledger.day;
                state.daily = ledger.daily;
                state.month = ledger.month;
                state.monthly = ledger.monthly;
                state.maybe_reset(now);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(CostError::Ledger(format!("{}: {e}", path.display()))),
        }

        Ok(Self {
            state: Mutex::new(state),
            ledger_path: Some(path),
        })
    }

    /// Path of the ledger, if persisted.
    #[must_use]
    pub fn ledger_path(&self) -> Option<&Path> {
        self.ledger_path.as_deref()
    }

    /// Starts a new session, replacing any open one.
    pub fn start_session(&self, session_id: impl Into<String>, metadata: Map<String, Value>) {
        let session_id = session_id.into();
        let mut state = self.state.lock();
        if let Some(previous) = state.session.as_ref() {
            warn!(previous = %previous.id, "Replacing open cost session");
        }
        info!(session_id = %session_id, "Cost session started");
        state.session = Some(Session {
            id: session_id,
            started_at: Utc::now(),
            total: 0.0,
            by_category: BTreeMap::new(),
            metadata,
        });
    }

    /// Records spend in the open session and the daily/monthly totals.
    ///
    /// # Errors
    ///
    /// Returns [`CostError::InvalidAmount`] for negative or non-finite
    /// amounts.
    pub fn record_spend(&self, amount: f64, category: &str) -> Result<Spending, CostError> {
        self.record_spend_at(amount, category, Utc::now())
    }

    /// [`CostTracker::record_spend`] at an explicit instant.
    ///
    /// # Errors
    ///
    /// Returns [`CostError::InvalidAmount`] for negative or non-finite
    /// amounts.
    pub fn record_spend_at(
        &self,
        amount: f64,
        category: &str,
        now: DateTime<Utc>,
    ) -> Result<Spending, CostError> {
        if !amount.is_finite() || amount < 0.0 {
            return Err(CostError::InvalidAmount(amount));
        }

        let (spending, ledger) = {
            let mut state = self.state.lock();
            state.maybe_reset(now);
            state.daily += amount;
            state.monthly += amount;
            if let Some(session) = state.session.as_mut() {
                session.total += amount;
                *session.by_category.entry(category.to_string()).or_insert(0.0) += amount;
            }
            (state.spending(), state.ledger())
        };

        debug!(
            category = %category,
            amount = amount,
            session = spending.session,
            daily = spending.daily,
            monthly = spending.monthly,
            "Recorded spend"
        );
        self.persist(&ledger);
        Ok(spending)
    }

    /// Current totals.
    #[must_use]
    pub fn current_spending(&self) -> Spending {
        self.current_spending_at(Utc::now())
    }

    /// [`CostTracker::current_spending`] at an explicit instant.
    #[must_use]
    pub fn current_spending_at(&self, now: DateTime<Utc>) -> Spending {
        let mut state = self.state.lock();
        state.maybe_reset(now);
        state.spending()
    }

    /// Spend per category in the open session.
    #[must_use]
    pub fn breakdown(&self) -> BTreeMap<String, f64> {
        self.state
            .lock()
            .session
            .as_ref()
            .map(|s| s.by_category.clone())
            .unwrap_or_default()
    }

    /// Checks totals against the budgets, in run, daily, monthly order.
    ///
    /// A total equal to its limit counts as exceeded.
    ///
    /// # Errors
    ///
    /// Returns the first [`BudgetExceeded`] found.
    pub fn check_budget(&self, budgets: &Budgets) -> Result<(), BudgetExceeded> {
        self.check_budget_at(budgets, Utc::now())
    }

    /// [`CostTracker::check_budget`] at an explicit instant.
    ///
    /// # Errors
    ///
    /// Returns the first [`BudgetExceeded`] found.
    pub fn check_budget_at(
        &self,
        budgets: &Budgets,
        now: DateTime<Utc>,
    ) -> Result<(), BudgetExceeded> {
        let spending = self.current_spending_at(now);
        let checks = [
            (BudgetPeriod::Run, spending.session, budgets.per_run),
            (BudgetPeriod::Daily, spending.daily, budgets.daily),
            (BudgetPeriod::Monthly, spending.monthly, budgets.monthly),
        ];
        for (period, spent, limit) in checks {
            if let Some(limit) = limit {
                if spent >= limit {
                    warn!(period = %period, spent = spent, limit = limit, "Budget exceeded");
                    return Err(BudgetExceeded {
                        period,
                        spent,
                        limit,
                    });
                }
            }
        }
        Ok(())
    }

    /// Closes the open session and returns its summary.
    pub fn end_session(&self) -> Option<SessionSummary> {
        let session = self.state.lock().session.take()?;
        let summary = SessionSummary {
            session_id: session.id,
            started_at: session.started_at,
            ended_at: Utc::now(),
            total: session.total,
            by_category: session.by_category,
            metadata: session.metadata,
        };
        info!(
            session_id = %summary.session_id,
            total = summary.total,
            "Cost session ended"
        );
        Some(summary)
    }

    fn persist(&self, ledger: &LedgerFile) {
        let Some(path) = self.ledger_path.as_ref() else {
            return;
        };
        if let Err(e) = write_ledger(path, ledger) {
            warn!(path = %path.display(), error = %e, "Failed to persist cost ledger");
        }
    }
}

fn write_ledger(path: &Path, ledger: &LedgerFile) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let body = serde_json::to_vec_pretty(ledger).map_err(std::io::Error::other)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, body)?;
    std::fs::rename(&tmp, path)
}
