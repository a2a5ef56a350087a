use crate::config::QuotaPeriod;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Failure to read plan or usage data. Never a quota decision.
#[derive(Debug, Error)]
pub enum DataAccessError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Plan/usage source unavailable: {0}")]
    Unavailable(String),
}

/// Read side of the subscription and artifact tables
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PlanUsageSource: Send + Sync {
    /// Generation limit of the user's active plan, `None` without an active subscription
    async fn active_plan_limit(&self, user_id: Uuid) -> Result<Option<i64>, DataAccessError>;

    /// Artifacts attributed to the user created at or after `since`
    async fn usage_since(&self, user_id: Uuid, since: DateTime<Utc>) -> Result<i64, DataAccessError>;
}

/// Plan limit and usage observed for one admission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaState {
    pub plan_limit: Option<i64>,
    pub period_usage: i64,
}

/// Why a request was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionReason {
    NoActivePlan,
    LimitReached { limit: i64, used: i64 },
}

impl RejectionReason {
    pub fn code(&self) -> &'static str {
        match self {
            RejectionReason::NoActivePlan => "NO_ACTIVE_PLAN",
            RejectionReason::LimitReached { .. } => "LIMIT_REACHED",
        }
    }

    /// Message shown to the requester
    pub fn message(&self) -> &'static str {
        match self {
            RejectionReason::NoActivePlan => "No active subscription or plan found.",
            RejectionReason::LimitReached { .. } => "Generation limit reached for your plan.",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::NoActivePlan => f.write_str("no active plan"),
            RejectionReason::LimitReached { .. } => f.write_str("limit reached"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted(QuotaState),
    Rejected(RejectionReason),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Admission::Admitted(_))
    }
}

/// Quota gate.
///
/// Recomputes plan limit and period usage on every call and reserves nothing.
/// Two concurrent requests can both pass before either artifact is recorded;
/// that over-admission window is accepted.
pub struct QuotaGate {
    source: Arc<dyn PlanUsageSource>,
    period: QuotaPeriod,
}

impl QuotaGate {
    pub fn new(source: Arc<dyn PlanUsageSource>, period: QuotaPeriod) -> Self {
        Self { source, period }
    }

    /// Decide admission for `user_id` now
    pub async fn admit(&self, user_id: Uuid) -> Result<Admission, DataAccessError> {
        self.admit_at(user_id, Utc::now()).await
    }

    /// Decide admission as of `now`
    #[instrument(skip(self))]
    pub async fn admit_at(
        &self,
        user_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Admission, DataAccessError> {
        let Some(limit) = self.source.active_plan_limit(user_id).await? else {
            return Ok(self.reject(user_id, RejectionReason::NoActivePlan));
        };

        let since = self.period.start(now);
        let used = self.source.usage_since(user_id, since).await?;

        debug!(user_id = %user_id, limit, used, since = %since, "Quota state");

        if used >= limit {
            return Ok(self.reject(user_id, RejectionReason::LimitReached { limit, used }));
        }

        metrics::counter!("generation.admission.admitted").increment(1);
        Ok(Admission::Admitted(QuotaState {
            plan_limit: Some(limit),
            period_usage: used,
        }))
    }

    fn reject(&self, user_id: Uuid, reason: RejectionReason) -> Admission {
        info!(user_id = %user_id, reason = %reason, "Admission rejected");
        metrics::counter!("generation.admission.rejected", "reason" => reason.code()).increment(1);
        Admission::Rejected(reason)
    }
}
