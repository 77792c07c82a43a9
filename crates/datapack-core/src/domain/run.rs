use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::timestamp::UtcDateTime;
use crate::ValidationError;

/// Lifecycle of a collection run; also used for per-entity outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionStatus {
    Pending,
    Running,
    Complete,
    Partial,
    Failed,
}

impl CollectionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Partial | Self::Failed)
    }

    const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending | Self::Running, Self::Failed) => true,
            (Self::Running, Self::Complete | Self::Partial) => true,
            _ => false,
        }
    }
}

impl Display for CollectionStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CollectionStatus {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "complete" => Ok(Self::Complete),
            "partial" => Ok(Self::Partial),
            "failed" => Ok(Self::Failed),
            _ => Err(ValidationError::InvalidStatus {
                value: value.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl Severity {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
        }
    }
}

impl FromStr for Severity {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "error" => Ok(Self::Error),
            "warning" => Ok(Self::Warning),
            _ => Err(ValidationError::InvalidSeverity {
                value: value.to_owned(),
            }),
        }
    }
}

/// One execution of a collection for one industry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionRun {
    pub id: String,
    pub industry_id: String,
    pub datapack_id: String,
    status: CollectionStatus,
    pub started_at: UtcDateTime,
    completed_at: Option<UtcDateTime>,
    pub companies_total: u32,
    pub companies_success: u32,
    /// Companies with some but not all required datapoints.
    pub companies_partial: u32,
    pub companies_failed: u32,
    pub gate_passed: Option<bool>,
    pub error_count: u32,
    pub warning_count: u32,
    pub file_path: Option<String>,
    pub file_size_bytes: Option<u64>,
    pub duration_seconds: Option<u64>,
}

impl CollectionRun {
    /// A fresh `pending` run with newly generated run and datapack ids.
    pub fn pending(
        industry_id: impl Into<String>,
        companies_total: u32,
        started_at: UtcDateTime,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            industry_id: industry_id.into(),
            datapack_id: Uuid::new_v4().to_string(),
            status: CollectionStatus::Pending,
            started_at,
            completed_at: None,
            companies_total,
            companies_success: 0,
            companies_partial: 0,
            companies_failed: 0,
            gate_passed: None,
            error_count: 0,
            warning_count: 0,
            file_path: None,
            file_size_bytes: None,
            duration_seconds: None,
        }
    }

    /// Rebuild a run from stored columns.
    pub(crate) fn restore(
        id: String,
        industry_id: String,
        datapack_id: String,
        status: CollectionStatus,
        started_at: UtcDateTime,
        completed_at: Option<UtcDateTime>,
    ) -> Self {
        Self {
            id,
            industry_id,
            datapack_id,
            status,
            started_at,
            completed_at,
            companies_total: 0,
            companies_success: 0,
            companies_partial: 0,
            companies_failed: 0,
            gate_passed: None,
            error_count: 0,
            warning_count: 0,
            file_path: None,
            file_size_bytes: None,
            duration_seconds: None,
        }
    }

    pub fn status(&self) -> CollectionStatus {
        self.status
    }

    pub fn completed_at(&self) -> Option<UtcDateTime> {
        self.completed_at
    }

    pub fn start(&mut self) -> Result<(), ValidationError> {
        self.transition(CollectionStatus::Running)
    }

    /// Move to a terminal status, stamping `completed_at` and the duration.
    pub fn finish(
        &mut self,
        status: CollectionStatus,
        completed_at: UtcDateTime,
    ) -> Result<(), ValidationError> {
        if !status.is_terminal() {
            return Err(ValidationError::InvalidStatusTransition {
                from: self.status.as_str(),
                to: status.as_str(),
            });
        }
        self.transition(status)?;
        self.completed_at = Some(completed_at);
        self.duration_seconds = Some(self.started_at.until(completed_at).as_secs());
        Ok(())
    }

    fn transition(&mut self, next: CollectionStatus) -> Result<(), ValidationError> {
        if !self.status.can_transition_to(next) {
            return Err(ValidationError::InvalidStatusTransition {
                from: self.status.as_str(),
                to: next.as_str(),
            });
        }
        self.status = next;
        Ok(())
    }
}

/// An error or warning recorded against a run. Append-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionError {
    pub severity: Severity,
    pub code: String,
    pub message: String,
    pub path: Option<String>,
    pub ticker: Option<String>,
}

impl CollectionError {
    pub fn new(severity: Severity, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            code: code.into(),
            message: message.into(),
            path: None,
            ticker: None,
        }
    }

    #[must_use]
    pub fn at_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    #[must_use]
    pub fn for_ticker(mut self, ticker: impl Into<String>) -> Self {
        self.ticker = Some(ticker.into());
        self
    }
}
