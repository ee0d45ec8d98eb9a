use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::services::file_ops::FileOperationType;

/// Task lifecycle status.
///
/// `queued → running → {completed | failed | cancelled}`, `queued → cancelled`,
/// and `queued | running → interrupted` when found after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Interrupted,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Interrupted => "interrupted",
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }
}

/// Request to create a copy/move task. Paths are root-relative directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTransfer {
    pub operation: FileOperationType,
    pub source_path: String,
    pub target_path: String,
    pub names: Vec<String>,
    pub overwrite_names: Vec<String>,
}

impl NewTransfer {
    pub fn new(
        operation: FileOperationType,
        source_path: impl Into<String>,
        target_path: impl Into<String>,
        names: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            operation,
            source_path: source_path.into(),
            target_path: target_path.into(),
            names: names.into_iter().map(Into::into).collect(),
            overwrite_names: Vec::new(),
        }
    }

    pub fn with_overwrite(mut self, names: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.overwrite_names = names.into_iter().map(Into::into).collect();
        self
    }
}

/// Persisted state of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    /// Insertion order assigned by the store; newest has the highest value.
    #[serde(default)]
    pub sequence: u64,
    pub operation: FileOperationType,
    pub source_path: String,
    pub target_path: String,
    pub names: Vec<String>,
    #[serde(default)]
    pub overwrite_names: Vec<String>,
    pub status: TaskStatus,
    #[serde(default)]
    pub processed_units: u64,
    #[serde(default)]
    pub total_units: u64,
    #[serde(default)]
    pub current_item: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    /// A fresh `queued` record. The store assigns `sequence` on insert.
    pub fn queued(id: String, request: NewTransfer) -> Self {
        let now = Utc::now();
        Self {
            id,
            sequence: 0,
            operation: request.operation,
            source_path: request.source_path,
            target_path: request.target_path,
            names: request.names,
            overwrite_names: request.overwrite_names,
            status: TaskStatus::Queued,
            processed_units: 0,
            total_units: 0,
            current_item: None,
            error: None,
            cancel_requested: false,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    pub fn should_overwrite(&self, name: &str) -> bool {
        self.overwrite_names.iter().any(|n| n == name)
    }

    /// Completed share in percent (0 when nothing was counted yet).
    pub fn percent(&self) -> u8 {
        if self.total_units == 0 {
            return if self.status == TaskStatus::Completed { 100 } else { 0 };
        }
        ((self.processed_units.min(self.total_units) * 100) / self.total_units) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert!(TaskStatus::Queued.is_active());
        assert!(TaskStatus::Running.is_active());
        for status in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
            TaskStatus::Interrupted,
        ] {
            assert!(status.is_terminal(), "{} should be terminal", status.as_str());
        }
    }

    #[test]
    fn record_json_uses_snake_case() {
        let request = NewTransfer::new(FileOperationType::Move, "/a", "/b", ["x"]).with_overwrite(["x"]);
        let record = TaskRecord::queued("t1".to_string(), request);

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"status\":\"queued\""));
        assert!(json.contains("\"operation\":\"move\""));
        assert!(record.should_overwrite("x"));
        assert!(!record.should_overwrite("y"));

        let parsed: TaskRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn percent_is_clamped() {
        let mut record =
            TaskRecord::queued("t".to_string(), NewTransfer::new(FileOperationType::Copy, "/a", "/b", ["x"]));
        assert_eq!(record.percent(), 0);
        record.total_units = 4;
        record.processed_units = 1;
        assert_eq!(record.percent(), 25);
        record.processed_units = 9;
        assert_eq!(record.percent(), 100);
    }
}
