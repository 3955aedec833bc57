use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a task and of each attempt row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Accepted by the broker, not yet picked up
    Pending,
    /// A worker started an attempt
    Running,
    /// Last attempt finished without error
    Success,
    /// Last attempt failed; the broker may still retry
    Fail,
    /// The broker gave up on the task
    Dead,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Success,
        TaskStatus::Fail,
        TaskStatus::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Success => "success",
            TaskStatus::Fail => "fail",
            TaskStatus::Dead => "dead",
        }
    }

    /// Statuses an attempt report may carry.
    pub fn is_reportable(&self) -> bool {
        !matches!(self, TaskStatus::Pending)
    }

    /// Outcome of a finished attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Fail | TaskStatus::Dead)
    }

    /// Only finished lineages may be replayed.
    pub fn is_replayable(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Fail)
    }

    /// Whether a task row in `self` may move to `next`.
    ///
    /// `fail` stays open because the broker retries on its own; a terminal
    /// report can also arrive after a lost `running` report.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;

        match (self, next) {
            (Pending, Running) => true,
            (Pending, Success | Fail | Dead) => true,
            (Running, Running) => true,
            (Running, Success | Fail | Dead) => true,
            (Fail, Success | Fail | Dead) => true,
            (Fail, Running) => false,
            (_, Pending) => false,
            (Success, _) => false,
            (Dead, _) => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "success" => Ok(TaskStatus::Success),
            "fail" => Ok(TaskStatus::Fail),
            "dead" => Ok(TaskStatus::Dead),
            _ => Err(format!("Invalid task status: {s}")),
        }
    }
}
