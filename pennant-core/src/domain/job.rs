//! Job lifecycle
//!
//! A job is one dispatch of a release to a release target. Status transitions
//! form a fixed state machine; terminal states are final.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Job execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    Pending,
    ActionRequired,
    InProgress,
    Completed,
    Failure,
    Cancelled,
    InvalidJobAgent,
    InvalidIntegration,
    ExternalRunNotFound,
}

impl JobStatus {
    /// Terminal states admit no further transitions.
    pub fn is_terminal(self) -> bool {
        !matches!(
            self,
            JobStatus::Pending | JobStatus::ActionRequired | JobStatus::InProgress
        )
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match self {
            JobStatus::Pending => matches!(
                next,
                JobStatus::ActionRequired
                    | JobStatus::InProgress
                    | JobStatus::Cancelled
                    | JobStatus::Failure
                    | JobStatus::InvalidJobAgent
            ),
            JobStatus::ActionRequired => {
                matches!(next, JobStatus::InProgress | JobStatus::Failure)
            }
            JobStatus::InProgress => matches!(
                next,
                JobStatus::Completed
                    | JobStatus::Failure
                    | JobStatus::Cancelled
                    | JobStatus::InvalidJobAgent
                    | JobStatus::InvalidIntegration
                    | JobStatus::ExternalRunNotFound
            ),
            _ => false,
        }
    }
}

/// One dispatch of a release to a release target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub release_target_id: Uuid,
    pub release_id: Uuid,
    pub job_agent_id: Option<Uuid>,
    pub status: JobStatus,
    pub message: Option<String>,
    /// Zero-based dispatch attempt for this (target, release) pair.
    pub attempt: i32,
    pub external_run_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [JobStatus; 9] = [
        JobStatus::Pending,
        JobStatus::ActionRequired,
        JobStatus::InProgress,
        JobStatus::Completed,
        JobStatus::Failure,
        JobStatus::Cancelled,
        JobStatus::InvalidJobAgent,
        JobStatus::InvalidIntegration,
        JobStatus::ExternalRunNotFound,
    ];

    #[test]
    fn test_terminal_states_admit_no_transitions() {
        for from in ALL.iter().copied().filter(|s| s.is_terminal()) {
            for to in ALL {
                assert!(!from.can_transition_to(to), "{:?} -> {:?}", from, to);
            }
        }
    }

    #[test]
    fn test_pending_can_be_cancelled_before_dispatch() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Cancelled));
    }

    #[test]
    fn test_in_progress_reaches_all_terminal_outcomes() {
        for to in [
            JobStatus::Completed,
            JobStatus::Failure,
            JobStatus::Cancelled,
            JobStatus::InvalidJobAgent,
            JobStatus::InvalidIntegration,
            JobStatus::ExternalRunNotFound,
        ] {
            assert!(JobStatus::InProgress.can_transition_to(to), "{:?}", to);
        }
    }

    #[test]
    fn test_action_required_resumes_or_fails() {
        assert!(JobStatus::ActionRequired.can_transition_to(JobStatus::InProgress));
        assert!(JobStatus::ActionRequired.can_transition_to(JobStatus::Failure));
        assert!(!JobStatus::ActionRequired.can_transition_to(JobStatus::Completed));
    }

    #[test]
    fn test_no_transition_out_of_completed() {
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::InProgress));
        assert!(JobStatus::Completed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::ActionRequired.is_terminal());
    }
}
