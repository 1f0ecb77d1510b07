//! Upstream event payloads consumed from the platform event bus.
//!
//! Field names follow the bus's camelCase JSON; optional fields are absent
//! for submissions made outside a contest or assignment.

use serde::{Deserialize, Serialize};

/// `submission.created` — a submission entered the judging pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionCreatedEvent {
    pub submission_id: String,
    pub user_id: String,
    pub problem_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contest_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment_id: Option<String>,
    pub language: String,
    pub status: String,
    pub timestamp: String,
}

/// `submission.judged` — the judge produced a verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionJudgedEvent {
    pub submission_id: String,
    pub user_id: String,
    pub problem_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contest_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignment_id: Option<String>,
    pub verdict: String,
    pub score: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used_kb: Option<i64>,
    pub test_cases_passed: i64,
    pub test_cases_total: i64,
    pub timestamp: String,
}

/// `leaderboard.updated` — a contest leaderboard was recomputed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardUpdatedEvent {
    pub contest_id: String,
    pub timestamp: String,
}

/// `contest.started`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContestStartedEvent {
    pub contest_id: String,
    pub title: String,
    pub start_time: String,
    pub timestamp: String,
}

/// `contest.ended`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContestEndedEvent {
    pub contest_id: String,
    pub title: String,
    pub end_time: String,
    pub timestamp: String,
}
