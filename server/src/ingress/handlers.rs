//! Topic handlers: decode each upstream event and issue the corresponding
//! dispatch calls.
//!
//! Submission events go to their owner (all devices) and, when the
//! submission belongs to a contest, to that contest's room. Leaderboard and
//! contest events go to the contest room; contest starts additionally go to
//! every connected client.

use serde_json::json;

use crate::cluster::Fanout;
use crate::events::{
    ContestEndedEvent, ContestStartedEvent, LeaderboardUpdatedEvent, SubmissionCreatedEvent,
    SubmissionJudgedEvent,
};
use crate::hub::room::{build_room_id, RoomType};
use crate::protocol::{Envelope, MessageType};

use super::{
    IngressError, TOPIC_CONTEST_ENDED, TOPIC_CONTEST_STARTED, TOPIC_LEADERBOARD_UPDATED,
    TOPIC_SUBMISSION_CREATED, TOPIC_SUBMISSION_JUDGED,
};

/// Route one event payload by topic.
pub async fn dispatch(topic: &str, payload: &[u8], fanout: &Fanout) -> Result<(), IngressError> {
    match topic {
        TOPIC_SUBMISSION_CREATED => handle_submission_created(payload, fanout).await,
        TOPIC_SUBMISSION_JUDGED => handle_submission_judged(payload, fanout).await,
        TOPIC_LEADERBOARD_UPDATED => handle_leaderboard_updated(payload, fanout).await,
        TOPIC_CONTEST_STARTED => handle_contest_started(payload, fanout).await,
        TOPIC_CONTEST_ENDED => handle_contest_ended(payload, fanout).await,
        other => Err(IngressError::UnknownTopic(other.to_string())),
    }
}

async fn handle_submission_created(payload: &[u8], fanout: &Fanout) -> Result<(), IngressError> {
    let event: SubmissionCreatedEvent = serde_json::from_slice(payload)?;

    tracing::info!(
        submission_id = %event.submission_id,
        user_id = %event.user_id,
        status = %event.status,
        "processing submission.created"
    );

    let envelope = Envelope::new(MessageType::SubmissionCreated, &event)?;
    fanout.send_to_user(&event.user_id, &envelope).await;

    if let Some(contest_id) = contest_of(event.contest_id.as_deref()) {
        let room_id = build_room_id(RoomType::Contest, contest_id);
        fanout.send_to_room(&room_id, &envelope).await;
    }

    Ok(())
}

async fn handle_submission_judged(payload: &[u8], fanout: &Fanout) -> Result<(), IngressError> {
    let event: SubmissionJudgedEvent = serde_json::from_slice(payload)?;

    tracing::info!(
        submission_id = %event.submission_id,
        user_id = %event.user_id,
        verdict = %event.verdict,
        "processing submission.judged"
    );

    let envelope = Envelope::new(MessageType::SubmissionResult, &event)?;
    fanout.send_to_user(&event.user_id, &envelope).await;

    if let Some(contest_id) = contest_of(event.contest_id.as_deref()) {
        let room_id = build_room_id(RoomType::Contest, contest_id);
        fanout.send_to_room(&room_id, &envelope).await;
    }

    Ok(())
}

async fn handle_leaderboard_updated(payload: &[u8], fanout: &Fanout) -> Result<(), IngressError> {
    let event: LeaderboardUpdatedEvent = serde_json::from_slice(payload)?;

    tracing::info!(contest_id = %event.contest_id, "processing leaderboard.updated");

    let envelope = Envelope::new(MessageType::LeaderboardUpdate, &event)?;
    let room_id = build_room_id(RoomType::Contest, &event.contest_id);
    fanout.send_to_room(&room_id, &envelope).await;

    Ok(())
}

async fn handle_contest_started(payload: &[u8], fanout: &Fanout) -> Result<(), IngressError> {
    let event: ContestStartedEvent = serde_json::from_slice(payload)?;

    tracing::info!(
        contest_id = %event.contest_id,
        title = %event.title,
        "processing contest.started"
    );

    let envelope = Envelope::new(
        MessageType::ContestEvent,
        json!({
            "type": "STARTED",
            "contestId": event.contest_id,
            "title": event.title,
            "startTime": event.start_time,
            "timestamp": event.timestamp,
        }),
    )?;

    let room_id = build_room_id(RoomType::Contest, &event.contest_id);
    fanout.send_to_room(&room_id, &envelope).await;
    fanout.broadcast(&envelope).await;

    Ok(())
}

async fn handle_contest_ended(payload: &[u8], fanout: &Fanout) -> Result<(), IngressError> {
    let event: ContestEndedEvent = serde_json::from_slice(payload)?;

    tracing::info!(
        contest_id = %event.contest_id,
        title = %event.title,
        "processing contest.ended"
    );

    let envelope = Envelope::new(
        MessageType::ContestEvent,
        json!({
            "type": "ENDED",
            "contestId": event.contest_id,
            "title": event.title,
            "endTime": event.end_time,
            "timestamp": event.timestamp,
        }),
    )?;

    let room_id = build_room_id(RoomType::Contest, &event.contest_id);
    fanout.send_to_room(&room_id, &envelope).await;

    Ok(())
}

fn contest_of(contest_id: Option<&str>) -> Option<&str> {
    contest_id.filter(|id| !id.is_empty())
}
