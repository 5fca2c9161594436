//! Capped badge counters for unread messages and thread replies.

use super::{HandlerContext, HandlerError, HandlerOutcome, COUNTER_CEILING};
use crate::event::{ReplyIncrement, UnreadIncrement};
use serde_json::json;
use tracing::debug;

/// Bump `unread` on every membership of the room still below the ceiling.
pub async fn handle_unread(
    ctx: &HandlerContext,
    event: &UnreadIncrement,
) -> Result<HandlerOutcome, HandlerError> {
    let bumped = ctx
        .repository
        .increment_unread(&event.room_id, COUNTER_CEILING)
        .await?;

    debug!(
        room_id = %event.room_id,
        message_id = %event.message_id,
        bumped,
        "Unread counters incremented"
    );

    Ok(HandlerOutcome::with_metadata(
        "unread-increment",
        format!("incremented {} memberships in room {}", bumped, event.room_id),
        json!({ "bumped": bumped }),
    ))
}

/// Bump `replies` on one membership unless it is capped or absent.
pub async fn handle_reply(
    ctx: &HandlerContext,
    event: &ReplyIncrement,
) -> Result<HandlerOutcome, HandlerError> {
    let bumped = ctx
        .repository
        .increment_replies(&event.room_id, &event.user_id, COUNTER_CEILING)
        .await?;

    debug!(
        room_id = %event.room_id,
        user_id = %event.user_id,
        bumped,
        "Reply counter checked"
    );

    let message = if bumped {
        format!("incremented replies for {} in {}", event.user_id, event.room_id)
    } else {
        format!("replies for {} in {} unchanged", event.user_id, event.room_id)
    };
    Ok(HandlerOutcome::success("reply-increment", message))
}
