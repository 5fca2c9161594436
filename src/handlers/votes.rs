//! vote-recount: recompute a poll's tally and tell the room.

use super::{HandlerContext, HandlerError, HandlerOutcome};
use crate::event::{ClientNotification, VoteRecount};
use crate::repository::VoteTally;
use serde_json::json;
use tracing::info;

pub async fn handle(ctx: &HandlerContext, event: &VoteRecount) -> Result<HandlerOutcome, HandlerError> {
    let message = ctx
        .repository
        .find_message(&event.message_id)
        .await?
        .ok_or_else(|| HandlerError::NotFound {
            kind: "message",
            id: event.message_id.clone(),
        })?;

    let tally = VoteTally::compute(&message);
    ctx.repository.save_vote_tally(&tally).await?;

    let members = ctx.repository.room_member_ids(&message.room_id).await?;
    let notification = ClientNotification::new("message.votes")
        .with_field("roomId", json!(message.room_id))
        .with_field("messageId", json!(tally.message_id))
        .with_field("votes", json!(tally.counts))
        .with_field("total", json!(tally.total));
    ctx.producer.fanout_to_users(&members, &notification).await?;

    info!(
        message_id = %tally.message_id,
        room_id = %message.room_id,
        total = tally.total,
        notified = members.len(),
        "Votes recounted"
    );

    Ok(HandlerOutcome::with_metadata(
        "vote-recount",
        format!("recounted {} votes on {}", tally.total, tally.message_id),
        json!({ "total": tally.total, "notified": members.len() }),
    ))
}
