//! remove-user: archive an account and delete it with its memberships.
//!
//! Steps, each safe to repeat:
//!
//! 1. upsert the `RemovedUser` archive keyed by the original id, merging the
//!    rooms of any earlier partial run
//! 2. delete the memberships, then the user
//! 3. notify the remaining members of the user's rooms (`user.removed`)
//!
//! When the user is already gone only leftover memberships are cleaned up.

use super::{HandlerContext, HandlerError, HandlerOutcome};
use crate::event::{ClientNotification, RemoveUser};
use crate::repository::RemovedUser;
use serde_json::json;
use std::collections::BTreeSet;
use tracing::{debug, info};

const NAME: &str = "remove-user";

pub async fn handle(ctx: &HandlerContext, event: &RemoveUser) -> Result<HandlerOutcome, HandlerError> {
    let repo = &ctx.repository;

    let Some(user) = repo.find_user(&event.user_id).await? else {
        let leftover = repo.delete_memberships(&event.user_id).await?;
        debug!(user_id = %event.user_id, leftover, "User already removed");
        return Ok(HandlerOutcome::success(
            NAME,
            format!("user {} already removed", event.user_id),
        ));
    };

    let mut rooms: BTreeSet<String> = repo.user_room_ids(&user.id).await?.into_iter().collect();
    let previous = repo.find_removed_user(&user.id).await?;
    let removed_at = match &previous {
        Some(previous) => {
            rooms.extend(previous.rooms.iter().cloned());
            previous.removed_at
        }
        None => chrono::Utc::now(),
    };

    let archive = RemovedUser {
        id: user.id.clone(),
        username: user.username.clone(),
        name: user.name.clone(),
        rooms: rooms.iter().cloned().collect(),
        removed_at,
    };
    repo.upsert_removed_user(&archive).await?;

    let memberships = repo.delete_memberships(&user.id).await?;
    repo.delete_user(&user.id).await?;

    let mut recipients = BTreeSet::new();
    for room_id in &rooms {
        recipients.extend(repo.room_member_ids(room_id).await?);
    }
    recipients.remove(&user.id);
    let recipients: Vec<String> = recipients.into_iter().collect();

    let notification = ClientNotification::new("user.removed")
        .with_field("userId", json!(user.id))
        .with_field("username", json!(user.username));
    ctx.producer
        .fanout_to_users(&recipients, &notification)
        .await?;

    info!(
        user_id = %user.id,
        rooms = rooms.len(),
        memberships,
        notified = recipients.len(),
        "User removed"
    );

    Ok(HandlerOutcome::with_metadata(
        NAME,
        format!("removed user {}", user.id),
        json!({
            "rooms": archive.rooms,
            "memberships": memberships,
            "notified": recipients.len(),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::NOTIFICATION_STREAM;
    use crate::handlers::testing::fixture;
    use crate::repository::{ChatRepository, User};
    use crate::store::StreamStore;

    fn remove(user_id: &str) -> RemoveUser {
        RemoveUser {
            user_id: user_id.to_string(),
        }
    }

    async fn seed(f: &crate::handlers::testing::Fixture) {
        f.repo
            .insert_user(User {
                id: "gone".to_string(),
                username: "gone.user".to_string(),
                name: Some("Gone".to_string()),
            })
            .await;
        f.repo.add_membership("r1", "gone").await;
        f.repo.add_membership("r2", "gone").await;
        f.repo.add_membership("r1", "peer").await;
        f.repo.add_membership("r2", "peer").await;
        f.repo.add_membership("r2", "other").await;
    }

    #[tokio::test]
    async fn test_removes_user_and_archives() {
        let f = fixture();
        seed(&f).await;

        handle(&f.ctx, &remove("gone")).await.unwrap();

        assert!(f.repo.find_user("gone").await.unwrap().is_none());
        assert_eq!(f.repo.membership_count("gone").await, 0);

        let archive = f.repo.find_removed_user("gone").await.unwrap().unwrap();
        assert_eq!(archive.username, "gone.user");
        assert_eq!(archive.rooms, vec!["r1", "r2"]);

        // peer and other are notified once each
        assert_eq!(f.store.stream_len(NOTIFICATION_STREAM).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_processing_twice_is_idempotent() {
        let f = fixture();
        seed(&f).await;

        handle(&f.ctx, &remove("gone")).await.unwrap();
        let first = f.repo.find_removed_user("gone").await.unwrap().unwrap();

        let outcome = handle(&f.ctx, &remove("gone")).await.unwrap();
        assert!(outcome.message.contains("already removed"));

        assert_eq!(f.repo.removed_count().await, 1);
        assert_eq!(f.repo.find_removed_user("gone").await.unwrap().unwrap(), first);
        assert!(f.repo.find_user("gone").await.unwrap().is_none());
        assert_eq!(f.repo.membership_count("gone").await, 0);
    }

    #[tokio::test]
    async fn test_rerun_after_partial_run_keeps_archived_rooms() {
        let f = fixture();
        seed(&f).await;

        handle(&f.ctx, &remove("gone")).await.unwrap();
        // Crash between membership and user deletion: user is back, rooms are gone

        f.repo
            .insert_user(User {
                id: "gone".to_string(),
                username: "gone.user".to_string(),
                name: None,
            })
            .await;

        handle(&f.ctx, &remove("gone")).await.unwrap();
        let archive = f.repo.find_removed_user("gone").await.unwrap().unwrap();
        assert_eq!(archive.rooms, vec!["r1", "r2"]);
        assert_eq!(f.repo.removed_count().await, 1);
    }
}
