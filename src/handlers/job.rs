//! Background jobs, dispatched on their `type`.

use super::{HandlerContext, HandlerError, HandlerOutcome};
use crate::event::{Event, Job, JobType, SearchSync};
use serde_json::json;
use tracing::info;

/// Room ids fetched per page during a resync.
pub const RESYNC_PAGE_SIZE: usize = 100;

pub async fn handle(ctx: &HandlerContext, job: &Job) -> Result<HandlerOutcome, HandlerError> {
    match job.job_type {
        JobType::SearchResync => search_resync(ctx).await,
    }
}

/// Page through every room and publish one search update per page.
async fn search_resync(ctx: &HandlerContext) -> Result<HandlerOutcome, HandlerError> {
    let mut after: Option<String> = None;
    let mut pages = 0;
    let mut rooms = 0;

    loop {
        let page = ctx
            .repository
            .room_ids_after(after.as_deref(), RESYNC_PAGE_SIZE)
            .await?;
        if page.is_empty() {
            break;
        }

        let full = page.len() == RESYNC_PAGE_SIZE;
        after = page.last().cloned();
        rooms += page.len();
        pages += 1;

        ctx.producer
            .publish(&Event::SearchSync(SearchSync::update(page)))
            .await?;

        if !full {
            break;
        }
    }

    info!(pages, rooms, "Search resync scheduled");

    Ok(HandlerOutcome::with_metadata(
        "job",
        format!("scheduled {} search updates", pages),
        json!({ "pages": pages, "rooms": rooms }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{SearchSyncMode, SEARCH_STREAM};
    use crate::handlers::testing::fixture;
    use crate::repository::Room;
    use crate::store::{StartPosition, StreamStore};
    use std::time::Duration;

    fn resync() -> Job {
        Job {
            job_type: JobType::SearchResync,
        }
    }

    #[tokio::test]
    async fn test_resync_publishes_one_update_per_page() {
        let f = fixture();
        for i in 0..230 {
            f.repo
                .insert_room(Room {
                    id: format!("r{:04}", i),
                    name: format!("room {}", i),
                    topic: None,
                })
                .await;
        }

        handle(&f.ctx, &resync()).await.unwrap();

        f.store
            .create_group(SEARCH_STREAM, "g", StartPosition::Beginning, false)
            .await
            .unwrap();
        let entries = f
            .store
            .read_group(SEARCH_STREAM, "g", "c", 10, Duration::ZERO)
            .await
            .unwrap();

        let sizes: Vec<usize> = entries
            .iter()
            .map(|entry| match Event::from_entry(entry).unwrap() {
                Event::SearchSync(sync) => {
                    assert_eq!(sync.mode, SearchSyncMode::Update);
                    sync.room_ids.unwrap().len()
                }
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(sizes, vec![100, 100, 30]);
    }

    #[tokio::test]
    async fn test_resync_with_no_rooms_publishes_nothing() {
        let f = fixture();
        let outcome = handle(&f.ctx, &resync()).await.unwrap();
        assert_eq!(outcome.metadata.unwrap()["pages"], 0);
        assert_eq!(f.store.stream_len(SEARCH_STREAM).await.unwrap(), 0);
    }
}
