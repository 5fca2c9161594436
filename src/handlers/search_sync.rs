//! search-sync: bootstrap the search index or reindex a set of rooms.

use super::{HandlerContext, HandlerError, HandlerOutcome, SEARCH_BATCH_SIZE};
use crate::event::{SearchSync, SearchSyncMode};
use crate::lock::ExclusiveError;
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, info};

const NAME: &str = "search-sync";

/// Lock key guarding index bootstrap across processes.
pub const SEARCH_INIT_LOCK: &str = "search:init";

/// Bootstrap may create indices and aliases, so hold the lock for a while.
pub const SEARCH_INIT_TTL: Duration = Duration::from_secs(10 * 60);

pub async fn handle(ctx: &HandlerContext, event: &SearchSync) -> Result<HandlerOutcome, HandlerError> {
    match event.mode {
        SearchSyncMode::Init => bootstrap(ctx).await,
        SearchSyncMode::Update => {
            let room_ids = event.room_ids.as_deref().unwrap_or_default();
            reindex(ctx, room_ids).await
        }
    }
}

async fn bootstrap(ctx: &HandlerContext) -> Result<HandlerOutcome, HandlerError> {
    let search = ctx.search.clone();
    let result = ctx
        .locks
        .run_exclusive(SEARCH_INIT_LOCK, SEARCH_INIT_TTL, || async move {
            search.bootstrap().await
        })
        .await;

    match result {
        Ok(Some(())) => {
            info!("Search index bootstrapped");
            Ok(HandlerOutcome::success(NAME, "search index bootstrapped"))
        }
        Ok(None) => {
            debug!(lock = SEARCH_INIT_LOCK, "Bootstrap already running elsewhere, skipping");
            Ok(HandlerOutcome::success(NAME, "bootstrap held elsewhere"))
        }
        Err(ExclusiveError::Lock(e)) => Err(HandlerError::Lock(e)),
        Err(ExclusiveError::Task(e)) => Err(HandlerError::Search(e)),
    }
}

async fn reindex(ctx: &HandlerContext, room_ids: &[String]) -> Result<HandlerOutcome, HandlerError> {
    if room_ids.is_empty() {
        return Ok(HandlerOutcome::success(NAME, "nothing to reindex"));
    }

    let mut indexed = 0;
    let mut removed = 0;
    let mut batches = 0;

    for chunk in room_ids.chunks(SEARCH_BATCH_SIZE) {
        let rooms = ctx.repository.find_rooms(chunk).await?;
        let found: HashSet<&str> = rooms.iter().map(|room| room.id.as_str()).collect();
        let missing: Vec<String> = chunk
            .iter()
            .filter(|id| !found.contains(id.as_str()))
            .cloned()
            .collect();

        ctx.search.index_rooms(&rooms).await?;
        ctx.search.remove_rooms(&missing).await?;

        indexed += rooms.len();
        removed += missing.len();
        batches += 1;
    }

    info!(requested = room_ids.len(), indexed, removed, batches, "Rooms reindexed");

    Ok(HandlerOutcome::with_metadata(
        NAME,
        format!("reindexed {} rooms", indexed),
        json!({ "indexed": indexed, "removed": removed, "batches": batches }),
    ))
}
