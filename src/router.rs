//! Event Router.
//!
//! The [`Router`] decodes a stream entry into an [`Event`] and hands it to the
//! one handler for its kind. Dispatch is an exhaustive `match`, so adding an
//! event kind without a handler does not compile.
//!
//! # Architecture
//!
//! ```text
//! StreamEntry (fields: ["vote-recount", "{\"messageId\":\"m1\"}"])
//!     │
//!     ▼  Event::from_entry
//! Event::VoteRecount { message_id: "m1" }
//!     │
//!     ▼  match
//! handlers::votes::handle(ctx, ..)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use chatstream::router::Router;
//!
//! let router = Router::new(ctx);
//! let outcome = router.dispatch(&entry).await?;
//! println!("{}: {}", outcome.handler, outcome.message);
//! ```

use crate::event::Event;
use crate::handlers::{
    counters, fanout, job, remove_user, search_sync, votes, HandlerContext, HandlerError,
    HandlerOutcome,
};
use crate::store::StreamEntry;
use tracing::debug;

/// Routes entries to their handlers.
///
/// Cheap to clone; every consumer loop holds its own copy.
#[derive(Clone)]
pub struct Router {
    ctx: HandlerContext,
}

impl Router {
    pub fn new(ctx: HandlerContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &HandlerContext {
        &self.ctx
    }

    /// Decode `entry` and run its handler.
    pub async fn dispatch(&self, entry: &StreamEntry) -> Result<HandlerOutcome, HandlerError> {
        let event = Event::from_entry(entry)?;

        debug!(id = %entry.id, kind = %event.kind(), "Dispatching entry");

        let raw = entry.payload().unwrap_or_default();
        self.dispatch_event(&event, raw.as_bytes()).await
    }

    /// Run the handler for an already decoded event.
    ///
    /// `raw` is the payload as stored; only the fanout handler uses it.
    pub async fn dispatch_event(
        &self,
        event: &Event,
        raw: &[u8],
    ) -> Result<HandlerOutcome, HandlerError> {
        let ctx = &self.ctx;
        match event {
            Event::RemoveUser(e) => remove_user::handle(ctx, e).await,
            Event::UnreadIncrement(e) => counters::handle_unread(ctx, e).await,
            Event::ReplyIncrement(e) => counters::handle_reply(ctx, e).await,
            Event::VoteRecount(e) => votes::handle(ctx, e).await,
            Event::SearchSync(e) => search_sync::handle(ctx, e).await,
            Event::Job(e) => job::handle(ctx, e).await,
            Event::Message(e) => fanout::handle(ctx, e, raw).await,
        }
    }
}
