//! Consumer loop: read, dispatch, acknowledge.
//!
//! One [`Consumer`] drives one stream for one consumer group. Each iteration
//! blocks for a bounded time waiting for entries newer than the group cursor,
//! hands every entry to the [`Router`] in order, and acknowledges it
//! afterwards. Handler failures are logged, recorded in the dead-letter
//! stream, and acknowledged anyway so one bad entry never stalls the stream.
//!
//! Entries delivered to a consumer that never acknowledged them (a crash, or
//! a read cancelled by shutdown after the store delivered) stay pending. On
//! start and every `claim_interval` the consumer claims entries idle for at
//! least `claim_idle` and processes them like fresh ones.
//!
//! ```text
//! loop {
//!     every claim_interval: claim_pending(idle >= claim_idle) -> dispatch + ack
//!     read_group(stream, group, name, batch_size, block)   // '>' only
//!     for entry in batch:
//!         router.dispatch(entry)   // Err -> log + dead-letter
//!         ack(entry)
//! }
//! ```

use crate::dlq::DeadLetters;
use crate::router::Router;
use crate::shutdown::ShutdownSignal;
use crate::store::{StoreError, StreamEntry, StreamStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Entries requested per read, and the most a consumer will ever request.
pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const MAX_BATCH_SIZE: usize = 100;

/// How long a read blocks waiting for new entries.
pub const DEFAULT_BLOCK: Duration = Duration::from_secs(5);

/// Pause after a failed read before trying again.
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Minimum time an entry must sit unacknowledged before another consumer
/// takes it over.
pub const DEFAULT_CLAIM_IDLE: Duration = Duration::from_secs(30);

/// How often a running consumer looks for abandoned entries.
pub const DEFAULT_CLAIM_INTERVAL: Duration = Duration::from_secs(30);

/// Counts for one or more read/dispatch/ack cycles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Entries returned by the read
    pub read: usize,
    /// Entries whose handler succeeded
    pub handled: usize,
    /// Entries whose handler (or decoding) failed
    pub failed: usize,
    /// Entries acknowledged
    pub acked: usize,
}

impl BatchReport {
    fn absorb(&mut self, other: BatchReport) {
        self.read += other.read;
        self.handled += other.handled;
        self.failed += other.failed;
        self.acked += other.acked;
    }
}

pub struct Consumer {
    store: Arc<dyn StreamStore>,
    router: Router,
    dead_letters: DeadLetters,
    stream: String,
    group: String,
    name: String,
    batch_size: usize,
    block: Duration,
    error_backoff: Duration,
    claim_idle: Duration,
    claim_interval: Duration,
}

impl Consumer {
    pub fn new(
        store: Arc<dyn StreamStore>,
        router: Router,
        stream: impl Into<String>,
        group: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            dead_letters: DeadLetters::new(store.clone()),
            store,
            router,
            stream: stream.into(),
            group: group.into(),
            name: name.into(),
            batch_size: DEFAULT_BATCH_SIZE,
            block: DEFAULT_BLOCK,
            error_backoff: DEFAULT_ERROR_BACKOFF,
            claim_idle: DEFAULT_CLAIM_IDLE,
            claim_interval: DEFAULT_CLAIM_INTERVAL,
        }
    }

    /// Entries per read, clamped to `1..=MAX_BATCH_SIZE`.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = block;
        self
    }

    pub fn with_error_backoff(mut self, error_backoff: Duration) -> Self {
        self.error_backoff = error_backoff;
        self
    }

    pub fn with_claim_idle(mut self, claim_idle: Duration) -> Self {
        self.claim_idle = claim_idle;
        self
    }

    pub fn with_claim_interval(mut self, claim_interval: Duration) -> Self {
        self.claim_interval = claim_interval;
        self
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Run exactly one read/dispatch/ack cycle.
    pub async fn poll_once(&self) -> Result<BatchReport, StoreError> {
        let entries = self.read_batch().await?;
        Ok(self.process_batch(&entries).await)
    }

    /// Claim entries left pending by any consumer for at least `claim_idle`
    /// and run them through dispatch and ack.
    pub async fn recover_pending(&self) -> Result<BatchReport, StoreError> {
        let mut totals = BatchReport::default();

        loop {
            let claimed = self
                .store
                .claim_pending(
                    &self.stream,
                    &self.group,
                    &self.name,
                    self.claim_idle,
                    self.batch_size,
                )
                .await?;
            if claimed.is_empty() {
                break;
            }

            let report = self.process_batch(&claimed).await;
            totals.absorb(report);
            // Stop on a short page, or when nothing could be acked and the
            // same entries would come straight back.
            if claimed.len() < self.batch_size || report.acked == 0 {
                break;
            }
        }

        if totals.read > 0 {
            info!(
                stream = %self.stream,
                consumer = %self.name,
                claimed = totals.read,
                handled = totals.handled,
                failed = totals.failed,
                "Recovered pending entries"
            );
        }
        Ok(totals)
    }

    /// Consume until `shutdown` is triggered, returning the totals.
    ///
    /// Shutdown interrupts a blocked read or an error pause; a batch that
    /// has been read is always finished first.
    pub async fn run(&self, shutdown: ShutdownSignal) -> BatchReport {
        info!(
            stream = %self.stream,
            group = %self.group,
            consumer = %self.name,
            batch_size = self.batch_size,
            "Listening for entries"
        );

        let mut totals = BatchReport::default();
        let mut next_claim = Instant::now();

        while !shutdown.is_shutdown() {
            if Instant::now() >= next_claim {
                match self.recover_pending().await {
                    Ok(report) => totals.absorb(report),
                    Err(e) => warn!(
                        stream = %self.stream,
                        group = %self.group,
                        error = %e,
                        "Pending entry recovery failed"
                    ),
                }
                next_claim = Instant::now() + self.claim_interval;
            }

            let read = tokio::select! {
                _ = shutdown.recv() => break,
                read = self.read_batch() => read,
            };

            match read {
                Ok(entries) => {
                    if entries.is_empty() {
                        continue;
                    }
                    let report = self.process_batch(&entries).await;
                    debug!(
                        stream = %self.stream,
                        read = report.read,
                        handled = report.handled,
                        failed = report.failed,
                        "Batch processed"
                    );
                    totals.absorb(report);
                }
                Err(e) => {
                    warn!(
                        stream = %self.stream,
                        group = %self.group,
                        error = %e,
                        backoff_ms = self.error_backoff.as_millis() as u64,
                        "Stream read error"
                    );
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        _ = tokio::time::sleep(self.error_backoff) => {}
                    }
                }
            }
        }

        info!(
            stream = %self.stream,
            consumer = %self.name,
            handled = totals.handled,
            failed = totals.failed,
            "Consumer stopped"
        );

        totals
    }

    async fn read_batch(&self) -> Result<Vec<StreamEntry>, StoreError> {
        self.store
            .read_group(
                &self.stream,
                &self.group,
                &self.name,
                self.batch_size,
                self.block,
            )
            .await
    }

    async fn process_batch(&self, entries: &[StreamEntry]) -> BatchReport {
        let mut report = BatchReport {
            read: entries.len(),
            ..BatchReport::default()
        };

        for entry in entries {
            self.process(entry, &mut report).await;
        }

        report
    }

    async fn process(&self, entry: &StreamEntry, report: &mut BatchReport) {
        match self.router.dispatch(entry).await {
            Ok(outcome) => {
                report.handled += 1;
                debug!(
                    id = %entry.id,
                    handler = outcome.handler,
                    message = %outcome.message,
                    "Entry handled"
                );
            }
            Err(e) => {
                report.failed += 1;
                error!(
                    id = %entry.id,
                    stream = %self.stream,
                    fields = ?entry.fields,
                    error = %e,
                    "Handler failed"
                );

                if let Err(dlq_error) = self
                    .dead_letters
                    .record(&self.stream, entry, &e.to_string())
                    .await
                {
                    error!(
                        id = %entry.id,
                        error = %dlq_error,
                        "Failed to dead-letter entry"
                    );
                }
            }
        }

        match self.store.ack(&self.stream, &self.group, &entry.id).await {
            Ok(true) => report.acked += 1,
            Ok(false) => debug!(id = %entry.id, "Entry was not pending"),
            Err(e) => error!(id = %entry.id, error = %e, "Failed to ACK entry"),
        }
    }
}
