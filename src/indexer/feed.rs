//! Restartable cursor over ledger commit events

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::domain::{ChainPosition, CommitEvent};
use crate::infra::{Ledger, LedgerError, RetryConfig};

/// Lazy, infinite sequence of confirmed commit events in ledger order.
///
/// The scan cursor follows each page's high-water mark, so ranges without
/// events are not rescanned. Restart by opening a new feed at the last
/// processed position.
pub struct CommitFeed {
    ledger: Arc<dyn Ledger>,
    cursor: Option<ChainPosition>,
    page_size: usize,
    poll_interval: Duration,
    backoff: RetryConfig,
    buffer: VecDeque<CommitEvent>,
    failures: u32,
}

impl CommitFeed {
    /// Feed yielding events strictly after `after` (`None`: from genesis)
    pub fn new(ledger: Arc<dyn Ledger>, after: Option<ChainPosition>, page_size: usize) -> Self {
        Self {
            ledger,
            cursor: after,
            page_size: page_size.max(1),
            poll_interval: Duration::from_secs(2),
            backoff: RetryConfig::blockchain(),
            buffer: VecDeque::new(),
            failures: 0,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: RetryConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Position up to which the ledger has been scanned
    pub fn cursor(&self) -> Option<ChainPosition> {
        self.cursor
    }

    /// Next buffered or fetchable event; `None` when caught up.
    ///
    /// Cancel-safe: the cursor and buffer are updated together after the
    /// fetch completes.
    pub async fn try_next(&mut self) -> Result<Option<CommitEvent>, LedgerError> {
        if let Some(event) = self.buffer.pop_front() {
            return Ok(Some(event));
        }

        let page = self
            .ledger
            .fetch_commits(self.cursor, self.page_size)
            .await?;

        let after = self.cursor;
        let last = page.events.last().map(|e| e.position);
        self.cursor = self.cursor.max(page.high_water).max(last);
        self.buffer.extend(
            page.events
                .into_iter()
                .filter(|e| after.map_or(true, |a| e.position > a)),
        );

        if !self.buffer.is_empty() {
            debug!(
                events = self.buffer.len(),
                cursor = ?self.cursor,
                "fetched commit page"
            );
        }
        Ok(self.buffer.pop_front())
    }

    /// Next event, waiting for new commits and retrying transient failures
    /// without limit
    pub async fn next(&mut self) -> Result<CommitEvent, LedgerError> {
        loop {
            match self.try_next().await {
                Ok(Some(event)) => {
                    self.failures = 0;
                    return Ok(event);
                }
                Ok(None) => {
                    self.failures = 0;
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) if e.is_transient() => {
                    let delay = self.backoff.delay_for_attempt(self.failures);
                    self.failures = self.failures.saturating_add(1);
                    warn!(
                        error = %e,
                        failures = self.failures,
                        delay_ms = delay.as_millis() as u64,
                        "commit feed error, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
