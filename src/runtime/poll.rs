use super::RuntimeError;
use crate::orchestration::{DispatchOutcome, InboundDispatcher};
use crate::shared::logging::RuntimeLog;
use crate::shared::time::now_millis;
use crate::store::{StateStore, KEY_LAST_POLL_AT};
use crate::transport::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Re-fetch window behind the watermark. Repeats are absorbed by the
/// processed-event set; late-indexed messages are not.
pub const FETCH_OVERLAP_MS: i64 = 5_000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub fetched: usize,
    pub dispatched: usize,
    pub duplicates: usize,
    pub failed: usize,
}

/// One transport fetch followed by dispatch of every returned event.
pub struct PollLoop {
    store: StateStore,
    transport: Arc<dyn Transport>,
    dispatcher: Arc<InboundDispatcher>,
    log: RuntimeLog,
    in_flight: AtomicBool,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl PollLoop {
    pub fn new(
        store: StateStore,
        transport: Arc<dyn Transport>,
        dispatcher: Arc<InboundDispatcher>,
        log: RuntimeLog,
    ) -> Self {
        Self {
            store,
            transport,
            dispatcher,
            log,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Returns `None` when another poll is still running.
    ///
    /// On first start there is no watermark; it is set to now so history
    /// that predates the daemon is never replayed.
    pub fn poll_once(&self) -> Result<Option<PollReport>, RuntimeError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            self.log.info("poll.skipped", "previous poll still in flight");
            return Ok(None);
        }
        let _in_flight = InFlight(&self.in_flight);

        let watermark = self
            .store
            .get_value(KEY_LAST_POLL_AT)?
            .and_then(|raw| raw.trim().parse::<i64>().ok());
        let Some(watermark) = watermark else {
            let now = now_millis();
            self.store.set_value(KEY_LAST_POLL_AT, &now.to_string())?;
            self.log
                .info("poll.watermark.initialized", &format!("last_poll_at={now}"));
            return Ok(Some(PollReport::default()));
        };

        let events = self
            .transport
            .fetch_inbound(watermark.saturating_sub(FETCH_OVERLAP_MS))?;
        let mut report = PollReport {
            fetched: events.len(),
            ..PollReport::default()
        };
        for event in &events {
            match self.dispatcher.handle_event(event) {
                Ok(DispatchOutcome::Duplicate) => report.duplicates += 1,
                Ok(_) => report.dispatched += 1,
                Err(err) => {
                    report.failed += 1;
                    self.log.error(
                        "poll.dispatch.failed",
                        &format!("event_id={} error={err}", event.id),
                    );
                }
            }
        }

        let newest = events
            .iter()
            .map(|event| event.received_at)
            .fold(watermark, i64::max);
        if newest > watermark {
            self.store.set_value(KEY_LAST_POLL_AT, &newest.to_string())?;
        }
        if report.dispatched > 0 || report.failed > 0 {
            self.log.info(
                "poll.completed",
                &format!(
                    "fetched={} dispatched={} duplicates={} failed={}",
                    report.fetched, report.dispatched, report.duplicates, report.failed
                ),
            );
        }
        Ok(Some(report))
    }
}
