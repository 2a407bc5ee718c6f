use futures::{FutureExt, StreamExt};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::{Message, Offset};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::error::InventoryError;
use crate::handlers::{EventRouter, HandlerOutcome};
use crate::metrics::ConsumerMetrics;

const UNROUTED: &str = "unrouted";

/// Lifecycle of one inbound message. The last four states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventState {
    Received,
    Validated,
    Dispatched,
    Succeeded,
    FailedBusiness,
    FailedException,
    RejectedInvalid,
}

impl EventState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventState::Succeeded
                | EventState::FailedBusiness
                | EventState::FailedException
                | EventState::RejectedInvalid
        )
    }
}

#[derive(Debug, Clone)]
pub struct ProcessedEvent {
    pub topic: String,
    pub state: EventState,
    pub duplicate: bool,
    /// Set when the handler hit a transient infrastructure error. The offset
    /// is not committed and the broker delivers the message again.
    pub redeliver: bool,
    pub reason: Option<String>,
    pub elapsed: Duration,
}

pub struct InventoryEventConsumer {
    router: EventRouter,
    metrics: Arc<ConsumerMetrics>,
    redelivery_backoff: Duration,
}

impl InventoryEventConsumer {
    pub fn new(router: EventRouter, metrics: Arc<ConsumerMetrics>) -> Self {
        Self {
            router,
            metrics,
            redelivery_backoff: Duration::from_secs(1),
        }
    }

    pub fn with_redelivery_backoff(mut self, backoff: Duration) -> Self {
        self.redelivery_backoff = backoff;
        self
    }

    pub fn topics(&self) -> Vec<&str> {
        self.router.topics()
    }

    pub fn metrics(&self) -> &Arc<ConsumerMetrics> {
        &self.metrics
    }

    pub async fn run(&self, consumer: StreamConsumer) {
        let mut message_stream = consumer.stream();

        while let Some(message) = message_stream.next().await {
            match message {
                Ok(m) => {
                    let processed = self.process(m.topic(), m.payload()).await;
                    debug!(
                        topic = %processed.topic,
                        partition = m.partition(),
                        offset = m.offset(),
                        state = ?processed.state,
                        "Message processed"
                    );
                    if processed.redeliver {
                        warn!(
                            topic = m.topic(),
                            partition = m.partition(),
                            offset = m.offset(),
                            "Rewinding partition for redelivery after transient failure"
                        );
                        if let Err(e) = consumer.seek(
                            m.topic(),
                            m.partition(),
                            Offset::Offset(m.offset()),
                            self.redelivery_backoff,
                        ) {
                            error!("Error rewinding partition: {}", e);
                        }
                        tokio::time::sleep(self.redelivery_backoff).await;
                        continue;
                    }
                    if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                        error!("Error committing message: {}", e);
                    }
                }
                Err(e) => error!("Error receiving message: {}", e),
            }
        }
        info!("Inventory event stream ended");
    }

    /// Handles one message to a terminal state. Never panics or returns an
    /// error; failures are logged and counted. Transient engine errors are
    /// flagged for redelivery.
    pub async fn process(&self, topic: &str, payload: Option<&[u8]>) -> ProcessedEvent {
        let started = Instant::now();
        let mut state = EventState::Received;
        let finish = |state: EventState, duplicate: bool, reason: Option<String>| ProcessedEvent {
            topic: topic.to_string(),
            state,
            duplicate,
            redeliver: false,
            reason,
            elapsed: started.elapsed(),
        };

        let Some(handler) = self.router.handler(topic) else {
            warn!("No handler registered for topic {}, dropping message", topic);
            self.metrics.record_invalid(UNROUTED);
            return finish(EventState::RejectedInvalid, false, Some(format!("unrouted topic {}", topic)));
        };
        let name = handler.name();

        let Some(payload) = payload else {
            warn!("Dropping {} message without payload", name);
            self.metrics.record_invalid(name);
            return finish(EventState::RejectedInvalid, false, Some("empty payload".to_string()));
        };

        let event = match handler.decode(payload) {
            Ok(event) => event,
            Err(reason) => {
                warn!("Dropping malformed {} event: {}", name, reason);
                self.metrics.record_invalid(name);
                return finish(EventState::RejectedInvalid, false, Some(reason));
            }
        };
        state = advance(state, EventState::Validated);

        state = advance(state, EventState::Dispatched);
        let outcome = AssertUnwindSafe(handler.dispatch(event)).catch_unwind().await;

        match outcome {
            Ok(Ok(HandlerOutcome::Applied)) => {
                self.metrics.record_success(name, started.elapsed());
                finish(advance(state, EventState::Succeeded), false, None)
            }
            Ok(Ok(HandlerOutcome::Duplicate)) => {
                info!("Duplicate {} event acknowledged without changes", name);
                self.metrics.record_success(name, started.elapsed());
                finish(advance(state, EventState::Succeeded), true, None)
            }
            Ok(Ok(HandlerOutcome::Rejected(reason))) => {
                warn!("{} rejected: {}", name, reason);
                self.metrics.record_failure(name, &reason);
                finish(advance(state, EventState::FailedBusiness), false, Some(reason))
            }
            Ok(Err(InventoryError::InvalidRequest(reason))) => {
                warn!("Dropping invalid {} event: {}", name, reason);
                self.metrics.record_invalid(name);
                finish(advance(state, EventState::RejectedInvalid), false, Some(reason))
            }
            Ok(Err(e)) => {
                error!(transient = e.is_transient(), "Error handling {} event: {}", name, e);
                self.metrics.record_exception(name);
                ProcessedEvent {
                    redeliver: e.is_transient(),
                    ..finish(advance(state, EventState::FailedException), false, Some(e.to_string()))
                }
            }
            Err(_) => {
                error!("Handler {} panicked", name);
                self.metrics.record_exception(name);
                finish(
                    advance(state, EventState::FailedException),
                    false,
                    Some("handler panicked".to_string()),
                )
            }
        }
    }
}

fn advance(from: EventState, to: EventState) -> EventState {
    debug!(?from, ?to, "Event state transition");
    to
}
