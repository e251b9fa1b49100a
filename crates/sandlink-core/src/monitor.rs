//! Operation monitor: turns an event stream into a terminal result.
//!
//! # State machine
//!
//! ```text
//!  Connecting ──connected──▶ Listening ──progress──▶ Listening
//!       │                        │
//!       │                        ├──result / error / any event with `success`──▶ Terminal
//!       │                        ├──EOF──▶ StreamEndedWithoutCompletion
//!       └──────── deadline / cancel ──────▶ Timeout / Cancelled
//! ```
//!
//! There is no automatic reconnection. A stream that drops before its
//! terminal event is a failure; the caller has to re-issue the original call,
//! which yields a new correlation id.
//!
//! Waits for the same correlation id are serialized on a per-id slot. The
//! first waiter reads the stream and caches the outcome; later waiters get
//! the cached outcome without opening another subscription.

use crate::api::ControlPlane;
use crate::error::OperationError;
use crate::events::{EventKind, OperationEvent, Step};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

type Outcome = Result<(), OperationError>;

/// Per-correlation-id slot. `None` until a waiter records an outcome.
type Slot = Arc<Mutex<Option<Outcome>>>;

/// Reduces operation event streams to terminal results.
pub struct OperationMonitor {
    api: Arc<dyn ControlPlane>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl OperationMonitor {
    /// Create a monitor reading streams from `api`.
    pub fn new(api: Arc<dyn ControlPlane>) -> Self {
        Self {
            api,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until the operation reaches a terminal state.
    pub async fn wait(
        &self,
        correlation_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Outcome {
        self.wait_with_callback(correlation_id, timeout, cancel, |_| {})
            .await
    }

    /// Wait until the operation reaches a terminal state, reporting every
    /// event to `on_event` in arrival order.
    ///
    /// `on_event` is only called by the waiter that actually reads the
    /// stream; waiters served from the cache see no events.
    pub async fn wait_with_callback<F>(
        &self,
        correlation_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> Outcome
    where
        F: FnMut(&OperationEvent) + Send,
    {
        let deadline = Instant::now() + timeout;
        let slot = self.slot(correlation_id).await;

        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(OperationError::Cancelled),
            _ = sleep_until(deadline) => {
                Err(OperationError::Timeout { after: timeout, last_message: None })
            }
            guard = slot.lock() => Ok(guard),
        };
        let mut cached = match acquired {
            Ok(guard) => guard,
            Err(e) => {
                self.release_if_unused(correlation_id, &slot).await;
                return Err(e);
            }
        };

        if let Some(outcome) = cached.as_ref() {
            tracing::debug!(correlation_id = %correlation_id, ok = outcome.is_ok(), "Returning cached operation outcome");
            return outcome.clone();
        }

        let outcome = self
            .read_stream(correlation_id, timeout, deadline, cancel, &mut on_event)
            .await;

        // A cancelled wait says nothing about the operation itself.
        if outcome == Err(OperationError::Cancelled) {
            drop(cached);
            self.release_if_unused(correlation_id, &slot).await;
        } else {
            *cached = Some(outcome.clone());
        }
        outcome
    }

    /// Cached outcome for `correlation_id`, if a wait already finished.
    pub async fn cached(&self, correlation_id: &str) -> Option<Outcome> {
        let slot = self.slots.lock().await.get(correlation_id).cloned()?;
        let guard = slot.lock().await;
        guard.clone()
    }

    /// Drop the slot for `correlation_id`.
    pub async fn forget(&self, correlation_id: &str) {
        self.slots.lock().await.remove(correlation_id);
    }

    /// Number of correlation ids with a slot (cached or in flight).
    pub async fn tracked(&self) -> usize {
        self.slots.lock().await.len()
    }

    /// Drop `slot` if it holds no outcome and no other waiter shares it.
    async fn release_if_unused(&self, correlation_id: &str, slot: &Slot) {
        let mut slots = self.slots.lock().await;
        let unused = slots
            .get(correlation_id)
            .is_some_and(|s| Arc::ptr_eq(s, slot) && Arc::strong_count(s) == 2)
            && slot.try_lock().map(|g| g.is_none()).unwrap_or(false);
        if unused {
            slots.remove(correlation_id);
        }
    }

    async fn slot(&self, correlation_id: &str) -> Slot {
        let mut slots = self.slots.lock().await;
        Arc::clone(slots.entry(correlation_id.to_string()).or_default())
    }

    async fn read_stream<F>(
        &self,
        correlation_id: &str,
        timeout: Duration,
        deadline: Instant,
        cancel: &CancellationToken,
        on_event: &mut F,
    ) -> Outcome
    where
        F: FnMut(&OperationEvent) + Send,
    {
        let start = std::time::Instant::now();
        let expired = sleep_until(deadline);
        tokio::pin!(expired);

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(OperationError::Cancelled),
            _ = &mut expired => {
                tracing::warn!(correlation_id = %correlation_id, "Timed out opening event stream");
                return Err(OperationError::Timeout { after: timeout, last_message: None });
            }
            stream = self.api.subscribe(correlation_id) => stream?,
        };
        tracing::debug!(correlation_id = %correlation_id, "Subscribed to operation events");

        let mut last_message: Option<String> = None;
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(correlation_id = %correlation_id, "Operation wait cancelled");
                    return Err(OperationError::Cancelled);
                }
                _ = &mut expired => {
                    tracing::warn!(
                        correlation_id = %correlation_id,
                        timeout_secs = timeout.as_secs_f64(),
                        last_message = ?last_message,
                        "Operation timed out"
                    );
                    return Err(OperationError::Timeout { after: timeout, last_message });
                }
                next = stream.next() => next,
            };

            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    tracing::warn!(correlation_id = %correlation_id, error = %e, "Event stream failed");
                    let detail = match &last_message {
                        Some(m) => format!("{e} (last progress: {m})"),
                        None => e.to_string(),
                    };
                    return Err(OperationError::Transport(detail));
                }
                None => {
                    tracing::warn!(
                        correlation_id = %correlation_id,
                        last_message = ?last_message,
                        "Event stream ended before a terminal event"
                    );
                    return Err(OperationError::StreamEndedWithoutCompletion { last_message });
                }
            };

            on_event(&event);
            match event.kind {
                EventKind::Connected => {
                    tracing::debug!(correlation_id = %correlation_id, "Event stream connected");
                }
                EventKind::Progress => {
                    if let Some(message) = &event.message {
                        tracing::debug!(correlation_id = %correlation_id, message = %message, "Operation progress");
                        last_message = Some(message.clone());
                    }
                }
                _ => {}
            }

            if let Step::Done(outcome) = event.step(last_message.as_deref()) {
                tracing::info!(
                    correlation_id = %correlation_id,
                    ok = outcome.is_ok(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Operation finished"
                );
                return outcome;
            }
        }
    }
}
