//! Testing utilities for users of the courier library.
//!
//! - [`ScriptedDispatcher`]: a dispatcher that plays back scripted outcomes
//!   and records every request it receives
//! - [`RecordingHandler`]: an event handler that captures events

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::core::job::HttpRequest;
use crate::events::{Event, EventHandler};
use crate::execution::{DispatchError, Dispatcher};

/// A dispatcher with scripted outcomes.
///
/// Outcomes are consumed in order; once the script is empty every call
/// returns the fallback outcome (HTTP 200 unless changed).
///
/// # Example
///
/// ```
/// use courier::testing::ScriptedDispatcher;
/// use courier::DispatchError;
///
/// // Fails twice with a 503, then succeeds.
/// let dispatcher = ScriptedDispatcher::failing(2, DispatchError::Status(503));
/// assert_eq!(dispatcher.call_count(), 0);
/// ```
pub struct ScriptedDispatcher {
    state: StdMutex<ScriptState>,
    fallback: Result<u16, DispatchError>,
    delay: Duration,
}

struct ScriptState {
    script: VecDeque<Result<u16, DispatchError>>,
    requests: Vec<HttpRequest>,
}

impl ScriptedDispatcher {
    /// A dispatcher that always answers HTTP 200.
    pub fn new() -> Self {
        Self {
            state: StdMutex::new(ScriptState {
                script: VecDeque::new(),
                requests: Vec::new(),
            }),
            fallback: Ok(200),
            delay: Duration::ZERO,
        }
    }

    /// A dispatcher that fails `times` times with `error`, then succeeds.
    pub fn failing(times: usize, error: DispatchError) -> Self {
        let dispatcher = Self::new();
        for _ in 0..times {
            dispatcher.push(Err(error.clone()));
        }
        dispatcher
    }

    /// A dispatcher that always fails with `error`.
    pub fn always_failing(error: DispatchError) -> Self {
        Self::new().with_fallback(Err(error))
    }

    /// Set the outcome returned once the script is used up.
    pub fn with_fallback(mut self, outcome: Result<u16, DispatchError>) -> Self {
        self.fallback = outcome;
        self
    }

    /// Sleep this long before answering each request.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Append an outcome to the script.
    pub fn push(&self, outcome: Result<u16, DispatchError>) {
        if let Ok(mut state) = self.state.lock() {
            state.script.push_back(outcome);
        }
    }

    /// Requests received so far, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.state
            .lock()
            .map(|s| s.requests.clone())
            .unwrap_or_default()
    }

    /// Number of dispatch calls so far.
    pub fn call_count(&self) -> usize {
        self.state.lock().map(|s| s.requests.len()).unwrap_or(0)
    }
}

impl Default for ScriptedDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dispatcher for ScriptedDispatcher {
    async fn dispatch(&self, request: &HttpRequest) -> Result<u16, DispatchError> {
        let outcome = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| DispatchError::Other("dispatcher lock poisoned".into()))?;
            state.requests.push(request.clone());
            state.script.pop_front()
        };
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        outcome.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Event handler that records every event it receives.
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events received so far.
    pub async fn events(&self) -> Vec<Event> {
        self.events.lock().await.clone()
    }

    /// Events matching a predicate.
    pub async fn matching<F>(&self, predicate: F) -> Vec<Event>
    where
        F: Fn(&Event) -> bool,
    {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect()
    }

    /// Number of events received.
    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    /// Whether no event was received.
    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events.lock().await.push(event.clone());
    }
}
