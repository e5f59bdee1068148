//! Scripted in-memory session.
//!
//! `MockAdapter` records every command it receives into a shared
//! [`Transcript`] and answers queries from scripted responses. Failures and
//! hangs can be injected per command to exercise error and timeout paths.

use super::{bounded, InstrumentSession};
use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Shared, cloneable record of the commands a [`MockAdapter`] received.
#[derive(Clone, Debug, Default)]
pub struct Transcript {
    commands: Arc<Mutex<Vec<String>>>,
}

impl Transcript {
    fn push(&self, command: &str) {
        self.commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(command.to_string());
    }

    /// All commands in the order they were sent.
    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Position of the first occurrence of `command`.
    pub fn position(&self, command: &str) -> Option<usize> {
        self.commands().iter().position(|c| c == command)
    }

    /// Forgets everything recorded so far.
    pub fn clear(&self) {
        self.commands
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

/// In-memory [`InstrumentSession`].
pub struct MockAdapter {
    resource: String,
    timeout: Duration,
    transcript: Transcript,
    queued: HashMap<String, VecDeque<String>>,
    defaults: HashMap<String, String>,
    fail_on: HashSet<String>,
    hang_on: HashSet<String>,
    closed: bool,
}

impl MockAdapter {
    /// Creates an adapter with no scripted responses.
    pub fn new(resource: &str) -> Self {
        Self {
            resource: resource.to_string(),
            timeout: Duration::from_secs(5),
            transcript: Transcript::default(),
            queued: HashMap::new(),
            defaults: HashMap::new(),
            fail_on: HashSet::new(),
            hang_on: HashSet::new(),
            closed: false,
        }
    }

    /// Adapter answering the LCR and analyzer queries with fixed readings.
    pub fn simulated(resource: &str) -> Self {
        Self::new(resource)
            .with_default_response("FETC?", "+1.00000E-12,+3.40000E+02\n")
            .with_default_response("RMD?", "+1.000E-06\n")
            .with_default_response("*IDN?", "Simulated Instrument,0,0,0\n")
    }

    /// Sets the per-operation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Queues a one-shot response for `query`. Queued responses are consumed
    /// in order before the default response is used.
    pub fn with_response(mut self, query: &str, response: &str) -> Self {
        self.queued
            .entry(query.to_string())
            .or_default()
            .push_back(response.to_string());
        self
    }

    /// Response returned for `query` whenever nothing is queued.
    pub fn with_default_response(mut self, query: &str, response: &str) -> Self {
        self.defaults
            .insert(query.to_string(), response.to_string());
        self
    }

    /// Makes every write or query of `command` fail with `Instrument`.
    pub fn fail_on(mut self, command: &str) -> Self {
        self.fail_on.insert(command.to_string());
        self
    }

    /// Makes `command` never complete, so it hits the timeout.
    pub fn hang_on(mut self, command: &str) -> Self {
        self.hang_on.insert(command.to_string());
        self
    }

    /// Handle to the commands received so far.
    pub fn transcript(&self) -> Transcript {
        self.transcript.clone()
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    async fn exchange(&mut self, command: &str, expects_response: bool) -> AppResult<String> {
        if self.closed {
            return Err(DaqError::Instrument(format!(
                "session '{}' is closed",
                self.resource
            )));
        }
        self.transcript.push(command);

        if self.hang_on.contains(command) {
            let resource = self.resource.clone();
            return bounded(&resource, command, self.timeout, async {
                std::future::pending::<AppResult<String>>().await
            })
            .await;
        }
        if self.fail_on.contains(command) {
            return Err(DaqError::Instrument(format!(
                "{} rejected '{}'",
                self.resource, command
            )));
        }
        if !expects_response {
            return Ok(String::new());
        }

        let queued = self
            .queued
            .get_mut(command)
            .and_then(|responses| responses.pop_front());
        queued
            .or_else(|| self.defaults.get(command).cloned())
            .ok_or_else(|| {
                DaqError::Instrument(format!(
                    "{} has no response for '{}'",
                    self.resource, command
                ))
            })
    }
}

#[async_trait]
impl InstrumentSession for MockAdapter {
    fn resource(&self) -> &str {
        &self.resource
    }

    async fn write(&mut self, command: &str) -> AppResult<()> {
        debug!("mock write {}: {}", self.resource, command);
        self.exchange(command, false).await.map(|_| ())
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        let response = self.exchange(command, true).await?;
        debug!("mock query {}: '{}' -> '{}'", self.resource, command, response.trim());
        Ok(response)
    }

    async fn close(&mut self) -> AppResult<()> {
        self.closed = true;
        Ok(())
    }
}
