//! Instrument session adapters
//!
//! This module defines the `InstrumentSession` trait, the only seam between the
//! controllers and the bus, plus its implementations:
//!
//! - [`VisaAdapter`]: GPIB/USB/LAN instruments through `visa-rs`
//!   (feature `instrument_visa`).
//! - [`MockAdapter`]: scripted responses with a shared command transcript,
//!   used by the tests and by the `--simulate` CLI mode.
//!
//! Every write and query is bounded by [`AdapterConfig::timeout_ms`]; an
//! operation that does not finish in time fails with `DaqError::Timeout`
//! instead of hanging the sweep.

pub mod mock;
pub mod visa_adapter;

pub use mock::{MockAdapter, Transcript};
pub use visa_adapter::VisaAdapter;

use crate::error::{AppResult, DaqError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Resource prefix that selects the simulated adapter in [`open_session`].
pub const MOCK_RESOURCE_PREFIX: &str = "MOCK";

/// Simulated address with nothing listening; opening it fails with `Connection`.
pub const MOCK_UNREACHABLE_RESOURCE: &str = "MOCK::UNREACHABLE";

/// Bus-level settings shared by every session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Upper bound for any single write or query, in milliseconds.
    pub timeout_ms: u64,
    /// Terminator appended to every command.
    pub write_terminator: String,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            write_terminator: "\n".to_string(),
        }
    }
}

impl AdapterConfig {
    /// Timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Open / write / query / close over one instrument address.
///
/// Implementations must not be shared between controllers; each controller
/// owns its session exclusively and drives it sequentially.
#[async_trait]
pub trait InstrumentSession: Send {
    /// The bus address this session was opened on.
    fn resource(&self) -> &str;

    /// Sends a command that produces no response.
    async fn write(&mut self, command: &str) -> AppResult<()>;

    /// Sends a command and returns the raw response text.
    async fn query(&mut self, command: &str) -> AppResult<String>;

    /// Closes the session. Further writes fail.
    async fn close(&mut self) -> AppResult<()>;
}

#[async_trait]
impl InstrumentSession for Box<dyn InstrumentSession> {
    fn resource(&self) -> &str {
        (**self).resource()
    }

    async fn write(&mut self, command: &str) -> AppResult<()> {
        (**self).write(command).await
    }

    async fn query(&mut self, command: &str) -> AppResult<String> {
        (**self).query(command).await
    }

    async fn close(&mut self) -> AppResult<()> {
        (**self).close().await
    }
}

/// Opens a session on `resource`.
///
/// Addresses starting with `MOCK` get a simulated adapter answering with
/// plausible readings, except [`MOCK_UNREACHABLE_RESOURCE`]; everything else
/// goes through VISA.
///
/// # Errors
/// `Connection` if the address cannot be opened.
pub async fn open_session(
    resource: &str,
    config: &AdapterConfig,
) -> AppResult<Box<dyn InstrumentSession>> {
    if resource == MOCK_UNREACHABLE_RESOURCE {
        return Err(DaqError::Connection(format!(
            "no instrument answers at '{}'",
            resource
        )));
    }
    if resource.starts_with(MOCK_RESOURCE_PREFIX) {
        return Ok(Box::new(
            MockAdapter::simulated(resource).with_timeout(config.timeout()),
        ));
    }
    let adapter = VisaAdapter::open(resource, config).await?;
    Ok(Box::new(adapter))
}

/// Runs one bus operation under `timeout`.
pub(crate) async fn bounded<T, F>(
    resource: &str,
    command: &str,
    timeout: Duration,
    operation: F,
) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    match tokio::time::timeout(timeout, operation).await {
        Ok(result) => result,
        Err(_) => Err(DaqError::Timeout(format!(
            "{} did not answer '{}' within {}ms",
            resource,
            command,
            timeout.as_millis()
        ))),
    }
}
